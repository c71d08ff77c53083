//! In-memory data fetcher driven by per-ticker scripts

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::test_data;
use stock_ingest::api::{DataFetcher, FetchError};
use stock_ingest::models::{DateRange, FundamentalsRecord, PriceRow};

/// One scripted answer
#[derive(Debug, Clone)]
pub enum Script {
    /// Return exactly these rows
    Rows(Vec<PriceRow>),
    /// One row per trading day of the requested window
    Generate,
    Fail(FetchError),
    /// Never answer within any sane timeout
    Hang,
}

/// Scripted answers are consumed in order per ticker; once a ticker's queue
/// is empty its fallback (default `Generate`) answers every further call.
#[derive(Default)]
pub struct ScriptedFetcher {
    queued: Mutex<HashMap<String, VecDeque<Script>>>,
    fallbacks: Mutex<HashMap<String, Script>>,
    price_calls: Mutex<Vec<(String, DateRange)>>,
    fundamentals: Mutex<HashMap<String, Result<FundamentalsRecord, FetchError>>>,
    fundamentals_calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(self, ticker: &str, scripts: Vec<Script>) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(ticker.to_string())
            .or_default()
            .extend(scripts);
        self
    }

    pub fn always(self, ticker: &str, script: Script) -> Self {
        self.fallbacks.lock().unwrap().insert(ticker.to_string(), script);
        self
    }

    pub fn fundamentals(self, ticker: &str, answer: Result<FundamentalsRecord, FetchError>) -> Self {
        self.fundamentals.lock().unwrap().insert(ticker.to_string(), answer);
        self
    }

    pub fn price_calls_for(&self, ticker: &str) -> usize {
        self.price_calls.lock().unwrap().iter().filter(|(t, _)| t == ticker).count()
    }

    pub fn total_price_calls(&self) -> usize {
        self.price_calls.lock().unwrap().len()
    }

    pub fn windows_for(&self, ticker: &str) -> Vec<DateRange> {
        self.price_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == ticker)
            .map(|(_, w)| *w)
            .collect()
    }

    pub fn fundamentals_calls(&self) -> Vec<String> {
        self.fundamentals_calls.lock().unwrap().clone()
    }

    fn next_script(&self, ticker: &str) -> Script {
        if let Some(script) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(ticker)
            .and_then(VecDeque::pop_front)
        {
            return script;
        }
        self.fallbacks
            .lock()
            .unwrap()
            .get(ticker)
            .cloned()
            .unwrap_or(Script::Generate)
    }
}

#[async_trait]
impl DataFetcher for ScriptedFetcher {
    async fn fetch_prices(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceRow>, FetchError> {
        let window = DateRange::new(start, end);
        self.price_calls.lock().unwrap().push((ticker.to_string(), window));

        match self.next_script(ticker) {
            Script::Rows(rows) => Ok(rows),
            Script::Generate => Ok(test_data::trading_day_rows(ticker, window)),
            Script::Fail(error) => Err(error),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn fetch_fundamentals(&self, ticker: &str) -> Result<FundamentalsRecord, FetchError> {
        self.fundamentals_calls.lock().unwrap().push(ticker.to_string());
        self.fundamentals
            .lock()
            .unwrap()
            .get(ticker)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::NotFound(ticker.to_string())))
    }
}
