use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{ApiRateLimiter, DataFetcher, FetchError};
use crate::models::{Config, FundamentalsRecord, PriceRow};

const FUNDAMENTALS_MODULES: &str = "assetProfile,summaryDetail,defaultKeyStatistics";

/// Yahoo Finance client for daily bars and fundamentals snapshots
pub struct YahooClient {
    client: Client,
    base_url: Url,
    timeout: Duration,
    rate_limiter: ApiRateLimiter,
}

impl YahooClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent("Mozilla/5.0 (compatible; stock-ingest/0.1)")
            .build()?;

        let base_url = Url::parse(&config.yahoo_base_url)
            .map_err(|e| anyhow::anyhow!("invalid YAHOO_BASE_URL {}: {}", config.yahoo_base_url, e))?;

        Ok(Self {
            client,
            base_url,
            timeout: config.fetch_timeout,
            rate_limiter: ApiRateLimiter::new(config.rate_limit_per_minute),
        })
    }

    fn endpoint(&self, path: &str, ticker: &str) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::Transient(format!("base url cannot hold a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(path.split('/'))
            .push(ticker);
        Ok(url)
    }

    /// Make a rate limited GET request and decode the JSON body
    async fn make_request(&self, ticker: &str, url: Url) -> Result<Value, FetchError> {
        self.rate_limiter.wait().await;
        debug!("Making request to: {}", url);

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound(ticker.to_string())),
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(FetchError::RateLimited(format!("HTTP 429 for {}", ticker)))
            }
            s if !s.is_success() => {
                return Err(FetchError::Transient(format!("HTTP {} for {}", s, ticker)))
            }
            _ => {}
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Transient(e.to_string())
            }
        })?;
        debug!("API response received: {} bytes", body.len());

        serde_json::from_str(&body).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

/// Provider-level error object, e.g. `{"code": "Not Found", "description": ...}`
fn provider_error(ticker: &str, error: Option<&Value>) -> Option<FetchError> {
    let error = error.filter(|e| !e.is_null())?;
    let code = error.get("code").and_then(|c| c.as_str()).unwrap_or_default();
    let description = error
        .get("description")
        .and_then(|d| d.as_str())
        .unwrap_or(code);

    if code.eq_ignore_ascii_case("not found") {
        Some(FetchError::NotFound(ticker.to_string()))
    } else {
        Some(FetchError::Transient(format!("{}: {}", code, description)))
    }
}

fn series_value(series: Option<&Value>, index: usize) -> Option<f64> {
    series
        .and_then(|s| s.as_array())
        .and_then(|values| values.get(index))
        .and_then(|v| v.as_f64())
}

/// Parse a v8 chart payload into daily rows inside `[start, end]`
fn parse_chart(ticker: &str, body: &Value, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceRow>, FetchError> {
    let chart = body
        .get("chart")
        .ok_or_else(|| FetchError::Malformed("missing chart object".to_string()))?;

    if let Some(err) = provider_error(ticker, chart.get("error")) {
        return Err(err);
    }

    let result = chart
        .get("result")
        .and_then(|r| r.as_array())
        .and_then(|r| r.first())
        .ok_or_else(|| FetchError::Malformed("missing chart result".to_string()))?;

    // No timestamps means no bars in the window
    let Some(timestamps) = result.get("timestamp").and_then(|t| t.as_array()) else {
        return Ok(Vec::new());
    };

    let gmt_offset = result
        .get("meta")
        .and_then(|m| m.get("gmtoffset"))
        .and_then(|o| o.as_i64())
        .unwrap_or(0);

    let quote = result
        .get("indicators")
        .and_then(|i| i.get("quote"))
        .and_then(|q| q.as_array())
        .and_then(|q| q.first())
        .ok_or_else(|| FetchError::Malformed("missing quote indicators".to_string()))?;
    let adjclose = result
        .get("indicators")
        .and_then(|i| i.get("adjclose"))
        .and_then(|a| a.as_array())
        .and_then(|a| a.first())
        .and_then(|a| a.get("adjclose"));

    let mut rows = Vec::with_capacity(timestamps.len());
    for (index, timestamp) in timestamps.iter().enumerate() {
        let timestamp = timestamp
            .as_i64()
            .ok_or_else(|| FetchError::Malformed(format!("bad timestamp at index {}", index)))?;

        let Some(close) = series_value(quote.get("close"), index) else {
            continue;
        };

        let trade_date = DateTime::from_timestamp(timestamp + gmt_offset, 0)
            .ok_or_else(|| FetchError::Malformed(format!("timestamp out of range: {}", timestamp)))?
            .date_naive();
        if trade_date < start || trade_date > end {
            continue;
        }

        rows.push(PriceRow {
            ticker: ticker.to_string(),
            trade_date,
            open: series_value(quote.get("open"), index).unwrap_or(close),
            high: series_value(quote.get("high"), index).unwrap_or(close),
            low: series_value(quote.get("low"), index).unwrap_or(close),
            close,
            volume: quote
                .get("volume")
                .and_then(|v| v.as_array())
                .and_then(|v| v.get(index))
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            adjusted_close: series_value(adjclose, index).unwrap_or(close),
        });
    }

    Ok(rows)
}

/// Read a `{"raw": ..}` numeric field from the first module that has it
fn raw_number(result: &Value, modules: &[&str], field: &str) -> Option<f64> {
    modules.iter().find_map(|module| {
        result
            .get(*module)
            .and_then(|m| m.get(field))
            .and_then(|f| f.get("raw").or(Some(f)))
            .and_then(|v| v.as_f64())
    })
}

fn parse_quote_summary(ticker: &str, body: &Value, as_of_date: NaiveDate) -> Result<FundamentalsRecord, FetchError> {
    let summary = body
        .get("quoteSummary")
        .ok_or_else(|| FetchError::Malformed("missing quoteSummary object".to_string()))?;

    if let Some(err) = provider_error(ticker, summary.get("error")) {
        return Err(err);
    }

    let result = summary
        .get("result")
        .and_then(|r| r.as_array())
        .and_then(|r| r.first())
        .ok_or_else(|| FetchError::Malformed("missing quoteSummary result".to_string()))?;

    let profile_text = |field: &str| {
        result
            .get("assetProfile")
            .and_then(|p| p.get(field))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Ok(FundamentalsRecord {
        ticker: ticker.to_string(),
        as_of_date,
        sector: profile_text("sector"),
        industry: profile_text("industry"),
        market_cap: raw_number(result, &["summaryDetail", "price"], "marketCap"),
        trailing_pe: raw_number(result, &["summaryDetail"], "trailingPE"),
        forward_pe: raw_number(result, &["summaryDetail", "defaultKeyStatistics"], "forwardPE"),
        dividend_yield: raw_number(result, &["summaryDetail"], "dividendYield"),
        beta: raw_number(result, &["summaryDetail", "defaultKeyStatistics"], "beta"),
    })
}

#[async_trait]
impl DataFetcher for YahooClient {
    async fn fetch_prices(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceRow>, FetchError> {
        let period1 = start.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
        // period2 is exclusive, so extend it to the end of the last day
        let period2 = end.and_time(chrono::NaiveTime::MIN).and_utc().timestamp() + 86_400;

        let mut url = self.endpoint("v8/finance/chart", ticker)?;
        url.query_pairs_mut()
            .append_pair("period1", &period1.to_string())
            .append_pair("period2", &period2.to_string())
            .append_pair("interval", "1d")
            .append_pair("includeAdjustedClose", "true")
            .append_pair("events", "div,split");

        let body = self.make_request(ticker, url).await?;
        let rows = parse_chart(ticker, &body, start, end)?;

        debug!("Retrieved {} price bars for {} from {} to {}", rows.len(), ticker, start, end);
        Ok(rows)
    }

    async fn fetch_fundamentals(&self, ticker: &str) -> Result<FundamentalsRecord, FetchError> {
        let mut url = self.endpoint("v10/finance/quoteSummary", ticker)?;
        url.query_pairs_mut().append_pair("modules", FUNDAMENTALS_MODULES);

        let body = self.make_request(ticker, url).await?;
        parse_quote_summary(ticker, &body, Utc::now().date_naive())
    }
}
