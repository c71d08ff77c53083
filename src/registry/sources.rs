use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::ListingSource;
use crate::models::{Config, Ticker};

fn http_client(config: &Config, user_agent: &str) -> Result<Client> {
    Ok(Client::builder()
        .timeout(config.fetch_timeout)
        .user_agent(user_agent)
        .build()?)
}

/// Map NASDAQ Trader exchange codes to display names
fn exchange_name(code: &str) -> String {
    match code {
        "A" => "NYSE American".to_string(),
        "N" => "NYSE".to_string(),
        "P" => "NYSE Arca".to_string(),
        "Z" => "Cboe BZX".to_string(),
        "V" => "IEX".to_string(),
        other => other.to_string(),
    }
}

/// Parse one pipe-delimited NASDAQ Trader symbol directory file.
///
/// `exchange_column` is `None` for `nasdaqlisted.txt`, where every row is NASDAQ.
pub(crate) fn parse_symbol_directory(
    body: &str,
    symbol_column: &str,
    exchange_column: Option<&str>,
) -> Result<Vec<Ticker>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'|')
        .flexible(true)
        .from_reader(body.as_bytes());

    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| anyhow!("symbol directory is missing column '{}'", name))
    };
    let symbol_idx = column(symbol_column)?;
    let name_idx = column("Security Name")?;
    let exchange_idx = exchange_column.map(column).transpose()?;

    let mut tickers = Vec::new();
    for record in reader.records() {
        let record = record?;
        let Some(symbol) = record.get(symbol_idx).map(str::trim) else {
            continue;
        };
        if symbol.is_empty() || symbol.starts_with("File Creation Time") {
            continue;
        }
        let Some(name) = record.get(name_idx).map(str::trim) else {
            continue;
        };

        let exchange = match exchange_idx {
            Some(idx) => match record.get(idx) {
                Some(code) => exchange_name(code.trim()),
                None => continue,
            },
            None => "NASDAQ".to_string(),
        };

        tickers.push(Ticker::new(symbol, &exchange).with_name(name));
    }

    Ok(tickers)
}

/// NASDAQ Trader symbol directories (`nasdaqlisted.txt` + `otherlisted.txt`)
pub struct NasdaqTraderSource {
    client: Client,
    nasdaq_listed_url: String,
    other_listed_url: String,
}

impl NasdaqTraderSource {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: http_client(config, "stock-ingest/0.1")?,
            nasdaq_listed_url: config.nasdaq_listed_url.clone(),
            other_listed_url: config.other_listed_url.clone(),
        })
    }

    async fn download(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("bad status from {}", url))?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl ListingSource for NasdaqTraderSource {
    fn name(&self) -> &'static str {
        "NASDAQ Trader"
    }

    async fn fetch_listing(&self) -> Result<Vec<Ticker>> {
        let nasdaq = self.download(&self.nasdaq_listed_url).await?;
        let mut tickers = parse_symbol_directory(&nasdaq, "Symbol", None)?;

        let other = self.download(&self.other_listed_url).await?;
        tickers.extend(parse_symbol_directory(&other, "ACT Symbol", Some("Exchange"))?);

        debug!("NASDAQ Trader listing has {} symbols", tickers.len());
        Ok(tickers)
    }
}

/// SEC EDGAR `company_tickers.json`, used when NASDAQ Trader is unavailable
pub struct SecEdgarSource {
    client: Client,
    url: String,
}

impl SecEdgarSource {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            // SEC rejects requests without a contact user agent
            client: http_client(config, &config.sec_user_agent)?,
            url: config.sec_tickers_url.clone(),
        })
    }
}

pub(crate) fn parse_sec_tickers(body: &Value) -> Result<Vec<Ticker>> {
    let entries = body
        .as_object()
        .ok_or_else(|| anyhow!("SEC ticker file is not a JSON object"))?;

    let mut tickers = Vec::with_capacity(entries.len());
    for entry in entries.values() {
        let symbol = entry.get("ticker").and_then(|t| t.as_str());
        let title = entry.get("title").and_then(|t| t.as_str());
        if let (Some(symbol), Some(title)) = (symbol, title) {
            tickers.push(Ticker::new(symbol.trim(), "UNKNOWN").with_name(title.trim()));
        }
    }
    Ok(tickers)
}

#[async_trait]
impl ListingSource for SecEdgarSource {
    fn name(&self) -> &'static str {
        "SEC EDGAR"
    }

    async fn fetch_listing(&self) -> Result<Vec<Ticker>> {
        let body: Value = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.url))?
            .error_for_status()?
            .json()
            .await
            .context("SEC ticker file is not valid JSON")?;

        parse_sec_tickers(&body)
    }
}
