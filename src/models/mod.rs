use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod progress;

pub use progress::{
    CoveredRange, DownloadState, ErrorKind, FailureInfo, ProgressRecord, StateCounts, StateKind,
    Transition, TransitionError,
};

/// A listed security known to the ticker registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub name: Option<String>,
    pub exchange: String,
    pub active: bool,
}

impl Ticker {
    pub fn new(symbol: &str, exchange: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            name: None,
            exchange: exchange.to_string(),
            active: true,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// One daily bar for a ticker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub ticker: String,
    pub trade_date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub adjusted_close: f64,
}

/// Fundamentals snapshot for a ticker as of a given date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalsRecord {
    pub ticker: String,
    pub as_of_date: NaiveDate,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub market_cap: Option<f64>,
    pub trailing_pe: Option<f64>,
    pub forward_pe: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub beta: Option<f64>,
}

impl FundamentalsRecord {
    pub fn empty(ticker: &str, as_of_date: NaiveDate) -> Self {
        Self {
            ticker: ticker.to_string(),
            as_of_date,
            sector: None,
            industry: None,
            market_cap: None,
            trailing_pe: None,
            forward_pe: None,
            dividend_yield: None,
            beta: None,
        }
    }

    /// True when the provider returned no usable metric at all
    pub fn is_empty(&self) -> bool {
        self.sector.is_none()
            && self.industry.is_none()
            && self.market_cap.is_none()
            && self.trailing_pe.is_none()
            && self.forward_pe.is_none()
            && self.dividend_yield.is_none()
            && self.beta.is_none()
    }
}

/// Inclusive date window requested from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

/// Final (or current) status of an orchestrator run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithFailures,
    Aborted,
    Cancelled,
    /// Found still `running` at startup: the process died mid-run
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithFailures => "completed_with_failures",
            RunStatus::Aborted => "aborted",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "completed_with_failures" => Ok(RunStatus::CompletedWithFailures),
            "aborted" => Ok(RunStatus::Aborted),
            "cancelled" => Ok(RunStatus::Cancelled),
            "interrupted" => Ok(RunStatus::Interrupted),
            other => Err(anyhow::anyhow!("unknown run status: {}", other)),
        }
    }
}

/// Audit row for one orchestrator run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub mode: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched: i64,
    pub skipped: i64,
    pub failed: i64,
    pub empty: i64,
    pub rows_written: i64,
}

/// Backoff shape between in-run attempts on the same ticker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl std::str::FromStr for BackoffKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" | "exp" => Ok(BackoffKind::Exponential),
            other => Err(anyhow::anyhow!("unknown backoff kind: {}", other)),
        }
    }
}

/// Configuration for the application
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub yahoo_base_url: String,
    pub nasdaq_listed_url: String,
    pub other_listed_url: String,
    pub sec_tickers_url: String,
    pub sec_user_agent: String,
    pub backfill_start: NaiveDate,
    pub fetch_timeout: Duration,
    pub pacing: Duration,
    pub max_workers: usize,
    pub rate_limit_per_minute: u32,
    pub retry_backoff: BackoffKind,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub max_in_run_attempts: u32,
    pub max_attempts: u32,
    pub fundamentals_max_age_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: "data/stock_ingest.db".to_string(),
            yahoo_base_url: "https://query1.finance.yahoo.com".to_string(),
            nasdaq_listed_url: "https://www.nasdaqtrader.com/dynamic/SymDir/nasdaqlisted.txt"
                .to_string(),
            other_listed_url: "https://www.nasdaqtrader.com/dynamic/SymDir/otherlisted.txt"
                .to_string(),
            sec_tickers_url: "https://www.sec.gov/files/company_tickers.json".to_string(),
            sec_user_agent: "stock-ingest admin@example.com".to_string(),
            backfill_start: NaiveDate::from_ymd_opt(1980, 1, 1).unwrap_or_default(),
            fetch_timeout: Duration::from_secs(30),
            pacing: Duration::from_millis(250),
            max_workers: 4,
            rate_limit_per_minute: 120,
            retry_backoff: BackoffKind::Exponential,
            retry_base_delay: Duration::from_millis(5_000),
            retry_max_delay: Duration::from_millis(60_000),
            max_in_run_attempts: 3,
            max_attempts: 5,
            fundamentals_max_age_days: 7,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        let defaults = Config::default();

        Ok(Config {
            database_path: std::env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            yahoo_base_url: std::env::var("YAHOO_BASE_URL").unwrap_or(defaults.yahoo_base_url),
            nasdaq_listed_url: std::env::var("NASDAQ_LISTED_URL")
                .unwrap_or(defaults.nasdaq_listed_url),
            other_listed_url: std::env::var("OTHER_LISTED_URL")
                .unwrap_or(defaults.other_listed_url),
            sec_tickers_url: std::env::var("SEC_TICKERS_URL").unwrap_or(defaults.sec_tickers_url),
            sec_user_agent: std::env::var("SEC_USER_AGENT").unwrap_or(defaults.sec_user_agent),
            backfill_start: match std::env::var("BACKFILL_START") {
                Ok(value) => NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
                    .map_err(|e| anyhow::anyhow!("BACKFILL_START must be YYYY-MM-DD: {}", e))?,
                Err(_) => defaults.backfill_start,
            },
            fetch_timeout: Duration::from_secs(env_parse(
                "FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )?),
            pacing: Duration::from_millis(env_parse("PACING_MS", defaults.pacing.as_millis() as u64)?),
            max_workers: env_parse("MAX_WORKERS", defaults.max_workers)?.max(1),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute)?,
            retry_backoff: env_parse("RETRY_BACKOFF", defaults.retry_backoff)?,
            retry_base_delay: Duration::from_millis(env_parse(
                "RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )?),
            retry_max_delay: Duration::from_millis(env_parse(
                "RETRY_MAX_DELAY_MS",
                defaults.retry_max_delay.as_millis() as u64,
            )?),
            max_in_run_attempts: env_parse("MAX_IN_RUN_ATTEMPTS", defaults.max_in_run_attempts)?
                .max(1),
            max_attempts: env_parse("MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
            fundamentals_max_age_days: env_parse(
                "FUNDAMENTALS_MAX_AGE_DAYS",
                defaults.fundamentals_max_age_days,
            )?,
        })
    }
}

/// Parse an optional environment variable, falling back to a default when unset
fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {} ({})", key, value, e)),
        Err(_) => Ok(default),
    }
}
