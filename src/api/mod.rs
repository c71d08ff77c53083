use async_trait::async_trait;
use chrono::NaiveDate;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

use crate::models::{ErrorKind, FundamentalsRecord, PriceRow};

pub mod yahoo_client;
pub use yahoo_client::YahooClient;

/// Errors surfaced by a data provider
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    #[error("{0} not found at provider")]
    NotFound(String),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Persisted classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::NotFound(_) => ErrorKind::NotFound,
            FetchError::RateLimited(_) => ErrorKind::RateLimited,
            FetchError::Timeout(_) | FetchError::Transient(_) | FetchError::Malformed(_) => {
                ErrorKind::Transient
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Provider of daily prices and fundamentals snapshots.
///
/// An empty `Vec` from `fetch_prices` means "no data for this window" and is
/// a success, distinct from `FetchError::NotFound`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch_prices(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceRow>, FetchError>;

    async fn fetch_fundamentals(&self, ticker: &str) -> Result<FundamentalsRecord, FetchError>;
}

/// Provider-side request quota shared by every worker of a client
pub struct ApiRateLimiter {
    limiter: DefaultDirectRateLimiter,
}

impl ApiRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let per_minute = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        }
    }

    pub async fn wait(&self) {
        self.limiter.until_ready().await;
    }
}
