//! In-run retry spacing and pacing between fetcher calls

use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::models::{BackoffKind, Config};

/// How waits are performed. Tokio sleep in production; tests substitute a
/// no-op or recording implementation so they run instantly.
#[async_trait]
pub trait DelayPolicy: Send + Sync {
    async fn wait(&self, duration: Duration);
}

pub struct TokioDelay;

#[async_trait]
impl DelayPolicy for TokioDelay {
    async fn wait(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

pub struct NoDelay;

#[async_trait]
impl DelayPolicy for NoDelay {
    async fn wait(&self, _duration: Duration) {}
}

/// Records requested waits without sleeping
#[derive(Default)]
pub struct RecordingDelay {
    waits: StdMutex<Vec<Duration>>,
}

impl RecordingDelay {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DelayPolicy for RecordingDelay {
    async fn wait(&self, duration: Duration) {
        if let Ok(mut waits) = self.waits.lock() {
            waits.push(duration);
        }
    }
}

/// Spacing between in-run attempts on the same ticker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: BackoffKind,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fetcher invocations allowed per ticker per run, first try included
    pub max_in_run_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backoff: config.retry_backoff,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            max_in_run_attempts: config.max_in_run_attempts.max(1),
        }
    }

    /// Wait before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = match self.backoff {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Minimum spacing between consecutive fetcher calls, shared by all workers
pub struct Pacer {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until `interval` has passed since the previous call, then claim the slot
    pub async fn wait(&self, delay: &dyn DelayPolicy) {
        let mut last_call = self.last_call.lock().await;
        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                delay.wait(self.interval - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}
