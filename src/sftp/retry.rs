//! Retry with exponential backoff
//!
//! Used by `connect`: failures the predicate marks fatal stop immediately,
//! everything else is retried up to `retries` more times.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::ssh::ConnectConfig;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub retries: usize,

    /// Delay before the first retry, in milliseconds
    pub min_timeout_ms: u64,

    /// Backoff multiplier for each retry
    pub factor: f64,

    /// Maximum delay between attempts, in milliseconds
    pub max_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 1,
            min_timeout_ms: 1000,
            factor: 2.0,
            max_timeout_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn new(retries: usize) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }

    /// Set custom backoff parameters
    pub fn with_backoff(mut self, min_timeout_ms: u64, factor: f64, max_timeout_ms: u64) -> Self {
        self.min_timeout_ms = min_timeout_ms;
        self.factor = factor;
        self.max_timeout_ms = max_timeout_ms;
        self
    }

    pub fn total_attempts(&self) -> usize {
        self.retries + 1
    }
}

impl From<&ConnectConfig> for RetryConfig {
    fn from(config: &ConnectConfig) -> Self {
        Self {
            retries: config.retries,
            min_timeout_ms: config.retry_min_timeout_ms,
            factor: config.retry_factor,
            max_timeout_ms: config.retry_max_timeout_ms,
        }
    }
}

/// Delay before retry number `attempt` (0-based).
///
/// Factors below 1 are treated as 1 so delays never shrink.
pub fn calculate_backoff(attempt: usize, config: &RetryConfig) -> Duration {
    let factor = config.factor.max(1.0);
    let delay_ms = (config.min_timeout_ms as f64 * factor.powi(attempt as i32))
        .min(config.max_timeout_ms.max(config.min_timeout_ms) as f64);

    Duration::from_millis(delay_ms as u64)
}

/// Run `op` until it succeeds, fails fatally, or attempts run out.
///
/// `op` receives the 0-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    label: &str,
    is_fatal: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let total = config.total_attempts();
    let mut attempt = 0;

    loop {
        info!("{} attempt {}/{}", label, attempt + 1, total);

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if is_fatal(&e) => {
                warn!("{} failed with non-retryable error: {}", label, e);
                return Err(e);
            }
            Err(e) if attempt + 1 >= total => {
                warn!("{} failed after {} attempts: {}", label, total, e);
                return Err(e);
            }
            Err(e) => {
                let delay = calculate_backoff(attempt, config);
                info!("{} failed, retrying in {:?}: {}", label, delay, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
