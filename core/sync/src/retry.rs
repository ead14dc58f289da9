//! Exponential backoff for remote calls that fail transiently.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use waypoint_common::{Error, Result};

/// Backoff policy for one remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in [0.75, 1.25).
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let millis = if self.jitter {
            capped * rand::thread_rng().gen_range(0.75..1.25)
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Runs an operation, retrying transient failures per [`RetryConfig`].
///
/// Only errors for which [`Error::is_transient`] holds are retried; storage
/// and input errors are returned on the first occurrence.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, fails permanently or runs out of
    /// retries. `label` names the operation in logs.
    pub async fn execute<F, Fut, T>(&self, label: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{} succeeded after {} retries", label, attempt);
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    if attempt >= self.config.max_retries {
                        warn!("{} failed after {} attempts: {}", label, attempt + 1, err);
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        "{} attempt {} failed: {}. Retrying in {:?}",
                        label, attempt, err, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Wrap a non-transient failure so callers can tell it apart in logs.
pub(crate) fn describe(err: &Error) -> String {
    if err.is_transient() {
        err.to_string()
    } else {
        format!("{} (not retried)", err)
    }
}
