use crate::error::{AppError, Result};
use crate::observability::{get_metrics, LatencyTimer};
use std::future::Future;
use std::time::Duration;

/// Exponential backoff for store calls that fail transiently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that surfaces the first failure.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2_u32.saturating_pow(attempt);
        let candidate = self.base_delay.checked_mul(exp).unwrap_or(self.max_delay);
        self.max_delay.min(candidate)
    }

    /// Runs `call`, retrying transient errors. Once the budget is spent the
    /// last error is surfaced as `StoreUnavailable`; other errors pass through.
    pub async fn run<T, F, Fut>(&self, label: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let timer = LatencyTimer::new();
            match call().await {
                Ok(value) => {
                    get_metrics().record_store_call(label, timer.elapsed_ms(), true);
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    get_metrics().record_store_call(label, timer.elapsed_ms(), false);
                    if attempt >= self.max_retries {
                        tracing::error!(call = label, attempts = attempt + 1, "Store call failed: {}", e);
                        return Err(match e {
                            AppError::StoreUnavailable(_) => e,
                            other => AppError::StoreUnavailable(format!("{}: {}", label, other)),
                        });
                    }

                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        call = label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Transient store error, retrying: {}",
                        e
                    );
                    get_metrics().record_store_retry(label);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
