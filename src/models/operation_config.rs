use crate::error::{AppError, Result};
use chrono::Duration;

/// Longest lock an operation may be configured with, in milliseconds (one day).
pub const MAX_LOCK_DURATION_MS: i64 = 86_400_000;

/// Idempotency policy for one (service, operation) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationConfig {
    pub service: String,
    pub operation: String,
    /// How long an acquired lock grants exclusive execution.
    pub lock_duration: Duration,
    /// Whether an attempt that expired or failed without a stored success may be re-executed.
    pub allow_save_on_expired: bool,
}

impl OperationConfig {
    pub fn new(
        service: impl Into<String>,
        operation: impl Into<String>,
        lock_duration: Duration,
        allow_save_on_expired: bool,
    ) -> Result<Self> {
        let config = Self {
            service: service.into(),
            operation: operation.into(),
            lock_duration,
            allow_save_on_expired,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() || self.operation.trim().is_empty() {
            return Err(AppError::Validation(
                "service and operation are required".to_string(),
            ));
        }
        if self.lock_duration <= Duration::zero() {
            return Err(AppError::Validation(format!(
                "lock duration for {}/{} must be positive",
                self.service, self.operation
            )));
        }
        if self.lock_duration > Duration::milliseconds(MAX_LOCK_DURATION_MS) {
            return Err(AppError::Validation(format!(
                "lock duration for {}/{} exceeds {} ms",
                self.service, self.operation, MAX_LOCK_DURATION_MS
            )));
        }
        Ok(())
    }

    pub fn lock_duration_ms(&self) -> i64 {
        self.lock_duration.num_milliseconds()
    }
}
