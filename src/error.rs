use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// No policy is registered for the (service, operation) pair.
    #[error("No idempotency configuration registered for {service}/{operation}")]
    ConfigurationMissing { service: String, operation: String },

    /// Another caller holds an unexpired lock for the same key.
    #[error("Operation is already locked by another process until {expires_at}")]
    OperationInProgress { expires_at: DateTime<Utc> },

    /// A previous attempt expired without a result and the policy forbids re-execution.
    #[error("Operation lock {lock_id} expired at {expired_at} without a recorded result")]
    ExpiredWithoutResult {
        lock_id: Uuid,
        expired_at: DateTime<Utc>,
    },

    /// A previous attempt recorded a terminal failure.
    #[error("Operation failed: {message}")]
    OperationFailed { lock_id: Uuid, message: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Returns true for store errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Redis(_) | AppError::StoreUnavailable(_)
        )
    }

    /// Stable machine-readable code, shared by logs and the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) | AppError::Redis(_) | AppError::StoreUnavailable(_) => {
                "STORE_UNAVAILABLE"
            }
            AppError::Serialization(_) | AppError::Config(_) | AppError::Internal(_) => {
                "INTERNAL_ERROR"
            }
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::ConfigurationMissing { .. } => "CONFIGURATION_MISSING",
            AppError::OperationInProgress { .. } => "OPERATION_ALREADY_LOCKED",
            AppError::ExpiredWithoutResult { .. } => "OPERATION_EXPIRED",
            AppError::OperationFailed { .. } => "OPERATION_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
