use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{LockGrant, SettledOutcome};

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ErrorResponse) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Option<Vec<ValidationErrorDetail>>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Vec<ValidationErrorDetail>) -> Self {
        self.details = Some(details);
        self
    }
}

/// Validation error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorDetail {
    pub field: String,
    pub message: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
}

/// What happened to an idempotent operation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionResult {
    Success,
    OperationLockedSuccessfully,
    OperationAlreadyLocked,
    OperationExpired,
    OperationFailed,
}

/// Operation response DTO.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub execution_result: ExecutionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl OperationResponse {
    pub fn cached(payload: serde_json::Value) -> Self {
        Self {
            execution_result: ExecutionResult::Success,
            lock_id: None,
            locked_at: None,
            expired_at: None,
            result: Some(payload),
            error_message: None,
        }
    }

    pub fn locked(grant: &LockGrant) -> Self {
        Self {
            execution_result: ExecutionResult::OperationLockedSuccessfully,
            lock_id: Some(grant.lock_id),
            locked_at: Some(grant.locked_at),
            expired_at: Some(grant.expired_at),
            result: None,
            error_message: None,
        }
    }
}

impl From<SettledOutcome> for OperationResponse {
    fn from(outcome: SettledOutcome) -> Self {
        match outcome {
            SettledOutcome::Success(payload) => Self::cached(payload),
            SettledOutcome::Failure(failure) => Self {
                execution_result: ExecutionResult::OperationFailed,
                lock_id: Some(failure.lock_id),
                locked_at: None,
                expired_at: None,
                result: None,
                error_message: Some(failure.error_message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cached_response_shape() {
        let body = serde_json::to_value(OperationResponse::cached(json!({"chargeId": "ch_1"}))).unwrap();
        assert_eq!(
            body,
            json!({"executionResult": "SUCCESS", "result": {"chargeId": "ch_1"}})
        );
    }

    #[test]
    fn test_execution_result_wire_names() {
        assert_eq!(
            serde_json::to_value(ExecutionResult::OperationLockedSuccessfully).unwrap(),
            json!("OPERATION_LOCKED_SUCCESSFULLY")
        );
    }
}
