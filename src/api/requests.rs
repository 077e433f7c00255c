use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{OperationKey, Outcome};

/// Request to look up a stored result or lock an operation key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotentOperationRequest {
    pub service: String,
    pub operation: String,
    pub idempotency_key: String,
}

impl IdempotentOperationRequest {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let errors = validate_key_fields(&self.service, &self.operation, &self.idempotency_key);
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    pub fn key(&self) -> OperationKey {
        OperationKey::new(&self.service, &self.operation, &self.idempotency_key)
    }
}

/// How the caller's execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedResult {
    Success,
    Failed,
}

/// Request to record the outcome of an operation executed under a lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResultRequest {
    pub lock_id: Uuid,
    pub service: String,
    pub operation: String,
    pub idempotency_key: String,
    pub execution_result: ReportedResult,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl OperationResultRequest {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = validate_key_fields(&self.service, &self.operation, &self.idempotency_key);
        if self.execution_result == ReportedResult::Success && self.result.is_none() {
            errors.push(ValidationError { field: "result".to_string(), message: "result is required for a successful execution".to_string() });
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    pub fn key(&self) -> OperationKey {
        OperationKey::new(&self.service, &self.operation, &self.idempotency_key)
    }

    pub fn outcome(&self) -> Outcome {
        match self.execution_result {
            ReportedResult::Success => {
                Outcome::Success(self.result.clone().unwrap_or(serde_json::Value::Null))
            }
            ReportedResult::Failed => Outcome::Failure(
                self.error_message
                    .clone()
                    .unwrap_or_else(|| "operation reported as failed".to_string()),
            ),
        }
    }
}

fn validate_key_fields(service: &str, operation: &str, idempotency_key: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if service.trim().is_empty() {
        errors.push(ValidationError { field: "service".to_string(), message: "service cannot be empty".to_string() });
    }
    if operation.trim().is_empty() {
        errors.push(ValidationError { field: "operation".to_string(), message: "operation cannot be empty".to_string() });
    }
    if idempotency_key.trim().is_empty() {
        errors.push(ValidationError { field: "idempotencyKey".to_string(), message: "idempotencyKey cannot be empty".to_string() });
    }
    errors
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}
