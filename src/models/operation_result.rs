use super::{now_micros, Lock, LockGrant, OperationKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Canonical success payload for an operation key. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StoredResult {
    pub service: String,
    pub operation: String,
    pub idempotency_key: String,
    pub lock_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StoredResult {
    pub fn new(key: &OperationKey, lock_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            service: key.service.clone(),
            operation: key.operation.clone(),
            idempotency_key: key.idempotency_key.clone(),
            lock_id,
            payload,
            created_at: now_micros(),
        }
    }

    pub fn key(&self) -> OperationKey {
        OperationKey::new(&self.service, &self.operation, &self.idempotency_key)
    }
}

/// Why an attempt ended without a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "failure_kind", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The wrapped operation returned an error.
    OperationFailed,
    /// The lock expired before any terminal result was written.
    OperationExpired,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::OperationFailed => "OPERATION_FAILED",
            FailureKind::OperationExpired => "OPERATION_EXPIRED",
        }
    }
}

/// Terminal failure attributed to one lock. At most one per lock id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct FailedResult {
    pub lock_id: Uuid,
    pub service: String,
    pub operation: String,
    pub idempotency_key: String,
    pub error_message: String,
    #[sqlx(rename = "failure_kind")]
    pub kind: FailureKind,
    pub created_at: DateTime<Utc>,
}

impl FailedResult {
    pub fn operation_failed(grant: &LockGrant, error_message: impl Into<String>) -> Self {
        Self {
            lock_id: grant.lock_id,
            service: grant.key.service.clone(),
            operation: grant.key.operation.clone(),
            idempotency_key: grant.key.idempotency_key.clone(),
            error_message: error_message.into(),
            kind: FailureKind::OperationFailed,
            created_at: now_micros(),
        }
    }

    pub fn expired(lock: &Lock) -> Self {
        Self {
            lock_id: lock.lock_id,
            service: lock.service.clone(),
            operation: lock.operation.clone(),
            idempotency_key: lock.idempotency_key.clone(),
            error_message: format!("lock expired at {} without a result", lock.expired_at),
            kind: FailureKind::OperationExpired,
            created_at: now_micros(),
        }
    }

    pub fn key(&self) -> OperationKey {
        OperationKey::new(&self.service, &self.operation, &self.idempotency_key)
    }
}

/// What the lock holder reports when execution ends.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(serde_json::Value),
    Failure(String),
}

/// Authoritative terminal state observed in the result store.
#[derive(Debug, Clone, PartialEq)]
pub enum SettledOutcome {
    Success(serde_json::Value),
    Failure(FailedResult),
}

impl SettledOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SettledOutcome::Success(_))
    }
}
