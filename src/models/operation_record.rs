use super::{now_micros, OperationKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Append-only audit entry for an execution attempt. Not consulted for dedup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct OperationRecord {
    pub id: Uuid,
    pub service: String,
    pub operation: String,
    pub idempotency_key: String,
    pub lock_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl OperationRecord {
    pub fn new(key: &OperationKey, lock_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            service: key.service.clone(),
            operation: key.operation.clone(),
            idempotency_key: key.idempotency_key.clone(),
            lock_id,
            created_at: now_micros(),
        }
    }

    pub fn key(&self) -> OperationKey {
        OperationKey::new(&self.service, &self.operation, &self.idempotency_key)
    }
}
