use super::OperationKey;
use crate::error::{AppError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Short-lived reservation whose uniqueness on (service, operation, idempotency_key)
/// provides mutual exclusion. Removed by TTL at or after `expired_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub service: String,
    pub operation: String,
    pub idempotency_key: String,
    pub lock_id: Uuid,
    pub locked_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(key: &OperationKey, locked_at: DateTime<Utc>, lock_duration: Duration) -> Result<Self> {
        Ok(Self {
            service: key.service.clone(),
            operation: key.operation.clone(),
            idempotency_key: key.idempotency_key.clone(),
            lock_id: Uuid::new_v4(),
            locked_at,
            expired_at: expiry_after(locked_at, lock_duration)?,
        })
    }

    pub fn key(&self) -> OperationKey {
        OperationKey::new(&self.service, &self.operation, &self.idempotency_key)
    }

    /// Logically stale even if the store has not reaped it yet.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expired_at
    }

    pub fn grant(&self) -> LockGrant {
        LockGrant {
            lock_id: self.lock_id,
            key: self.key(),
            locked_at: self.locked_at,
            expired_at: self.expired_at,
        }
    }
}

/// `start + lock_duration`, rejecting durations past the representable range.
pub fn expiry_after(start: DateTime<Utc>, lock_duration: Duration) -> Result<DateTime<Utc>> {
    start.checked_add_signed(lock_duration).ok_or_else(|| {
        AppError::Validation(format!(
            "lock duration of {} ms overflows the expiry timestamp",
            lock_duration.num_milliseconds()
        ))
    })
}

/// Durable lock record, kept for audit and failure attribution after the
/// reservation disappears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Lock {
    pub lock_id: Uuid,
    pub service: String,
    pub operation: String,
    pub idempotency_key: String,
    pub locked_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Lock {
    pub fn from_reservation(reservation: &Reservation) -> Self {
        Self {
            lock_id: reservation.lock_id,
            service: reservation.service.clone(),
            operation: reservation.operation.clone(),
            idempotency_key: reservation.idempotency_key.clone(),
            locked_at: reservation.locked_at,
            expired_at: reservation.expired_at,
            released_at: None,
        }
    }

    pub fn key(&self) -> OperationKey {
        OperationKey::new(&self.service, &self.operation, &self.idempotency_key)
    }

    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }

    /// Unreleased and unexpired.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_released() && now < self.expired_at
    }

    /// Rebuilds the exact reservation this lock was acquired with.
    pub fn reservation(&self) -> Reservation {
        Reservation {
            service: self.service.clone(),
            operation: self.operation.clone(),
            idempotency_key: self.idempotency_key.clone(),
            lock_id: self.lock_id,
            locked_at: self.locked_at,
            expired_at: self.expired_at,
        }
    }

    pub fn grant(&self) -> LockGrant {
        self.reservation().grant()
    }
}

/// Ownership token handed to the caller that won the reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockGrant {
    pub lock_id: Uuid,
    pub key: OperationKey,
    pub locked_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl LockGrant {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expired_at
    }
}
