use crate::error::Result;
use crate::idempotency::retry::RetryPolicy;
use crate::models::{now_micros, Lock, LockGrant, OperationKey, OperationRecord, Reservation};
use crate::observability::mask_sensitive;
use crate::repositories::{InsertOutcome, LockStore, ReservationStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Result of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Acquired(LockGrant),
    /// Another reservation holds the key. It may already be logically expired.
    Conflict(Reservation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Released earlier, or by the reaper after expiry.
    AlreadyReleased,
    NotFound,
}

/// Acquires, reclaims and releases per-key locks. The reservation's unique
/// insert is the only mutual-exclusion primitive; the durable lock record is
/// written after it for audit and failure attribution.
pub struct LockManager {
    reservations: Arc<dyn ReservationStore>,
    locks: Arc<dyn LockStore>,
    retry: RetryPolicy,
}

impl LockManager {
    pub fn new(
        reservations: Arc<dyn ReservationStore>,
        locks: Arc<dyn LockStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            reservations,
            locks,
            retry,
        }
    }

    pub async fn try_acquire(&self, key: &OperationKey, lock_duration: Duration) -> Result<AcquireOutcome> {
        let reservation = Reservation::new(key, now_micros(), lock_duration)?;

        let inserted = self
            .retry
            .run("insert_reservation", || self.reservations.insert_unique(&reservation))
            .await?;

        match inserted {
            InsertOutcome::Inserted => {}
            // A retried insert whose first attempt landed reports our own reservation.
            InsertOutcome::Duplicate(holder) if holder.lock_id == reservation.lock_id => {}
            InsertOutcome::Duplicate(holder) => {
                tracing::debug!(
                    service = %key.service,
                    operation = %key.operation,
                    holder_lock_id = %holder.lock_id,
                    "Reservation already held"
                );
                return Ok(AcquireOutcome::Conflict(holder));
            }
        }

        let lock = Lock::from_reservation(&reservation);
        if let Err(e) = self
            .retry
            .run("insert_lock", || self.locks.insert_lock(&lock))
            .await
        {
            // Without a durable lock the grant cannot be released or attributed.
            if let Err(cleanup) = self.reservations.delete_if_matches(&reservation).await {
                tracing::error!(lock_id = %reservation.lock_id, "Failed to roll back reservation: {}", cleanup);
            }
            return Err(e);
        }

        tracing::info!(
            service = %key.service,
            operation = %key.operation,
            key = %mask_sensitive(&key.idempotency_key, 4),
            lock_id = %lock.lock_id,
            expired_at = %lock.expired_at,
            "Lock acquired"
        );

        Ok(AcquireOutcome::Acquired(reservation.grant()))
    }

    /// Removes a logically expired reservation by its exact identity and
    /// tries again. If a third party already replaced it, the fresh holder is
    /// reported as a conflict.
    pub async fn reclaim_stale(&self, stale: &Reservation, lock_duration: Duration) -> Result<AcquireOutcome> {
        let removed = self
            .retry
            .run("delete_reservation", || self.reservations.delete_if_matches(stale))
            .await?;

        if removed {
            tracing::info!(
                service = %stale.service,
                operation = %stale.operation,
                stale_lock_id = %stale.lock_id,
                expired_at = %stale.expired_at,
                "Reclaimed stale reservation"
            );
        }

        self.try_acquire(&stale.key(), lock_duration).await
    }

    /// Marks the lock released and drops its reservation. Safe to repeat.
    pub async fn release(&self, lock_id: Uuid) -> Result<ReleaseOutcome> {
        let lock = match self
            .retry
            .run("find_lock", || self.locks.find_lock(lock_id))
            .await?
        {
            Some(lock) => lock,
            None => return Ok(ReleaseOutcome::NotFound),
        };

        let released_at = now_micros();
        let transitioned = self
            .retry
            .run("mark_released", || self.locks.mark_released(lock_id, released_at))
            .await?;

        // Compare-and-delete leaves any newer holder's reservation untouched.
        let reservation = lock.reservation();
        self.retry
            .run("delete_reservation", || self.reservations.delete_if_matches(&reservation))
            .await?;

        if transitioned {
            tracing::info!(lock_id = %lock_id, "Lock released");
            Ok(ReleaseOutcome::Released)
        } else {
            tracing::debug!(lock_id = %lock_id, "Lock was already released");
            Ok(ReleaseOutcome::AlreadyReleased)
        }
    }

    pub async fn find_grant(&self, lock_id: Uuid) -> Result<Option<LockGrant>> {
        let lock = self
            .retry
            .run("find_lock", || self.locks.find_lock(lock_id))
            .await?;
        Ok(lock.map(|lock| lock.grant()))
    }

    /// The lock acquired for the key before `current`, if any.
    pub async fn find_previous_lock(&self, key: &OperationKey, current: Uuid) -> Result<Option<Lock>> {
        self.retry
            .run("find_previous_lock", || self.locks.find_latest_for_key(key, current))
            .await
    }

    /// Appends the audit record for an acquired lock.
    pub async fn record_attempt(&self, record: &OperationRecord) -> Result<()> {
        self.retry
            .run("append_operation", || self.locks.append_operation(record))
            .await
    }

    pub async fn purge_expired_reservations(&self, now: DateTime<Utc>) -> Result<u64> {
        self.retry
            .run("purge_reservations", || self.reservations.purge_expired(now))
            .await
    }

    pub async fn find_expired_unreleased(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Lock>> {
        self.retry
            .run("find_expired_locks", || self.locks.find_expired_unreleased(now, limit))
            .await
    }
}
