//! Store contracts the idempotency core depends on, plus their backends.
//!
//! Every mutation is a single-record atomic operation: unique insert,
//! compare-and-delete, or a conditional field update. No backend needs
//! multi-record transactions.

pub mod memory_repository;
pub mod postgres_repository;
pub mod redis_reservation_repository;

pub use memory_repository::MemoryStore;
pub use postgres_repository::PostgresStore;
pub use redis_reservation_repository::RedisReservationStore;

use crate::error::Result;
use crate::models::{
    FailedResult, Lock, OperationConfig, OperationKey, OperationRecord, Reservation, StoredResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Result of an insert guarded by a uniqueness constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T = ()> {
    Inserted,
    /// The key was already taken; carries the current holder where the caller needs it.
    Duplicate(T),
}

impl<T> InsertOutcome<T> {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted)
    }
}

/// Reservation records keyed by (service, operation, idempotency_key).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Inserts unless any reservation, expired or not, already holds the key.
    async fn insert_unique(&self, reservation: &Reservation) -> Result<InsertOutcome<Reservation>>;

    async fn find(&self, key: &OperationKey) -> Result<Option<Reservation>>;

    /// Deletes only if the stored reservation for the key carries the same lock.
    async fn delete_if_matches(&self, expected: &Reservation) -> Result<bool>;

    /// Physically removes reservations expired at `now`. Backends with native TTL return 0.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Durable lock records and the attempt audit trail.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Idempotent on `lock_id`: re-inserting the same lock is a no-op.
    async fn insert_lock(&self, lock: &Lock) -> Result<()>;

    async fn find_lock(&self, lock_id: Uuid) -> Result<Option<Lock>>;

    /// Sets `released_at` if unset. Returns false if already released or unknown.
    async fn mark_released(&self, lock_id: Uuid, released_at: DateTime<Utc>) -> Result<bool>;

    async fn find_expired_unreleased(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Lock>>;

    /// Most recently acquired lock for the key, other than `excluding`.
    async fn find_latest_for_key(&self, key: &OperationKey, excluding: Uuid) -> Result<Option<Lock>>;

    async fn append_operation(&self, record: &OperationRecord) -> Result<()>;
}

/// Write-once terminal results.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultRepository: Send + Sync {
    async fn insert_success(&self, result: &StoredResult) -> Result<InsertOutcome>;

    async fn find_success(&self, key: &OperationKey) -> Result<Option<StoredResult>>;

    async fn insert_failure(&self, failure: &FailedResult) -> Result<InsertOutcome>;

    /// Most recent failure recorded for any lock on the key.
    async fn find_latest_failure(&self, key: &OperationKey) -> Result<Option<FailedResult>>;
}

/// Per (service, operation) policy records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn find_config(&self, service: &str, operation: &str) -> Result<Option<OperationConfig>>;

    async fn upsert_config(&self, config: &OperationConfig) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<OperationConfig>>;
}

/// Store handles injected into the idempotency core.
#[derive(Clone)]
pub struct Stores {
    pub reservations: Arc<dyn ReservationStore>,
    pub locks: Arc<dyn LockStore>,
    pub results: Arc<dyn ResultRepository>,
    pub configs: Arc<dyn ConfigRepository>,
}

impl Stores {
    /// Every concern served by one in-memory store.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            reservations: store.clone(),
            locks: store.clone(),
            results: store.clone(),
            configs: store,
        }
    }

    /// Every concern served by PostgreSQL.
    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(PostgresStore::new(pool));
        Self {
            reservations: store.clone(),
            locks: store.clone(),
            results: store.clone(),
            configs: store,
        }
    }

    /// Reservations in Redis (native TTL), durable records in PostgreSQL.
    pub fn hybrid(pool: PgPool, redis_client: redis::Client, key_prefix: &str) -> Self {
        let store = Arc::new(PostgresStore::new(pool));
        Self {
            reservations: Arc::new(RedisReservationStore::new(redis_client, key_prefix)),
            locks: store.clone(),
            results: store.clone(),
            configs: store,
        }
    }
}
