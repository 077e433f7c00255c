use super::{
    ConfigRepository, InsertOutcome, LockStore, ReservationStore, ResultRepository,
};
use crate::error::Result;
use crate::models::{
    FailedResult, Lock, OperationConfig, OperationKey, OperationRecord, Reservation, StoredResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// In-process store with the same atomic insert and compare-and-delete
/// semantics as the persistent backends. Each map entry is locked
/// independently, so operations on one key are linearizable.
///
/// Expired reservations are only removed by [`ReservationStore::purge_expired`],
/// mirroring a TTL reaper that lags behind real time.
#[derive(Debug, Default)]
pub struct MemoryStore {
    reservations: DashMap<OperationKey, Reservation>,
    locks: DashMap<Uuid, Lock>,
    operations: DashMap<Uuid, OperationRecord>,
    successes: DashMap<OperationKey, StoredResult>,
    failures: DashMap<Uuid, FailedResult>,
    configs: DashMap<(String, String), OperationConfig>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Audit records for one key, oldest first.
    pub fn operation_records(&self, key: &OperationKey) -> Vec<OperationRecord> {
        let mut records: Vec<OperationRecord> = self
            .operations
            .iter()
            .filter(|entry| entry.value().key() == *key)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    pub fn failures_for(&self, key: &OperationKey) -> Vec<FailedResult> {
        self.failures
            .iter()
            .filter(|entry| entry.value().key() == *key)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn insert_unique(&self, reservation: &Reservation) -> Result<InsertOutcome<Reservation>> {
        match self.reservations.entry(reservation.key()) {
            Entry::Occupied(existing) => Ok(InsertOutcome::Duplicate(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(reservation.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn find(&self, key: &OperationKey) -> Result<Option<Reservation>> {
        Ok(self.reservations.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete_if_matches(&self, expected: &Reservation) -> Result<bool> {
        Ok(self
            .reservations
            .remove_if(&expected.key(), |_, current| current.lock_id == expected.lock_id)
            .is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let before = self.reservations.len();
        self.reservations
            .retain(|_, reservation| !reservation.is_expired_at(now));
        Ok(before.saturating_sub(self.reservations.len()) as u64)
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn insert_lock(&self, lock: &Lock) -> Result<()> {
        self.locks.entry(lock.lock_id).or_insert_with(|| lock.clone());
        Ok(())
    }

    async fn find_lock(&self, lock_id: Uuid) -> Result<Option<Lock>> {
        Ok(self.locks.get(&lock_id).map(|entry| entry.value().clone()))
    }

    async fn mark_released(&self, lock_id: Uuid, released_at: DateTime<Utc>) -> Result<bool> {
        match self.locks.get_mut(&lock_id) {
            Some(mut lock) if lock.released_at.is_none() => {
                lock.released_at = Some(released_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_expired_unreleased(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Lock>> {
        let mut expired: Vec<Lock> = self
            .locks
            .iter()
            .filter(|entry| !entry.value().is_released() && entry.value().expired_at <= now)
            .map(|entry| entry.value().clone())
            .collect();
        expired.sort_by_key(|lock| lock.expired_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn find_latest_for_key(&self, key: &OperationKey, excluding: Uuid) -> Result<Option<Lock>> {
        Ok(self
            .locks
            .iter()
            .filter(|entry| entry.key() != &excluding && entry.value().key() == *key)
            .max_by_key(|entry| entry.value().locked_at)
            .map(|entry| entry.value().clone()))
    }

    async fn append_operation(&self, record: &OperationRecord) -> Result<()> {
        self.operations.insert(record.id, record.clone());
        Ok(())
    }
}

#[async_trait]
impl ResultRepository for MemoryStore {
    async fn insert_success(&self, result: &StoredResult) -> Result<InsertOutcome> {
        match self.successes.entry(result.key()) {
            Entry::Occupied(_) => Ok(InsertOutcome::Duplicate(())),
            Entry::Vacant(slot) => {
                slot.insert(result.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn find_success(&self, key: &OperationKey) -> Result<Option<StoredResult>> {
        Ok(self.successes.get(key).map(|entry| entry.value().clone()))
    }

    async fn insert_failure(&self, failure: &FailedResult) -> Result<InsertOutcome> {
        match self.failures.entry(failure.lock_id) {
            Entry::Occupied(_) => Ok(InsertOutcome::Duplicate(())),
            Entry::Vacant(slot) => {
                slot.insert(failure.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn find_latest_failure(&self, key: &OperationKey) -> Result<Option<FailedResult>> {
        Ok(self
            .failures_for(key)
            .into_iter()
            .max_by_key(|failure| failure.created_at))
    }
}

#[async_trait]
impl ConfigRepository for MemoryStore {
    async fn find_config(&self, service: &str, operation: &str) -> Result<Option<OperationConfig>> {
        Ok(self
            .configs
            .get(&(service.to_string(), operation.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn upsert_config(&self, config: &OperationConfig) -> Result<()> {
        self.configs.insert(
            (config.service.clone(), config.operation.clone()),
            config.clone(),
        );
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<OperationConfig>> {
        Ok(self.configs.iter().map(|entry| entry.value().clone()).collect())
    }
}
