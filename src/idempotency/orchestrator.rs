use crate::error::{AppError, Result};
use crate::idempotency::config_registry::ConfigRegistry;
use crate::idempotency::lock_manager::{AcquireOutcome, LockManager};
use crate::idempotency::result_store::ResultStore;
use crate::idempotency::retry::RetryPolicy;
use crate::models::{
    expiry_after, now_micros, FailedResult, FailureKind, LockGrant, OperationConfig, OperationKey,
    OperationRecord, Outcome, Reservation, SettledOutcome,
};
use crate::observability::{get_metrics, mask_sensitive, LatencyTimer};
use crate::repositories::Stores;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Acquisition rounds before a caller racing on a stale lock gives up.
pub const DEFAULT_MAX_ACQUIRE_ROUNDS: u32 = 3;

/// In-process counters for the orchestrator.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub cached_responses: AtomicU64,
    pub locks_acquired: AtomicU64,
    pub lock_conflicts: AtomicU64,
    pub completed_operations: AtomicU64,
    pub failed_operations: AtomicU64,
    pub expired_locks_reaped: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cached(&self) {
        self.cached_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquired(&self) {
        self.locks_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reaped(&self, count: u64) {
        self.expired_locks_reaped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cached_responses: self.cached_responses.load(Ordering::Relaxed),
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            completed_operations: self.completed_operations.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            expired_locks_reaped: self.expired_locks_reaped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub cached_responses: u64,
    pub locks_acquired: u64,
    pub lock_conflicts: u64,
    pub completed_operations: u64,
    pub failed_operations: u64,
    pub expired_locks_reaped: u64,
}

impl MetricsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.cached_responses as f64 / self.total_requests as f64
        }
    }
}

/// What `begin` decided for a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// A success is already stored; the operation must not run.
    Cached(serde_json::Value),
    /// The caller owns the key until `expired_at` and must call `complete`.
    Acquired(LockGrant),
}

/// Counts from one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapSummary {
    pub reservations_purged: u64,
    pub locks_expired: u64,
}

/// Coordinates the registry, lock manager and result store so that each
/// operation key executes at most once while a lock is held.
pub struct IdempotencyOrchestrator {
    registry: Arc<ConfigRegistry>,
    locks: LockManager,
    results: ResultStore,
    metrics: Arc<IdempotencyMetrics>,
    max_acquire_rounds: u32,
}

impl IdempotencyOrchestrator {
    pub fn new(stores: Stores, registry: Arc<ConfigRegistry>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            locks: LockManager::new(stores.reservations, stores.locks, retry.clone()),
            results: ResultStore::new(stores.results, retry),
            metrics: Arc::new(IdempotencyMetrics::new()),
            max_acquire_rounds: DEFAULT_MAX_ACQUIRE_ROUNDS,
        }
    }

    pub fn with_max_acquire_rounds(mut self, rounds: u32) -> Self {
        self.max_acquire_rounds = rounds.max(1);
        self
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn registry(&self) -> Arc<ConfigRegistry> {
        Arc::clone(&self.registry)
    }

    /// Runs `operation` at most once per key. Duplicates get the stored
    /// payload; the operation's own error is returned unchanged.
    pub async fn invoke<T, F, Fut>(&self, key: &OperationKey, operation: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let grant = match self.begin(key).await? {
            Admission::Cached(payload) => return Ok(serde_json::from_value(payload)?),
            Admission::Acquired(grant) => grant,
        };

        let timer = LatencyTimer::new();
        let executed = operation().await;
        get_metrics().record_execution(&key.service, &key.operation, executed.is_ok(), timer.elapsed_ms());

        match executed {
            Ok(value) => {
                let payload = match serde_json::to_value(&value) {
                    Ok(payload) => payload,
                    Err(e) => {
                        let message = format!("result could not be serialized: {}", e);
                        if let Err(store_err) = self.complete(&grant, Outcome::Failure(message)).await {
                            tracing::error!(lock_id = %grant.lock_id, "Failed to record serialization failure: {}", store_err);
                        }
                        return Err(AppError::Serialization(e));
                    }
                };

                match self.complete(&grant, Outcome::Success(payload.clone())).await? {
                    SettledOutcome::Success(stored) if stored == payload => Ok(value),
                    SettledOutcome::Success(stored) => Ok(serde_json::from_value(stored)?),
                    SettledOutcome::Failure(failure) => Err(self.resolve_failure(failure).await),
                }
            }
            Err(e) => {
                if let Err(store_err) = self.complete(&grant, Outcome::Failure(e.to_string())).await {
                    tracing::error!(lock_id = %grant.lock_id, "Failed to record operation failure: {}", store_err);
                }
                Err(e)
            }
        }
    }

    /// First half of `invoke`: either a stored success or a lock the caller
    /// now owns.
    pub async fn begin(&self, key: &OperationKey) -> Result<Admission> {
        key.validate()?;
        self.metrics.record_request();
        get_metrics().record_request(&key.service, &key.operation);

        if let Some(stored) = self.results.get_success(key).await? {
            return Ok(self.cached(key, stored.payload));
        }

        let config = self.registry.get(&key.service, &key.operation).await?;

        if !config.allow_save_on_expired {
            if let Some(failure) = self.results.latest_failure(key).await? {
                self.metrics.record_cached();
                get_metrics().record_cache_hit(&key.service, &key.operation, "failure");
                return Err(self.resolve_failure(failure).await);
            }
        }

        self.acquire(key, &config).await
    }

    async fn acquire(&self, key: &OperationKey, config: &OperationConfig) -> Result<Admission> {
        let mut stale: Option<Reservation> = None;

        for _ in 0..self.max_acquire_rounds {
            let attempt = match &stale {
                None => self.locks.try_acquire(key, config.lock_duration).await?,
                Some(holder) => self.locks.reclaim_stale(holder, config.lock_duration).await?,
            };

            let holder = match attempt {
                AcquireOutcome::Acquired(grant) => {
                    return self.admit(key, config, grant, stale.is_some()).await;
                }
                AcquireOutcome::Conflict(holder) => holder,
            };

            self.metrics.record_conflict();
            let expired = holder.is_expired_at(now_micros());
            get_metrics().record_lock_conflict(&key.service, &key.operation, expired);

            if !expired {
                tracing::warn!(
                    service = %key.service,
                    operation = %key.operation,
                    key = %mask_sensitive(&key.idempotency_key, 4),
                    holder_lock_id = %holder.lock_id,
                    expires_at = %holder.expired_at,
                    "Operation already locked"
                );
                return Err(AppError::OperationInProgress {
                    expires_at: holder.expired_at,
                });
            }

            // The stale holder may have settled just before expiring.
            match self.results.get(key).await? {
                Some(SettledOutcome::Success(payload)) => return Ok(self.cached(key, payload)),
                Some(SettledOutcome::Failure(failure)) if !config.allow_save_on_expired => {
                    return Err(self.resolve_failure(failure).await);
                }
                _ => {}
            }

            if !config.allow_save_on_expired {
                tracing::warn!(
                    service = %key.service,
                    operation = %key.operation,
                    key = %mask_sensitive(&key.idempotency_key, 4),
                    lock_id = %holder.lock_id,
                    expired_at = %holder.expired_at,
                    "Lock expired without a result and re-execution is not allowed"
                );
                return Err(AppError::ExpiredWithoutResult {
                    lock_id: holder.lock_id,
                    expired_at: holder.expired_at,
                });
            }

            stale = Some(holder);
        }

        tracing::warn!(
            service = %key.service,
            operation = %key.operation,
            rounds = self.max_acquire_rounds,
            "Gave up reclaiming stale lock"
        );
        Err(AppError::OperationInProgress {
            expires_at: expiry_after(now_micros(), config.lock_duration)?,
        })
    }

    async fn admit(
        &self,
        key: &OperationKey,
        config: &OperationConfig,
        grant: LockGrant,
        reclaimed: bool,
    ) -> Result<Admission> {
        // A previous holder may have settled and released between the first
        // result check and our insert.
        let settled = match self.results.get(key).await {
            Ok(Some(SettledOutcome::Success(payload))) => Some(Ok(self.cached(key, payload))),
            Ok(Some(SettledOutcome::Failure(failure))) if !config.allow_save_on_expired => {
                Some(Err(self.resolve_failure(failure).await))
            }
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        };
        let settled = match settled {
            None if !config.allow_save_on_expired => {
                match self.refuse_after_abandoned(key, &grant).await {
                    Ok(refused) => refused,
                    Err(e) => Some(Err(e)),
                }
            }
            other => other,
        };
        if let Some(settled) = settled {
            if let Err(e) = self.locks.release(grant.lock_id).await {
                tracing::error!(lock_id = %grant.lock_id, "Failed to release unused lock: {}", e);
            }
            return settled;
        }

        self.metrics.record_acquired();
        get_metrics().record_lock_acquired(&key.service, &key.operation, reclaimed);

        // Audit only; dedup never reads it.
        let record = OperationRecord::new(key, grant.lock_id);
        if let Err(e) = self.locks.record_attempt(&record).await {
            tracing::warn!(lock_id = %grant.lock_id, "Failed to append operation record: {}", e);
        }

        Ok(Admission::Acquired(grant))
    }

    /// With re-execution forbidden, an earlier lock that left no result means
    /// the operation may already have run. Its reservation can vanish (TTL or
    /// purge) before the reaper records the expiry, so check the lock history.
    async fn refuse_after_abandoned(
        &self,
        key: &OperationKey,
        grant: &LockGrant,
    ) -> Result<Option<Result<Admission>>> {
        let previous = match self.locks.find_previous_lock(key, grant.lock_id).await? {
            Some(previous) => previous,
            None => return Ok(None),
        };

        if previous.is_active_at(now_micros()) {
            return Ok(Some(Err(AppError::OperationInProgress {
                expires_at: previous.expired_at,
            })));
        }

        if let Err(e) = self.results.put_failure(&FailedResult::expired(&previous)).await {
            tracing::error!(lock_id = %previous.lock_id, "Failed to record abandoned lock: {}", e);
        }
        if let Err(e) = self.locks.release(previous.lock_id).await {
            tracing::error!(lock_id = %previous.lock_id, "Failed to release abandoned lock: {}", e);
        }

        tracing::warn!(
            service = %key.service,
            operation = %key.operation,
            key = %mask_sensitive(&key.idempotency_key, 4),
            lock_id = %previous.lock_id,
            expired_at = %previous.expired_at,
            "Earlier lock left no result and re-execution is not allowed"
        );
        Ok(Some(Err(AppError::ExpiredWithoutResult {
            lock_id: previous.lock_id,
            expired_at: previous.expired_at,
        })))
    }

    fn cached(&self, key: &OperationKey, payload: serde_json::Value) -> Admission {
        self.metrics.record_cached();
        get_metrics().record_cache_hit(&key.service, &key.operation, "success");
        tracing::info!(
            service = %key.service,
            operation = %key.operation,
            key = %mask_sensitive(&key.idempotency_key, 4),
            "Returning stored result"
        );
        Admission::Cached(payload)
    }

    /// Second half of `invoke`: records the outcome, releases the lock and
    /// returns whatever the result store holds as authoritative.
    pub async fn complete(&self, grant: &LockGrant, outcome: Outcome) -> Result<SettledOutcome> {
        let key = &grant.key;
        if grant.is_expired_at(now_micros()) {
            get_metrics().record_late_completion(&key.service, &key.operation);
            tracing::warn!(
                service = %key.service,
                operation = %key.operation,
                lock_id = %grant.lock_id,
                expired_at = %grant.expired_at,
                "Completing after lock expiry"
            );
        }

        let settled = match outcome {
            Outcome::Success(payload) => {
                self.metrics.record_completed();
                if self
                    .results
                    .put_success(key, grant.lock_id, payload.clone())
                    .await?
                    .is_inserted()
                {
                    SettledOutcome::Success(payload)
                } else {
                    let winner = self.results.get_success(key).await?.ok_or_else(|| {
                        AppError::Internal(anyhow::anyhow!(
                            "success for {} reported as duplicate but not found",
                            key
                        ))
                    })?;
                    SettledOutcome::Success(winner.payload)
                }
            }
            Outcome::Failure(message) => {
                self.metrics.record_failed();
                let failure = FailedResult::operation_failed(grant, message);
                let recorded = self.results.put_failure(&failure).await?;

                match self.results.get_success(key).await? {
                    Some(winner) => SettledOutcome::Success(winner.payload),
                    None if recorded.is_inserted() => SettledOutcome::Failure(failure),
                    // Already settled for this lock, e.g. expired by the reaper.
                    None => SettledOutcome::Failure(
                        self.results.latest_failure(key).await?.unwrap_or(failure),
                    ),
                }
            }
        };

        // An unreleased lock still expires on its own.
        if let Err(e) = self.locks.release(grant.lock_id).await {
            tracing::error!(lock_id = %grant.lock_id, "Failed to release lock: {}", e);
        }

        Ok(settled)
    }

    /// Completes on behalf of a remote caller that only holds the lock id.
    pub async fn complete_by_lock_id(
        &self,
        lock_id: Uuid,
        key: &OperationKey,
        outcome: Outcome,
    ) -> Result<SettledOutcome> {
        key.validate()?;
        let grant = self
            .locks
            .find_grant(lock_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("lock {}", lock_id)))?;

        if grant.key != *key {
            return Err(AppError::Validation(format!(
                "lock {} was not issued for {}",
                lock_id, key
            )));
        }

        self.complete(&grant, outcome).await
    }

    /// Maps a recorded failure to the error duplicate callers see.
    async fn resolve_failure(&self, failure: FailedResult) -> AppError {
        match failure.kind {
            FailureKind::OperationFailed => AppError::OperationFailed {
                lock_id: failure.lock_id,
                message: failure.error_message,
            },
            FailureKind::OperationExpired => {
                let expired_at = match self.locks.find_grant(failure.lock_id).await {
                    Ok(Some(grant)) => grant.expired_at,
                    _ => failure.created_at,
                };
                AppError::ExpiredWithoutResult {
                    lock_id: failure.lock_id,
                    expired_at,
                }
            }
        }
    }

    /// One reaper pass: records `OPERATION_EXPIRED` for locks that lapsed
    /// with no terminal write, then purges stale reservations. The purge is
    /// skipped while any expired lock is still unrecorded.
    pub async fn reap_expired_locks(&self, batch_size: i64) -> Result<ReapSummary> {
        let now = now_micros();
        let mut summary = ReapSummary::default();
        let mut unrecorded = 0;

        for lock in self.locks.find_expired_unreleased(now, batch_size).await? {
            let key = lock.key();
            let settled = match self.results.get_success(&key).await {
                Ok(found) => found.is_some(),
                Err(e) => {
                    tracing::error!(lock_id = %lock.lock_id, "Failed to check result for expired lock: {}", e);
                    unrecorded += 1;
                    continue;
                }
            };

            if !settled {
                if let Err(e) = self.results.put_failure(&FailedResult::expired(&lock)).await {
                    tracing::error!(lock_id = %lock.lock_id, "Failed to record expired lock: {}", e);
                    unrecorded += 1;
                    continue;
                }
                summary.locks_expired += 1;
                tracing::info!(
                    service = %lock.service,
                    operation = %lock.operation,
                    lock_id = %lock.lock_id,
                    expired_at = %lock.expired_at,
                    "Recorded expired lock"
                );
            }

            if let Err(e) = self.locks.release(lock.lock_id).await {
                tracing::error!(lock_id = %lock.lock_id, "Failed to release expired lock: {}", e);
            }
        }

        if unrecorded == 0 {
            summary.reservations_purged = self.locks.purge_expired_reservations(now).await?;
        } else {
            tracing::warn!(unrecorded, "Skipping reservation purge until expired locks are recorded");
        }

        self.metrics.record_reaped(summary.locks_expired);
        get_metrics().record_locks_reaped(summary.locks_expired);
        get_metrics().record_reservations_purged(summary.reservations_purged);

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{MemoryStore, MockResultRepository, ReservationStore};
    use chrono::Duration;
    use serde_json::json;

    async fn orchestrator(allow_save_on_expired: bool, lock_duration: Duration) -> (IdempotencyOrchestrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores::memory(store.clone());
        let registry = Arc::new(ConfigRegistry::new(stores.configs.clone(), RetryPolicy::none()));
        registry
            .register(OperationConfig::new("billing", "charge", lock_duration, allow_save_on_expired).unwrap())
            .await
            .unwrap();
        (IdempotencyOrchestrator::new(stores, registry, RetryPolicy::none()), store)
    }

    fn key() -> OperationKey {
        OperationKey::new("billing", "charge", "order-42")
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = IdempotencyMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_cached();
        metrics.record_acquired();
        metrics.record_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.cached_responses, 1);
        assert_eq!(snapshot.locks_acquired, 1);
        assert_eq!(snapshot.completed_operations, 1);
        assert_eq!(snapshot.cache_hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_begin_then_complete_then_cached() {
        let (orchestrator, _) = orchestrator(true, Duration::seconds(30)).await;

        let grant = match orchestrator.begin(&key()).await.unwrap() {
            Admission::Acquired(grant) => grant,
            other => panic!("expected lock, got {:?}", other),
        };
        let settled = orchestrator
            .complete(&grant, Outcome::Success(json!({"chargeId": "ch_1"})))
            .await
            .unwrap();
        assert_eq!(settled, SettledOutcome::Success(json!({"chargeId": "ch_1"})));

        assert_eq!(
            orchestrator.begin(&key()).await.unwrap(),
            Admission::Cached(json!({"chargeId": "ch_1"}))
        );
    }

    #[tokio::test]
    async fn test_unregistered_operation_is_rejected() {
        let (orchestrator, _) = orchestrator(true, Duration::seconds(30)).await;
        let key = OperationKey::new("billing", "refund", "order-42");

        let err = orchestrator.begin(&key).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigurationMissing { .. }));
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected() {
        let (orchestrator, _) = orchestrator(true, Duration::seconds(30)).await;
        let key = OperationKey::new("billing", "charge", "");

        let err = orchestrator.begin(&key).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_operation_error_returned_verbatim() {
        let (orchestrator, store) = orchestrator(true, Duration::seconds(30)).await;

        let result: Result<serde_json::Value> = orchestrator
            .invoke(&key(), || async { Err(AppError::Validation("card declined".to_string())) })
            .await;

        match result {
            Err(AppError::Validation(message)) => assert_eq!(message, "card declined"),
            other => panic!("expected wrapped error, got {:?}", other),
        }
        assert_eq!(store.failures_for(&key()).len(), 1);
        assert_eq!(store.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_by_lock_id_checks_tuple() {
        let (orchestrator, _) = orchestrator(true, Duration::seconds(30)).await;
        let grant = match orchestrator.begin(&key()).await.unwrap() {
            Admission::Acquired(grant) => grant,
            other => panic!("expected lock, got {:?}", other),
        };

        let other_key = OperationKey::new("billing", "charge", "order-43");
        let err = orchestrator
            .complete_by_lock_id(grant.lock_id, &other_key, Outcome::Success(json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = orchestrator
            .complete_by_lock_id(Uuid::new_v4(), &key(), Outcome::Success(json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reaper_records_expired_lock() {
        let (orchestrator, store) = orchestrator(false, Duration::milliseconds(1)).await;
        let grant = match orchestrator.begin(&key()).await.unwrap() {
            Admission::Acquired(grant) => grant,
            other => panic!("expected lock, got {:?}", other),
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let summary = orchestrator.reap_expired_locks(100).await.unwrap();
        assert_eq!(summary.locks_expired, 1);
        assert_eq!(store.reservation_count(), 0);
        assert_eq!(store.failures_for(&key())[0].kind, FailureKind::OperationExpired);

        match orchestrator.begin(&key()).await.unwrap_err() {
            AppError::ExpiredWithoutResult { lock_id, expired_at } => {
                assert_eq!(lock_id, grant.lock_id);
                assert_eq!(expired_at, grant.expired_at);
            }
            other => panic!("expected expiry, got {:?}", other),
        }

        // A second pass finds nothing left to do.
        assert_eq!(orchestrator.reap_expired_locks(100).await.unwrap(), ReapSummary::default());
    }

    async fn acquire(orchestrator: &IdempotencyOrchestrator) -> LockGrant {
        match orchestrator.begin(&key()).await.unwrap() {
            Admission::Acquired(grant) => grant,
            other => panic!("expected lock, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_vanished_reservation_does_not_allow_rerun() {
        let (orchestrator, store) = orchestrator(false, Duration::milliseconds(1)).await;
        let abandoned = acquire(&orchestrator).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store.purge_expired(now_micros()).await.unwrap();

        match orchestrator.begin(&key()).await.unwrap_err() {
            AppError::ExpiredWithoutResult { lock_id, expired_at } => {
                assert_eq!(lock_id, abandoned.lock_id);
                assert_eq!(expired_at, abandoned.expired_at);
            }
            other => panic!("expected expiry, got {:?}", other),
        }
        assert_eq!(store.failures_for(&key())[0].kind, FailureKind::OperationExpired);
        assert_eq!(store.reservation_count(), 0);
        assert_eq!(orchestrator.metrics().snapshot().locks_acquired, 1);
    }

    #[tokio::test]
    async fn test_lost_reservation_of_live_lock_reports_in_progress() {
        let (orchestrator, store) = orchestrator(false, Duration::seconds(30)).await;
        let holder = acquire(&orchestrator).await;
        let reservation = store.find(&key()).await.unwrap().unwrap();
        store.delete_if_matches(&reservation).await.unwrap();

        match orchestrator.begin(&key()).await.unwrap_err() {
            AppError::OperationInProgress { expires_at } => assert_eq!(expires_at, holder.expired_at),
            other => panic!("expected in progress, got {:?}", other),
        }
        assert!(store.failures_for(&key()).is_empty());
        assert_eq!(store.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_late_failure_reports_stored_expiry() {
        let (orchestrator, _) = orchestrator(true, Duration::milliseconds(1)).await;
        let grant = acquire(&orchestrator).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        orchestrator.reap_expired_locks(100).await.unwrap();

        match orchestrator
            .complete(&grant, Outcome::Failure("gateway timeout".to_string()))
            .await
            .unwrap()
        {
            SettledOutcome::Failure(failure) => {
                assert_eq!(failure.lock_id, grant.lock_id);
                assert_eq!(failure.kind, FailureKind::OperationExpired);
            }
            other => panic!("expected stored failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unrecorded_expiry_keeps_reservation() {
        let store = Arc::new(MemoryStore::new());
        let mut results = MockResultRepository::new();
        results.expect_find_success().returning(|_| Ok(None));
        results.expect_find_latest_failure().returning(|_| Ok(None));
        results
            .expect_insert_failure()
            .returning(|_| Err(AppError::StoreUnavailable("connection reset".to_string())));

        let stores = Stores {
            reservations: store.clone(),
            locks: store.clone(),
            results: Arc::new(results),
            configs: store.clone(),
        };
        let registry = Arc::new(ConfigRegistry::new(stores.configs.clone(), RetryPolicy::none()));
        registry
            .register(OperationConfig::new("billing", "charge", Duration::milliseconds(1), true).unwrap())
            .await
            .unwrap();
        let orchestrator = IdempotencyOrchestrator::new(stores, registry, RetryPolicy::none());

        acquire(&orchestrator).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let summary = orchestrator.reap_expired_locks(100).await.unwrap();
        assert_eq!(summary, ReapSummary::default());
        assert_eq!(store.reservation_count(), 1);
    }

    #[tokio::test]
    async fn test_overflowing_lock_duration_is_rejected() {
        let (orchestrator, _) = orchestrator(true, Duration::seconds(30)).await;
        let config = OperationConfig {
            service: "billing".to_string(),
            operation: "export".to_string(),
            lock_duration: Duration::milliseconds(i64::MAX / 2),
            allow_save_on_expired: true,
        };
        assert!(orchestrator.registry().register(config).await.is_err());

        let err = orchestrator
            .locks
            .try_acquire(&OperationKey::new("billing", "export", "job-1"), Duration::milliseconds(i64::MAX / 2))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
