use crate::error::Result;
use crate::idempotency::retry::RetryPolicy;
use crate::models::{FailedResult, OperationKey, SettledOutcome, StoredResult};
use crate::observability::get_metrics;
use crate::repositories::{InsertOutcome, ResultRepository};
use std::sync::Arc;
use uuid::Uuid;

/// Write-once view over terminal results. The first successful write for a
/// key wins; later writers get `Duplicate` and must defer to it.
pub struct ResultStore {
    repository: Arc<dyn ResultRepository>,
    retry: RetryPolicy,
}

impl ResultStore {
    pub fn new(repository: Arc<dyn ResultRepository>, retry: RetryPolicy) -> Self {
        Self { repository, retry }
    }

    /// Success takes precedence over any recorded failure.
    pub async fn get(&self, key: &OperationKey) -> Result<Option<SettledOutcome>> {
        if let Some(stored) = self.get_success(key).await? {
            return Ok(Some(SettledOutcome::Success(stored.payload)));
        }

        Ok(self.latest_failure(key).await?.map(SettledOutcome::Failure))
    }

    /// Most recent failure for the key, regardless of any stored success.
    pub async fn latest_failure(&self, key: &OperationKey) -> Result<Option<FailedResult>> {
        self.retry
            .run("find_failure", || self.repository.find_latest_failure(key))
            .await
    }

    pub async fn get_success(&self, key: &OperationKey) -> Result<Option<StoredResult>> {
        self.retry
            .run("find_success", || self.repository.find_success(key))
            .await
    }

    pub async fn put_success(
        &self,
        key: &OperationKey,
        lock_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<InsertOutcome> {
        let result = StoredResult::new(key, lock_id, payload);
        let outcome = self
            .retry
            .run("insert_success", || self.repository.insert_success(&result))
            .await?;

        if !outcome.is_inserted() {
            get_metrics().record_duplicate_write("success");
            tracing::warn!(
                service = %key.service,
                operation = %key.operation,
                lock_id = %lock_id,
                "Success already recorded by another writer"
            );
        }

        Ok(outcome)
    }

    pub async fn put_failure(&self, failure: &FailedResult) -> Result<InsertOutcome> {
        let outcome = self
            .retry
            .run("insert_failure", || self.repository.insert_failure(failure))
            .await?;

        if !outcome.is_inserted() {
            get_metrics().record_duplicate_write("failure");
            tracing::debug!(lock_id = %failure.lock_id, "Failure already recorded for lock");
        }

        Ok(outcome)
    }
}
