use crate::error::Result;
use crate::idempotency::orchestrator::{IdempotencyOrchestrator, ReapSummary};
use std::sync::Arc;

/// Background job that settles locks which expired without a terminal write.
pub struct LockReaperJob {
    orchestrator: Arc<IdempotencyOrchestrator>,
    interval_seconds: u64,
    batch_size: i64,
}

impl LockReaperJob {
    pub fn new(orchestrator: Arc<IdempotencyOrchestrator>, interval_seconds: u64, batch_size: i64) -> Self {
        Self {
            orchestrator,
            interval_seconds: interval_seconds.max(1),
            batch_size,
        }
    }

    /// Runs the reaper once.
    pub async fn run_once(&self) -> Result<ReapSummary> {
        self.orchestrator.reap_expired_locks(self.batch_size).await
    }

    /// Starts the reaper in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(
                tokio::time::Duration::from_secs(self.interval_seconds)
            );

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(summary) => {
                        if summary.locks_expired > 0 || summary.reservations_purged > 0 {
                            tracing::info!(
                                locks_expired = summary.locks_expired,
                                reservations_purged = summary.reservations_purged,
                                "Reaped expired idempotency locks"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to reap expired idempotency locks: {}", e);
                    }
                }
            }
        })
    }
}
