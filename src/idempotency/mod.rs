//! At-most-once execution of operations keyed by
//! (service, operation, idempotency_key).

pub mod config_registry;
pub mod lock_manager;
pub mod orchestrator;
pub mod reaper;
pub mod result_store;
pub mod retry;

pub use config_registry::ConfigRegistry;
pub use lock_manager::{AcquireOutcome, LockManager, ReleaseOutcome};
pub use orchestrator::{
    Admission, IdempotencyMetrics, IdempotencyOrchestrator, MetricsSnapshot, ReapSummary,
    DEFAULT_MAX_ACQUIRE_ROUNDS,
};
pub use reaper::LockReaperJob;
pub use result_store::ResultStore;
pub use retry::RetryPolicy;
