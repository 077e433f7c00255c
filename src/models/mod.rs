pub mod lock;
pub mod operation_config;
pub mod operation_key;
pub mod operation_record;
pub mod operation_result;

pub use lock::{expiry_after, Lock, LockGrant, Reservation};
pub use operation_config::{OperationConfig, MAX_LOCK_DURATION_MS};
pub use operation_key::OperationKey;
pub use operation_record::OperationRecord;
pub use operation_result::{FailedResult, FailureKind, Outcome, SettledOutcome, StoredResult};

use chrono::{DateTime, SubsecRound, Utc};

/// Current time truncated to microseconds, the precision PostgreSQL keeps.
/// Records compared on exact values must survive a round-trip unchanged.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
