use super::{InsertOutcome, ReservationStore};
use crate::error::{AppError, Result};
use crate::models::{now_micros, OperationKey, Reservation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;

const INSERT_CONTENTION_ATTEMPTS: usize = 3;

/// Deletes KEYS[1] only while it still holds the expected lock id.
const COMPARE_AND_DELETE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
local decoded = cjson.decode(current)
if decoded['lock_id'] == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed reservations. `SET NX PX` gives the unique insert and the
/// server's own key expiry is the TTL reaper.
pub struct RedisReservationStore {
    client: redis::Client,
    key_prefix: String,
    compare_and_delete: redis::Script,
}

impl RedisReservationStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        }
    }

    fn make_key(&self, key: &OperationKey) -> String {
        format!("{}:reservation:{}", self.key_prefix, key.digest())
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }
}

/// Remaining lifetime in milliseconds, at least 1 so an already-stale
/// reservation still lands and is reported back to its caller.
fn ttl_millis(reservation: &Reservation, now: DateTime<Utc>) -> usize {
    (reservation.expired_at - now).num_milliseconds().max(1) as usize
}

#[async_trait]
impl ReservationStore for RedisReservationStore {
    async fn insert_unique(&self, reservation: &Reservation) -> Result<InsertOutcome<Reservation>> {
        let mut conn = self.connection().await?;
        let key = self.make_key(&reservation.key());
        let value = serde_json::to_string(reservation).map_err(AppError::Serialization)?;

        for _ in 0..INSERT_CONTENTION_ATTEMPTS {
            let set: Option<String> = conn
                .set_options(
                    &key,
                    &value,
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::PX(ttl_millis(reservation, now_micros()))),
                )
                .await
                .map_err(AppError::Redis)?;

            if set.is_some() {
                return Ok(InsertOutcome::Inserted);
            }

            let existing: Option<String> = conn.get(&key).await.map_err(AppError::Redis)?;
            if let Some(existing) = existing {
                let holder: Reservation =
                    serde_json::from_str(&existing).map_err(AppError::Serialization)?;
                return Ok(InsertOutcome::Duplicate(holder));
            }
        }

        Err(AppError::StoreUnavailable(format!(
            "reservation for {} kept changing hands during insert",
            reservation.key()
        )))
    }

    async fn find(&self, key: &OperationKey) -> Result<Option<Reservation>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(self.make_key(key)).await.map_err(AppError::Redis)?;

        value
            .map(|json| serde_json::from_str(&json).map_err(AppError::Serialization))
            .transpose()
    }

    async fn delete_if_matches(&self, expected: &Reservation) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = self
            .compare_and_delete
            .key(self.make_key(&expected.key()))
            .arg(expected.lock_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        Ok(deleted > 0)
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }
}
