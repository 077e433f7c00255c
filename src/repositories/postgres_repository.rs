use super::{
    ConfigRepository, InsertOutcome, LockStore, ReservationStore, ResultRepository,
};
use crate::error::{AppError, Result};
use crate::models::{
    FailedResult, Lock, OperationConfig, OperationKey, OperationRecord, Reservation, StoredResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Attempts before giving up on a reservation that keeps vanishing between
/// the conflicting insert and the read of its holder.
const INSERT_CONTENTION_ATTEMPTS: usize = 3;

/// PostgreSQL-backed store. Uniqueness comes from primary keys and
/// `ON CONFLICT DO NOTHING`; expired reservations are removed by
/// [`ReservationStore::purge_expired`].
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct OperationConfigRow {
    service: String,
    operation: String,
    lock_duration_ms: i64,
    allow_save_on_expired: bool,
}

impl TryFrom<OperationConfigRow> for OperationConfig {
    type Error = AppError;

    fn try_from(row: OperationConfigRow) -> Result<Self> {
        OperationConfig::new(
            row.service,
            row.operation,
            Duration::milliseconds(row.lock_duration_ms),
            row.allow_save_on_expired,
        )
    }
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ReservationStore for PostgresStore {
    async fn insert_unique(&self, reservation: &Reservation) -> Result<InsertOutcome<Reservation>> {
        for _ in 0..INSERT_CONTENTION_ATTEMPTS {
            let inserted = sqlx::query(
                r#"
                INSERT INTO idempotent_operation_reservation (service, operation, idempotency_key, lock_id, locked_at, expired_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (service, operation, idempotency_key) DO NOTHING
                "#,
            )
            .bind(&reservation.service)
            .bind(&reservation.operation)
            .bind(&reservation.idempotency_key)
            .bind(reservation.lock_id)
            .bind(reservation.locked_at)
            .bind(reservation.expired_at)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?
            .rows_affected();

            if inserted == 1 {
                return Ok(InsertOutcome::Inserted);
            }

            if let Some(existing) = self.find(&reservation.key()).await? {
                return Ok(InsertOutcome::Duplicate(existing));
            }
        }

        Err(AppError::StoreUnavailable(format!(
            "reservation for {} kept changing hands during insert",
            reservation.key()
        )))
    }

    async fn find(&self, key: &OperationKey) -> Result<Option<Reservation>> {
        let row = sqlx::query_as::<_, Reservation>(
            r#"
            SELECT service, operation, idempotency_key, lock_id, locked_at, expired_at
            FROM idempotent_operation_reservation
            WHERE service = $1 AND operation = $2 AND idempotency_key = $3
            "#,
        )
        .bind(&key.service)
        .bind(&key.operation)
        .bind(&key.idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    async fn delete_if_matches(&self, expected: &Reservation) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotent_operation_reservation
            WHERE service = $1 AND operation = $2 AND idempotency_key = $3 AND lock_id = $4
            "#,
        )
        .bind(&expected.service)
        .bind(&expected.operation)
        .bind(&expected.idempotency_key)
        .bind(expected.lock_id)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotent_operation_reservation
            WHERE expired_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LockStore for PostgresStore {
    async fn insert_lock(&self, lock: &Lock) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotent_operation_lock (lock_id, service, operation, idempotency_key, locked_at, expired_at, released_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (lock_id) DO NOTHING
            "#,
        )
        .bind(lock.lock_id)
        .bind(&lock.service)
        .bind(&lock.operation)
        .bind(&lock.idempotency_key)
        .bind(lock.locked_at)
        .bind(lock.expired_at)
        .bind(lock.released_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn find_lock(&self, lock_id: Uuid) -> Result<Option<Lock>> {
        let row = sqlx::query_as::<_, Lock>(
            r#"
            SELECT lock_id, service, operation, idempotency_key, locked_at, expired_at, released_at
            FROM idempotent_operation_lock
            WHERE lock_id = $1
            "#,
        )
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    async fn mark_released(&self, lock_id: Uuid, released_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE idempotent_operation_lock
            SET released_at = $2
            WHERE lock_id = $1 AND released_at IS NULL
            "#,
        )
        .bind(lock_id)
        .bind(released_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_expired_unreleased(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Lock>> {
        let rows = sqlx::query_as::<_, Lock>(
            r#"
            SELECT lock_id, service, operation, idempotency_key, locked_at, expired_at, released_at
            FROM idempotent_operation_lock
            WHERE released_at IS NULL AND expired_at <= $1
            ORDER BY expired_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    async fn find_latest_for_key(&self, key: &OperationKey, excluding: Uuid) -> Result<Option<Lock>> {
        let row = sqlx::query_as::<_, Lock>(
            r#"
            SELECT lock_id, service, operation, idempotency_key, locked_at, expired_at, released_at
            FROM idempotent_operation_lock
            WHERE service = $1 AND operation = $2 AND idempotency_key = $3 AND lock_id <> $4
            ORDER BY locked_at DESC
            LIMIT 1
            "#,
        )
        .bind(&key.service)
        .bind(&key.operation)
        .bind(&key.idempotency_key)
        .bind(excluding)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    async fn append_operation(&self, record: &OperationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotent_operation (id, service, operation, idempotency_key, lock_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.service)
        .bind(&record.operation)
        .bind(&record.idempotency_key)
        .bind(record.lock_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}

#[async_trait]
impl ResultRepository for PostgresStore {
    async fn insert_success(&self, result: &StoredResult) -> Result<InsertOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO stored_idempotent_operation_result (service, operation, idempotency_key, lock_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (service, operation, idempotency_key) DO NOTHING
            "#,
        )
        .bind(&result.service)
        .bind(&result.operation)
        .bind(&result.idempotency_key)
        .bind(result.lock_id)
        .bind(&result.payload)
        .bind(result.created_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?
        .rows_affected();

        if inserted == 1 {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::Duplicate(()))
        }
    }

    async fn find_success(&self, key: &OperationKey) -> Result<Option<StoredResult>> {
        let row = sqlx::query_as::<_, StoredResult>(
            r#"
            SELECT service, operation, idempotency_key, lock_id, payload, created_at
            FROM stored_idempotent_operation_result
            WHERE service = $1 AND operation = $2 AND idempotency_key = $3
            "#,
        )
        .bind(&key.service)
        .bind(&key.operation)
        .bind(&key.idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    async fn insert_failure(&self, failure: &FailedResult) -> Result<InsertOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO failed_idempotent_operation_result (lock_id, service, operation, idempotency_key, error_message, failure_kind, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (lock_id) DO NOTHING
            "#,
        )
        .bind(failure.lock_id)
        .bind(&failure.service)
        .bind(&failure.operation)
        .bind(&failure.idempotency_key)
        .bind(&failure.error_message)
        .bind(failure.kind)
        .bind(failure.created_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?
        .rows_affected();

        if inserted == 1 {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::Duplicate(()))
        }
    }

    async fn find_latest_failure(&self, key: &OperationKey) -> Result<Option<FailedResult>> {
        let row = sqlx::query_as::<_, FailedResult>(
            r#"
            SELECT lock_id, service, operation, idempotency_key, error_message, failure_kind, created_at
            FROM failed_idempotent_operation_result
            WHERE service = $1 AND operation = $2 AND idempotency_key = $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(&key.service)
        .bind(&key.operation)
        .bind(&key.idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }
}

#[async_trait]
impl ConfigRepository for PostgresStore {
    async fn find_config(&self, service: &str, operation: &str) -> Result<Option<OperationConfig>> {
        let row = sqlx::query_as::<_, OperationConfigRow>(
            r#"
            SELECT service, operation, lock_duration_ms, allow_save_on_expired
            FROM idempotent_operation_config
            WHERE service = $1 AND operation = $2
            "#,
        )
        .bind(service)
        .bind(operation)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        row.map(OperationConfig::try_from).transpose()
    }

    async fn upsert_config(&self, config: &OperationConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotent_operation_config (service, operation, lock_duration_ms, allow_save_on_expired)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (service, operation) DO UPDATE
            SET lock_duration_ms = EXCLUDED.lock_duration_ms,
                allow_save_on_expired = EXCLUDED.allow_save_on_expired,
                updated_at = NOW()
            "#,
        )
        .bind(&config.service)
        .bind(&config.operation)
        .bind(config.lock_duration_ms())
        .bind(config.allow_save_on_expired)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<OperationConfig>> {
        let rows = sqlx::query_as::<_, OperationConfigRow>(
            r#"
            SELECT service, operation, lock_duration_ms, allow_save_on_expired
            FROM idempotent_operation_config
            ORDER BY service, operation
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        rows.into_iter().map(OperationConfig::try_from).collect()
    }
}
