//! PostgreSQL idempotency-key repository.
//!
//! Concurrency control is entirely in the database: the primary key absorbs
//! racing inserts, the guarded UPDATE lets exactly one stealer win an
//! expired lease, and every finalize carries the `(owner, status, fence)`
//! tuple it was issued.

use async_trait::async_trait;
use cbsaga_domain::idempotency::{
    FinalizeIdempotencyParams, FinalizeOutcome, IdempotencyRecord, IdempotencyRepositoryTx,
    ReserveIdempotencyOutcome, ReserveIdempotencyParams,
};
use cbsaga_domain::{DomainError, Result};
use cbsaga_shared::states::IdempotencyStatus;
use cbsaga_shared::WithdrawalId;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, PgTransaction};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PostgresIdempotencyRepository {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct IdemRow {
    status: String,
    withdrawal_id: Uuid,
    request_hash: String,
    grpc_code: i32,
    lease_owner: String,
    lease_expires_at: DateTime<Utc>,
    lease_fence: i64,
}

impl PostgresIdempotencyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS orchestrator")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator.idempotency_keys (
                id UUID NOT NULL DEFAULT gen_random_uuid(),
                user_id TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                withdrawal_id UUID NOT NULL,
                request_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                grpc_code INTEGER NOT NULL DEFAULT 0,
                response_code INTEGER NOT NULL DEFAULT 0,
                response_body_json JSONB NOT NULL DEFAULT '{}',
                lease_owner TEXT NOT NULL,
                lease_expires_at TIMESTAMPTZ NOT NULL,
                lease_fence BIGINT NOT NULL DEFAULT 1,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (user_id, idempotency_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn read_status(
        &self,
        tx: &mut PgTransaction<'_>,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<IdempotencyStatus> {
        let status = sqlx::query_scalar::<_, String>(
            r#"
            SELECT status
            FROM orchestrator.idempotency_keys
            WHERE user_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(user_id)
        .bind(idempotency_key)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(DomainError::IdempotencyKeyNotFound)?;
        Ok(status.parse()?)
    }

    async fn finalize(
        &self,
        tx: &mut PgTransaction<'_>,
        params: FinalizeIdempotencyParams,
        status: IdempotencyStatus,
        response_code: i32,
    ) -> Result<FinalizeOutcome> {
        let updated = sqlx::query(
            r#"
            UPDATE orchestrator.idempotency_keys
            SET status = $3,
                grpc_code = $4,
                response_code = $5,
                updated_at = $6
            WHERE user_id = $1
              AND idempotency_key = $2
              AND lease_owner = $7
              AND status = 'IN_PROGRESS'
              AND lease_fence = $8
            "#,
        )
        .bind(&params.user_id)
        .bind(&params.idempotency_key)
        .bind(status.as_str())
        .bind(params.grpc_code)
        .bind(response_code)
        .bind(params.now)
        .bind(params.lease_attempt_id.as_str())
        .bind(params.lease_fence)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(FinalizeOutcome::Applied);
        }

        // Classify the miss: terminal row vs. a lease that changed hands.
        let status = self
            .read_status(tx, &params.user_id, &params.idempotency_key)
            .await?;
        if status.is_terminal() {
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }
        Err(DomainError::LostLeaseOwnership)
    }
}

#[async_trait]
impl IdempotencyRepositoryTx for PostgresIdempotencyRepository {
    async fn reserve_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: ReserveIdempotencyParams,
    ) -> Result<ReserveIdempotencyOutcome> {
        let lease_expires_at = params.now
            + chrono::Duration::from_std(params.lease_ttl)
                .map_err(|e| DomainError::invariant(format!("lease ttl out of range: {e}")))?;

        let inserted = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO orchestrator.idempotency_keys (
                user_id,
                idempotency_key,
                withdrawal_id,
                request_hash,
                status,
                grpc_code,
                response_code,
                response_body_json,
                updated_at,
                lease_owner,
                lease_expires_at,
                lease_fence
            )
            VALUES ($1, $2, $3, $4, 'IN_PROGRESS', 0, 0, '{}', $5, $6, $7, 1)
            ON CONFLICT (user_id, idempotency_key) DO NOTHING
            RETURNING true
            "#,
        )
        .bind(&params.user_id)
        .bind(&params.idempotency_key)
        .bind(params.withdrawal_id.as_uuid())
        .bind(&params.request_hash)
        .bind(params.now)
        .bind(params.lease_attempt_id.as_str())
        .bind(lease_expires_at)
        .fetch_optional(&mut **tx)
        .await?
        .is_some();

        if inserted {
            return Ok(ReserveIdempotencyOutcome {
                owned: true,
                stole_ownership: false,
                status: IdempotencyStatus::InProgress,
                withdrawal_id: params.withdrawal_id,
                request_hash: params.request_hash,
                grpc_code: 0,
                lease_owner: params.lease_attempt_id.to_string(),
                lease_expires_at,
                lease_fence: 1,
            });
        }

        let row = sqlx::query_as::<_, IdemRow>(
            r#"
            SELECT status, withdrawal_id, request_hash, grpc_code,
                   lease_owner, lease_expires_at, lease_fence
            FROM orchestrator.idempotency_keys
            WHERE user_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(&params.user_id)
        .bind(&params.idempotency_key)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(DomainError::IdempotencyKeyNotFound)?;

        if row.request_hash != params.request_hash {
            return Err(DomainError::IdempotencyKeyReuse);
        }

        let status: IdempotencyStatus = row.status.parse()?;

        if status == IdempotencyStatus::InProgress && row.lease_expires_at <= params.now {
            // Expired lease: exactly one concurrent stealer wins this UPDATE.
            // The stealer binds to the row's existing withdrawal id.
            let stolen = sqlx::query_as::<_, (i64, Uuid, String, DateTime<Utc>)>(
                r#"
                UPDATE orchestrator.idempotency_keys
                SET lease_owner = $3,
                    lease_expires_at = $4,
                    updated_at = $5,
                    lease_fence = lease_fence + 1
                WHERE user_id = $1
                  AND idempotency_key = $2
                  AND status = 'IN_PROGRESS'
                  AND lease_expires_at <= $5
                RETURNING lease_fence, withdrawal_id, request_hash, lease_expires_at
                "#,
            )
            .bind(&params.user_id)
            .bind(&params.idempotency_key)
            .bind(params.lease_attempt_id.as_str())
            .bind(lease_expires_at)
            .bind(params.now)
            .fetch_optional(&mut **tx)
            .await?;

            if let Some((fence, withdrawal_id, request_hash, expires_at)) = stolen {
                return Ok(ReserveIdempotencyOutcome {
                    owned: true,
                    stole_ownership: true,
                    status: IdempotencyStatus::InProgress,
                    withdrawal_id: WithdrawalId(withdrawal_id),
                    request_hash,
                    grpc_code: 0,
                    lease_owner: params.lease_attempt_id.to_string(),
                    lease_expires_at: expires_at,
                    lease_fence: fence,
                });
            }
            // Lost the steal race; report the row as observed.
        }

        Ok(ReserveIdempotencyOutcome {
            owned: false,
            stole_ownership: false,
            status,
            withdrawal_id: WithdrawalId(row.withdrawal_id),
            request_hash: row.request_hash,
            grpc_code: row.grpc_code,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            lease_fence: row.lease_fence,
        })
    }

    async fn complete_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: FinalizeIdempotencyParams,
    ) -> Result<FinalizeOutcome> {
        self.finalize(tx, params, IdempotencyStatus::Completed, 200)
            .await
    }

    async fn fail_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: FinalizeIdempotencyParams,
    ) -> Result<FinalizeOutcome> {
        self.finalize(tx, params, IdempotencyStatus::Failed, 500)
            .await
    }

    async fn get_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query_as::<_, IdemRow>(
            r#"
            SELECT status, withdrawal_id, request_hash, grpc_code,
                   lease_owner, lease_expires_at, lease_fence
            FROM orchestrator.idempotency_keys
            WHERE user_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(user_id)
        .bind(idempotency_key)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|row| {
            Ok(IdempotencyRecord {
                status: row.status.parse()?,
                withdrawal_id: WithdrawalId(row.withdrawal_id),
                request_hash: row.request_hash,
                grpc_code: row.grpc_code,
                lease_owner: row.lease_owner,
                lease_expires_at: row.lease_expires_at,
                lease_fence: row.lease_fence,
            })
        })
        .transpose()
    }
}
