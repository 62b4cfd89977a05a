//! PostgreSQL withdrawal/saga repository.
//!
//! Business rows are written strictly before outbox rows inside the same
//! transaction, so an outbox reader never refers to state that does not
//! exist.

use async_trait::async_trait;
use cbsaga_domain::withdrawals::{
    ApplyIdentityResultParams, ApplyRiskResultParams, CreateWithdrawalParams, CreatedWithdrawal,
    StepApplication, Withdrawal, WithdrawalRepositoryTx,
};
use cbsaga_domain::{DomainError, Result};
use cbsaga_shared::event_topics::withdrawal as withdrawal_topics;
use cbsaga_shared::states::WithdrawalStatus;
use cbsaga_shared::WithdrawalId;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;
use sqlx::{PgPool, PgTransaction};
use tracing::warn;
use uuid::Uuid;

use super::errors::is_unique_violation;

#[derive(Debug, Clone)]
pub struct PostgresWithdrawalRepository {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct WithdrawalRow {
    id: Uuid,
    user_id: String,
    asset: String,
    amount_minor: i64,
    destination_addr: String,
    status: String,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WithdrawalRow {
    fn into_withdrawal(self) -> Result<Withdrawal> {
        Ok(Withdrawal {
            withdrawal_id: WithdrawalId(self.id),
            user_id: self.user_id,
            asset: self.asset,
            amount_minor: self.amount_minor,
            destination_addr: self.destination_addr,
            status: self.status.parse()?,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl PostgresWithdrawalRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS orchestrator")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator.withdrawals (
                id UUID PRIMARY KEY,
                user_id TEXT NOT NULL,
                asset TEXT NOT NULL,
                amount_minor BIGINT NOT NULL CHECK (amount_minor > 0),
                destination_addr TEXT NOT NULL,
                status TEXT NOT NULL,
                failure_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator.saga_instances (
                saga_id UUID PRIMARY KEY,
                withdrawal_id UUID NOT NULL UNIQUE
                    REFERENCES orchestrator.withdrawals(id),
                state TEXT NOT NULL,
                current_step TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator.outbox_events (
                event_id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                aggregate_type TEXT NOT NULL,
                aggregate_id UUID NOT NULL,
                event_type TEXT NOT NULL,
                payload_json JSONB NOT NULL,
                trace_id TEXT NOT NULL,
                route_key TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                published_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_events_unpublished \
             ON orchestrator.outbox_events(created_at) WHERE published_at IS NULL",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch<'e, E>(executor: E, withdrawal_id: WithdrawalId) -> Result<Option<Withdrawal>>
    where
        E: PgExecutor<'e>,
    {
        let row = sqlx::query_as::<_, WithdrawalRow>(
            r#"
            SELECT id, user_id, asset, amount_minor, destination_addr,
                   status, failure_reason, created_at, updated_at
            FROM orchestrator.withdrawals
            WHERE id = $1
            "#,
        )
        .bind(withdrawal_id.as_uuid())
        .fetch_optional(executor)
        .await?;

        row.map(WithdrawalRow::into_withdrawal).transpose()
    }
}

#[async_trait]
impl WithdrawalRepositoryTx for PostgresWithdrawalRepository {
    async fn create_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: CreateWithdrawalParams,
    ) -> Result<CreatedWithdrawal> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO orchestrator.withdrawals
                (id, user_id, asset, amount_minor, destination_addr, status)
            VALUES ($1, $2, $3, $4, $5, 'REQUESTED')
            "#,
        )
        .bind(params.withdrawal_id.as_uuid())
        .bind(&params.user_id)
        .bind(&params.asset)
        .bind(params.amount_minor)
        .bind(&params.destination_addr)
        .execute(&mut **tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(DomainError::WithdrawalAlreadyExists);
            }
            return Err(err.into());
        }

        sqlx::query(
            r#"
            INSERT INTO orchestrator.saga_instances
                (saga_id, withdrawal_id, state, current_step, attempt)
            VALUES ($1, $2, 'STARTED', 'IDENTITY_CHECK', 0)
            "#,
        )
        .bind(params.saga_id.0)
        .bind(params.withdrawal_id.as_uuid())
        .execute(&mut **tx)
        .await?;

        for event in &params.outbox_events {
            sqlx::query(
                r#"
                INSERT INTO orchestrator.outbox_events
                    (aggregate_type, aggregate_id, event_type, payload_json, trace_id, route_key)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(withdrawal_topics::AGGREGATE_TYPE)
            .bind(params.withdrawal_id.as_uuid())
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(params.trace_id.as_str())
            .bind(&event.route_key)
            .execute(&mut **tx)
            .await?;
        }

        Ok(CreatedWithdrawal {
            withdrawal_id: params.withdrawal_id,
            status: WithdrawalStatus::Requested,
        })
    }

    async fn apply_identity_result_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: ApplyIdentityResultParams,
    ) -> Result<StepApplication> {
        params.validate()?;

        sqlx::query(
            r#"
            UPDATE orchestrator.withdrawals
            SET status = CASE
                    WHEN $2 = 'VERIFIED' THEN 'IN_PROGRESS'
                    ELSE 'FAILED'
                END,
                failure_reason = CASE
                    WHEN $2 = 'VERIFIED' THEN NULL
                    ELSE COALESCE($3, 'identity rejected')
                END,
                updated_at = $4
            WHERE id = $1
              AND (
                  ($2 = 'VERIFIED' AND status = 'REQUESTED')
                  OR ($2 = 'REJECTED' AND status IN ('REQUESTED', 'IN_PROGRESS'))
              )
            "#,
        )
        .bind(params.withdrawal_id.as_uuid())
        .bind(params.decision.as_str())
        .bind(&params.reason)
        .bind(params.now)
        .execute(&mut **tx)
        .await?;

        let saga = sqlx::query(
            r#"
            UPDATE orchestrator.saga_instances
            SET current_step = CASE
                    WHEN $2 = 'VERIFIED' THEN 'RISK_CHECK'
                    ELSE 'FAILED'
                END,
                state = CASE
                    WHEN $2 = 'VERIFIED' THEN 'IN_PROGRESS'
                    ELSE 'FAILED'
                END,
                updated_at = $3
            WHERE withdrawal_id = $1
              AND current_step = 'IDENTITY_CHECK'
              AND state IN ('STARTED', 'IN_PROGRESS')
            "#,
        )
        .bind(params.withdrawal_id.as_uuid())
        .bind(params.decision.as_str())
        .bind(params.now)
        .execute(&mut **tx)
        .await?;

        if saga.rows_affected() != 1 {
            // The saga already advanced past IDENTITY_CHECK: a redelivery.
            warn!(
                withdrawal_id = %params.withdrawal_id,
                decision = %params.decision,
                no_op = true,
                "identity result already applied"
            );
            return Ok(StepApplication::AlreadyProcessed);
        }

        sqlx::query(
            r#"
            INSERT INTO orchestrator.outbox_events
                (aggregate_type, aggregate_id, event_type, payload_json, trace_id, route_key)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(withdrawal_topics::AGGREGATE_TYPE)
        .bind(params.withdrawal_id.as_uuid())
        .bind(&params.outbox_event_type)
        .bind(&params.outbox_payload)
        .bind(params.trace_id.as_str())
        .bind(&params.route_key)
        .execute(&mut **tx)
        .await?;

        Ok(StepApplication::Applied)
    }

    async fn apply_risk_result_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: ApplyRiskResultParams,
    ) -> Result<StepApplication> {
        params.validate()?;

        sqlx::query(
            r#"
            UPDATE orchestrator.withdrawals
            SET status = CASE
                    WHEN $2 = 'APPROVED' THEN 'COMPLETED'
                    ELSE 'FAILED'
                END,
                failure_reason = CASE
                    WHEN $2 = 'APPROVED' THEN NULL
                    ELSE COALESCE($3, 'risk rejected')
                END,
                updated_at = $4
            WHERE id = $1
              AND (
                  ($2 = 'APPROVED' AND status = 'IN_PROGRESS')
                  OR ($2 = 'REJECTED' AND status IN ('REQUESTED', 'IN_PROGRESS'))
              )
            "#,
        )
        .bind(params.withdrawal_id.as_uuid())
        .bind(params.decision.as_str())
        .bind(&params.reason)
        .bind(params.now)
        .execute(&mut **tx)
        .await?;

        // Settlement never runs here: an approved risk check records the
        // SETTLEMENT step and closes the saga.
        let saga = sqlx::query(
            r#"
            UPDATE orchestrator.saga_instances
            SET current_step = CASE
                    WHEN $2 = 'APPROVED' THEN 'SETTLEMENT'
                    ELSE 'FAILED'
                END,
                state = CASE
                    WHEN $2 = 'APPROVED' THEN 'COMPLETED'
                    ELSE 'FAILED'
                END,
                updated_at = $3
            WHERE withdrawal_id = $1
              AND current_step = 'RISK_CHECK'
              AND state = 'IN_PROGRESS'
            "#,
        )
        .bind(params.withdrawal_id.as_uuid())
        .bind(params.decision.as_str())
        .bind(params.now)
        .execute(&mut **tx)
        .await?;

        if saga.rows_affected() != 1 {
            warn!(
                withdrawal_id = %params.withdrawal_id,
                decision = %params.decision,
                no_op = true,
                "risk result already applied"
            );
            return Ok(StepApplication::AlreadyProcessed);
        }

        sqlx::query(
            r#"
            INSERT INTO orchestrator.outbox_events
                (aggregate_type, aggregate_id, event_type, payload_json, trace_id, route_key)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(withdrawal_topics::AGGREGATE_TYPE)
        .bind(params.withdrawal_id.as_uuid())
        .bind(&params.outbox_event_type)
        .bind(&params.outbox_payload)
        .bind(params.trace_id.as_str())
        .bind(&params.route_key)
        .execute(&mut **tx)
        .await?;

        Ok(StepApplication::Applied)
    }

    async fn get(&self, withdrawal_id: WithdrawalId) -> Result<Option<Withdrawal>> {
        Self::fetch(&self.pool, withdrawal_id).await
    }

    async fn get_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        withdrawal_id: WithdrawalId,
    ) -> Result<Option<Withdrawal>> {
        Self::fetch(&mut **tx, withdrawal_id).await
    }
}
