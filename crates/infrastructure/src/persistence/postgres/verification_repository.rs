//! PostgreSQL verification repository (identity service side).

use async_trait::async_trait;
use cbsaga_domain::verifications::{
    VerificationApplication, VerificationRepositoryTx, VerifyAndEmitParams,
};
use cbsaga_domain::Result;
use cbsaga_shared::event_topics::identity as identity_topics;
use sqlx::{PgPool, PgTransaction};

#[derive(Debug, Clone)]
pub struct PostgresVerificationRepository {
    pool: PgPool,
}

impl PostgresVerificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS identity")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identity.verifications (
                verification_id UUID PRIMARY KEY,
                withdrawal_id UUID NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identity.outbox_events (
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

        Ok(())
    }
}

#[async_trait]
impl VerificationRepositoryTx for PostgresVerificationRepository {
    async fn verify_and_emit_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: VerifyAndEmitParams,
    ) -> Result<VerificationApplication> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO identity.verifications
                (verification_id, withdrawal_id, user_id, status, reason)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (withdrawal_id) DO NOTHING
            "#,
        )
        .bind(params.verification_id.0)
        .bind(params.withdrawal_id.as_uuid())
        .bind(&params.user_id)
        .bind(params.status.as_str())
        .bind(&params.reason)
        .execute(&mut **tx)
        .await?;

        // One verification per withdrawal: a redelivered command finds the
        // row and emits nothing.
        if inserted.rows_affected() == 0 {
            return Ok(VerificationApplication::AlreadyVerified);
        }

        sqlx::query(
            r#"
            INSERT INTO identity.outbox_events
                (aggregate_type, aggregate_id, event_type, payload_json, trace_id, route_key)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(identity_topics::AGGREGATE_TYPE)
        .bind(params.withdrawal_id.as_uuid())
        .bind(&params.outbox_event_type)
        .bind(&params.outbox_payload)
        .bind(params.trace_id.as_str())
        .bind(&params.route_key)
        .execute(&mut **tx)
        .await?;

        Ok(VerificationApplication::Applied)
    }
}
