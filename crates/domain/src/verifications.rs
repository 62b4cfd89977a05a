//! Identity-service verification records.
//!
//! One verification per withdrawal; the insert-or-nothing guard makes the
//! worker's verify-and-emit idempotent under bus redelivery.

use crate::error::Result;
use async_trait::async_trait;
use cbsaga_shared::states::IdentityDecision;
use cbsaga_shared::{TraceId, VerificationId, WithdrawalId};
use serde_json::Value;
use sqlx::PgTransaction;

#[derive(Debug, Clone)]
pub struct VerifyAndEmitParams {
    pub verification_id: VerificationId,
    pub withdrawal_id: WithdrawalId,
    pub user_id: String,
    pub status: IdentityDecision,
    pub reason: Option<String>,
    pub outbox_event_type: String,
    pub outbox_payload: Value,
    pub trace_id: TraceId,
    pub route_key: String,
}

/// Result of a verify-and-emit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationApplication {
    Applied,
    /// A verification for this withdrawal already exists; no outbox event
    /// was produced.
    AlreadyVerified,
}

/// Transaction-aware verification repository port (identity service side).
#[async_trait]
pub trait VerificationRepositoryTx: Send + Sync {
    async fn verify_and_emit_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: VerifyAndEmitParams,
    ) -> Result<VerificationApplication>;
}
