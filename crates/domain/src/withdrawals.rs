//! Withdrawal aggregate, saga instance and their repository port.

use crate::error::{DomainError, Result};
use crate::outbox::OutboxEventInsert;
use async_trait::async_trait;
use cbsaga_shared::event_topics::{risk, withdrawal};
use cbsaga_shared::states::{IdentityDecision, RiskDecision, WithdrawalStatus};
use cbsaga_shared::{SagaId, TraceId, WithdrawalId};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgTransaction;

/// Full projection of a withdrawal row.
#[derive(Debug, Clone, PartialEq)]
pub struct Withdrawal {
    pub withdrawal_id: WithdrawalId,
    pub user_id: String,
    pub asset: String,
    pub amount_minor: i64,
    pub destination_addr: String,
    pub status: WithdrawalStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for the atomic admission insert: withdrawal + saga + outbox.
#[derive(Debug, Clone)]
pub struct CreateWithdrawalParams {
    pub withdrawal_id: WithdrawalId,
    pub saga_id: SagaId,
    pub user_id: String,
    pub asset: String,
    pub amount_minor: i64,
    pub destination_addr: String,
    pub trace_id: TraceId,
    pub outbox_events: Vec<OutboxEventInsert>,
}

/// What the admission insert committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedWithdrawal {
    pub withdrawal_id: WithdrawalId,
    pub status: WithdrawalStatus,
}

/// Result of a saga-step application.
///
/// `AlreadyProcessed` is the redelivery no-op: the saga row had advanced
/// past the step, so nothing was written and no outbox event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepApplication {
    Applied,
    AlreadyProcessed,
}

/// Parameters for applying an identity decision to the saga.
#[derive(Debug, Clone)]
pub struct ApplyIdentityResultParams {
    pub withdrawal_id: WithdrawalId,
    pub user_id: String,
    pub decision: IdentityDecision,
    pub reason: Option<String>,
    pub now: DateTime<Utc>,
    pub trace_id: TraceId,
    pub outbox_event_type: String,
    pub outbox_payload: Value,
    pub route_key: String,
}

impl ApplyIdentityResultParams {
    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(DomainError::validation("identity event: missing user_id"));
        }
        if self.trace_id.as_str().is_empty() {
            return Err(DomainError::validation("identity event: missing trace_id"));
        }
        if self.outbox_event_type != risk::EVENT_CHECK_REQUESTED
            && self.outbox_event_type != withdrawal::EVENT_FAILED
        {
            return Err(DomainError::validation(format!(
                "identity event: invalid outbox event type: {}",
                self.outbox_event_type
            )));
        }
        Ok(())
    }
}

/// Parameters for applying a risk decision to the saga.
#[derive(Debug, Clone)]
pub struct ApplyRiskResultParams {
    pub withdrawal_id: WithdrawalId,
    pub user_id: String,
    pub decision: RiskDecision,
    pub reason: Option<String>,
    pub now: DateTime<Utc>,
    pub trace_id: TraceId,
    pub outbox_event_type: String,
    pub outbox_payload: Value,
    pub route_key: String,
}

impl ApplyRiskResultParams {
    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(DomainError::validation("risk event: missing user_id"));
        }
        if self.trace_id.as_str().is_empty() {
            return Err(DomainError::validation("risk event: missing trace_id"));
        }
        if self.outbox_event_type != withdrawal::EVENT_COMPLETED
            && self.outbox_event_type != withdrawal::EVENT_FAILED
        {
            return Err(DomainError::validation(format!(
                "risk event: invalid outbox event type: {}",
                self.outbox_event_type
            )));
        }
        Ok(())
    }
}

/// Transaction-aware withdrawal/saga repository port.
#[async_trait]
pub trait WithdrawalRepositoryTx: Send + Sync {
    /// Insert the withdrawal (REQUESTED), its saga (STARTED/IDENTITY_CHECK)
    /// and every outbox event, all in the caller's transaction.
    ///
    /// A unique violation on the withdrawal id surfaces as
    /// `DomainError::WithdrawalAlreadyExists`, a reconcile signal rather
    /// than a failure.
    async fn create_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: CreateWithdrawalParams,
    ) -> Result<CreatedWithdrawal>;

    /// Apply an identity decision: conditional withdrawal + saga updates,
    /// then the next outbox event. Idempotent under redelivery.
    async fn apply_identity_result_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: ApplyIdentityResultParams,
    ) -> Result<StepApplication>;

    /// Apply a risk decision with the same shape as the identity applier.
    async fn apply_risk_result_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: ApplyRiskResultParams,
    ) -> Result<StepApplication>;

    /// Read-only projection from the pool.
    async fn get(&self, withdrawal_id: WithdrawalId) -> Result<Option<Withdrawal>>;

    /// Read-only projection inside the caller's transaction.
    async fn get_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        withdrawal_id: WithdrawalId,
    ) -> Result<Option<Withdrawal>>;
}
