//! Idempotency-key reservation with lease fencing.
//!
//! `(status, lease_fence, lease_owner)` is the fencing tuple. A fence
//! increment is the only way an expired lease changes hands, and every later
//! write must carry the fence it was issued; a slow original owner that
//! wakes up after its lease was stolen fails its finalize with
//! `LostLeaseOwnership` instead of overwriting the new owner's work.

use crate::error::Result;
use async_trait::async_trait;
use cbsaga_shared::states::IdempotencyStatus;
use cbsaga_shared::{AttemptId, WithdrawalId};
use chrono::{DateTime, Utc};
use sqlx::PgTransaction;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReserveIdempotencyParams {
    pub user_id: String,
    pub idempotency_key: String,
    pub request_hash: String,
    /// Candidate withdrawal id; discarded when the reservation loses to or
    /// steals an existing row.
    pub withdrawal_id: WithdrawalId,
    pub lease_attempt_id: AttemptId,
    pub lease_ttl: Duration,
    pub now: DateTime<Utc>,
}

/// Snapshot returned by a reservation attempt.
#[derive(Debug, Clone)]
pub struct ReserveIdempotencyOutcome {
    /// This attempt holds the lease and must drive the work transaction.
    pub owned: bool,
    /// The lease was taken over from an expired owner; `withdrawal_id` is
    /// the original candidate, not ours.
    pub stole_ownership: bool,
    pub status: IdempotencyStatus,
    pub withdrawal_id: WithdrawalId,
    pub request_hash: String,
    pub grpc_code: i32,
    pub lease_owner: String,
    pub lease_expires_at: DateTime<Utc>,
    pub lease_fence: i64,
}

#[derive(Debug, Clone)]
pub struct FinalizeIdempotencyParams {
    pub user_id: String,
    pub idempotency_key: String,
    pub grpc_code: i32,
    pub now: DateTime<Utc>,
    pub lease_attempt_id: AttemptId,
    pub lease_fence: i64,
}

/// Result of a finalize attempt. `LostLeaseOwnership` is an error, not an
/// outcome: it means another attempt owns the row now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// This update applied the terminal status.
    Applied,
    /// Another attempt already finalized the row.
    AlreadyFinalized,
}

/// Full projection of an idempotency row.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub status: IdempotencyStatus,
    pub withdrawal_id: WithdrawalId,
    pub request_hash: String,
    pub grpc_code: i32,
    pub lease_owner: String,
    pub lease_expires_at: DateTime<Utc>,
    pub lease_fence: i64,
}

/// Transaction-aware idempotency repository port.
#[async_trait]
pub trait IdempotencyRepositoryTx: Send + Sync {
    /// Reserve the key, steal an expired lease, or report the observed row.
    ///
    /// Fails with `DomainError::IdempotencyKeyReuse` when the stored
    /// request hash differs from the incoming one.
    async fn reserve_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: ReserveIdempotencyParams,
    ) -> Result<ReserveIdempotencyOutcome>;

    /// Finalize the row as COMPLETED, guarded by the fencing tuple.
    async fn complete_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: FinalizeIdempotencyParams,
    ) -> Result<FinalizeOutcome>;

    /// Finalize the row as FAILED, guarded by the fencing tuple.
    async fn fail_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        params: FinalizeIdempotencyParams,
    ) -> Result<FinalizeOutcome>;

    /// Read the row, `None` when absent.
    async fn get_with_tx(
        &self,
        tx: &mut PgTransaction<'_>,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>>;
}
