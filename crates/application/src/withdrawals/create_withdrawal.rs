//! Withdrawal admission.
//!
//! `CreateWithdrawalUseCase` ties idempotency-key reservation, the atomic
//! work transaction (withdrawal + saga + outbox + finalize) and
//! reconciliation into one control flow. The guiding rule: errors that mean
//! the database's truth is unknown (commit-unknown, lost lease, duplicate
//! withdrawal) re-enter reconcile, which maps the durable state back onto a
//! response; local opinions (validation, key reuse) fail fast.

use cbsaga_domain::codec::encode_valid;
use cbsaga_domain::events::{VerifyIdentityRequestedPayload, WithdrawalRequestedPayload};
use cbsaga_domain::idempotency::{
    FinalizeIdempotencyParams, FinalizeOutcome, IdempotencyRecord, IdempotencyRepositoryTx,
    ReserveIdempotencyOutcome, ReserveIdempotencyParams,
};
use cbsaga_domain::outbox::OutboxEventInsert;
use cbsaga_domain::withdrawals::{CreateWithdrawalParams, WithdrawalRepositoryTx};
use cbsaga_domain::{DomainError, Result};
use cbsaga_infrastructure::persistence::postgres::{with_read_tx, with_tx};
use cbsaga_shared::event_topics::{identity as identity_topics, withdrawal as withdrawal_topics};
use cbsaga_shared::retry::{self, RetryConfig};
use cbsaga_shared::states::{IdempotencyStatus, WithdrawalStatus};
use cbsaga_shared::{AttemptId, SagaId, TraceId, WithdrawalId};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::retry_policy::is_retryable_finalize;

/// How long a reservation lease protects an in-flight admission.
const LEASE_TTL: Duration = Duration::from_secs(30);

/// Deadline for the post-commit reconcile pass after an ambiguous commit.
const RECONCILE_DEADLINE: Duration = Duration::from_secs(2);

const GRPC_CODE_OK: i32 = 0;
const GRPC_CODE_INTERNAL: i32 = 13;

#[derive(Debug, Clone)]
pub struct CreateWithdrawalRequest {
    pub user_id: String,
    pub asset: String,
    pub amount_minor: i64,
    pub destination_addr: String,
    pub idempotency_key: String,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateWithdrawalResponse {
    pub withdrawal_id: WithdrawalId,
    pub status: WithdrawalStatus,
}

/// Normalized request with its canonical hash.
#[derive(Debug, Clone)]
struct ValidatedCreateWithdrawal {
    user_id: String,
    asset: String,
    amount_minor: i64,
    destination_addr: String,
    idempotency_key: String,
    trace_id: TraceId,
    request_hash: String,
}

impl ValidatedCreateWithdrawal {
    fn new(request: CreateWithdrawalRequest) -> Result<Self> {
        let user_id = request.user_id.trim().to_string();
        let asset = request.asset.trim().to_uppercase();
        let destination_addr = request.destination_addr.trim().to_string();
        let idempotency_key = request.idempotency_key.trim().to_string();

        if user_id.is_empty()
            || asset.is_empty()
            || destination_addr.is_empty()
            || idempotency_key.is_empty()
        {
            return Err(DomainError::invalid_input("missing required fields"));
        }
        if request.amount_minor <= 0 {
            return Err(DomainError::invalid_input("amount_minor must be > 0"));
        }

        let trace_id = match request.trace_id {
            Some(trace) if !trace.is_empty() => TraceId::from_string(trace),
            _ => TraceId::new(),
        };

        let request_hash =
            canonical_request_hash(&user_id, &asset, request.amount_minor, &destination_addr);

        Ok(Self {
            user_id,
            asset,
            amount_minor: request.amount_minor,
            destination_addr,
            idempotency_key,
            trace_id,
            request_hash,
        })
    }
}

/// SHA-256 over the canonical request tuple, hex encoded. Semantically equal
/// requests must collide, so the hash runs over the normalized fields.
fn canonical_request_hash(
    user_id: &str,
    asset: &str,
    amount_minor: i64,
    destination_addr: &str,
) -> String {
    let canonical = format!(
        "user_id={user_id}|asset={asset}|amount_minor={amount_minor}|destination_addr={destination_addr}"
    );
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Does the work transaction still hold the lease it reserved?
fn lease_still_held(record: &IdempotencyRecord, attempt_id: &AttemptId, fence: i64) -> bool {
    record.status == IdempotencyStatus::InProgress
        && record.lease_owner == attempt_id.as_str()
        && record.lease_fence == fence
}

/// Map the durable idempotency/withdrawal state onto an admission response.
fn map_reconcile(
    record: Option<&IdempotencyRecord>,
    withdrawal_found: bool,
) -> Result<CreateWithdrawalResponse> {
    let Some(record) = record else {
        return Err(DomainError::IdempotencyInProgress {
            withdrawal_id: None,
        });
    };

    match record.status {
        IdempotencyStatus::Completed => {
            if !withdrawal_found {
                return Err(DomainError::invariant(format!(
                    "idempotency row COMPLETED but withdrawal {} is missing",
                    record.withdrawal_id
                )));
            }
            Ok(CreateWithdrawalResponse {
                withdrawal_id: record.withdrawal_id,
                status: WithdrawalStatus::Requested,
            })
        }
        IdempotencyStatus::Failed => Err(DomainError::PreviousAttemptFailed {
            grpc_code: record.grpc_code,
        }),
        IdempotencyStatus::InProgress => {
            if withdrawal_found {
                // A concurrent admitter made progress; its withdrawal is
                // the answer.
                Ok(CreateWithdrawalResponse {
                    withdrawal_id: record.withdrawal_id,
                    status: WithdrawalStatus::Requested,
                })
            } else {
                Err(DomainError::IdempotencyInProgress {
                    withdrawal_id: Some(record.withdrawal_id),
                })
            }
        }
    }
}

pub struct CreateWithdrawalUseCase {
    pool: PgPool,
    idempotency: Arc<dyn IdempotencyRepositoryTx>,
    withdrawals: Arc<dyn WithdrawalRepositoryTx>,
}

impl CreateWithdrawalUseCase {
    pub fn new(
        pool: PgPool,
        idempotency: Arc<dyn IdempotencyRepositoryTx>,
        withdrawals: Arc<dyn WithdrawalRepositoryTx>,
    ) -> Self {
        Self {
            pool,
            idempotency,
            withdrawals,
        }
    }

    pub async fn execute(
        &self,
        request: CreateWithdrawalRequest,
    ) -> Result<CreateWithdrawalResponse> {
        let validated = ValidatedCreateWithdrawal::new(request)?;
        let now = Utc::now();

        let candidate_id = WithdrawalId::new();
        let saga_id = SagaId::new();
        let attempt_id = AttemptId::new();

        // Reserve phase (txn #1).
        let reserved = match self
            .reserve(&validated, candidate_id, &attempt_id, now)
            .await
        {
            Ok(outcome) => outcome,
            Err(DomainError::IdempotencyKeyReuse) => {
                return Err(DomainError::IdempotencyKeyReuse);
            }
            Err(err @ DomainError::CommitUnknown { .. }) => {
                warn!(error = %err, "reserve commit outcome unknown, reconciling");
                return self.reconcile(&validated).await;
            }
            Err(err) => return Err(err),
        };

        if !reserved.owned {
            return self.reconcile(&validated).await;
        }

        if reserved.stole_ownership {
            info!(
                withdrawal_id = %reserved.withdrawal_id,
                lease_fence = reserved.lease_fence,
                "stole expired idempotency lease"
            );
        }

        // Work phase (txn #2). The stolen-lease case binds to the row's
        // existing withdrawal id, never to our candidate.
        match self
            .run_work_tx(&validated, &reserved, saga_id, &attempt_id, now)
            .await
        {
            Ok(response) => Ok(response),
            Err(DomainError::WithdrawalAlreadyExists) => {
                // Another attempt committed the withdrawal; not a failure.
                self.reconcile(&validated).await
            }
            Err(DomainError::LostLeaseOwnership) | Err(DomainError::AlreadyFinalized) => {
                self.reconcile(&validated).await
            }
            Err(err @ DomainError::CommitUnknown { .. }) => {
                warn!(error = %err, "work commit outcome unknown, reconciling with deadline");
                self.reconcile_after_ambiguous_commit(&validated, reserved.withdrawal_id)
                    .await
            }
            Err(err @ DomainError::BeginTx { .. }) => {
                error!(error = %err, "work tx begin failed");
                match self
                    .fail_idempotency_with_retry(&validated, &reserved, &attempt_id, now)
                    .await
                {
                    Ok(FinalizeOutcome::Applied) => Err(DomainError::CreateWithdrawalFailed),
                    Ok(FinalizeOutcome::AlreadyFinalized) | Err(_) => {
                        self.reconcile(&validated).await
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "work tx failed");
                if let Err(fail_err) = self
                    .fail_idempotency_with_retry(&validated, &reserved, &attempt_id, now)
                    .await
                {
                    warn!(error = %fail_err, "failing idempotency row did not apply");
                }
                self.reconcile(&validated).await
            }
        }
    }

    async fn reserve(
        &self,
        validated: &ValidatedCreateWithdrawal,
        candidate_id: WithdrawalId,
        attempt_id: &AttemptId,
        now: DateTime<Utc>,
    ) -> Result<ReserveIdempotencyOutcome> {
        let idempotency = self.idempotency.clone();
        let params = ReserveIdempotencyParams {
            user_id: validated.user_id.clone(),
            idempotency_key: validated.idempotency_key.clone(),
            request_hash: validated.request_hash.clone(),
            withdrawal_id: candidate_id,
            lease_attempt_id: attempt_id.clone(),
            lease_ttl: LEASE_TTL,
            now,
        };
        with_tx(&self.pool, "withdrawal.reserve", move |tx| {
            Box::pin(async move { idempotency.reserve_with_tx(tx, params).await })
        })
        .await
    }

    async fn run_work_tx(
        &self,
        validated: &ValidatedCreateWithdrawal,
        reserved: &ReserveIdempotencyOutcome,
        saga_id: SagaId,
        attempt_id: &AttemptId,
        now: DateTime<Utc>,
    ) -> Result<CreateWithdrawalResponse> {
        let idempotency = self.idempotency.clone();
        let withdrawals = self.withdrawals.clone();
        let validated = validated.clone();
        let stole_ownership = reserved.stole_ownership;
        let withdrawal_id = reserved.withdrawal_id;
        let lease_fence = reserved.lease_fence;
        let attempt_id = attempt_id.clone();

        with_tx(&self.pool, "withdrawal.work", move |tx| {
            Box::pin(async move {
                if stole_ownership {
                    // A still-alive previous owner may have finalized
                    // between our reserve and this transaction; re-verify
                    // the fencing tuple before writing anything.
                    let record = idempotency
                        .get_with_tx(tx, &validated.user_id, &validated.idempotency_key)
                        .await?
                        .ok_or(DomainError::IdempotencyKeyNotFound)?;
                    if !lease_still_held(&record, &attempt_id, lease_fence) {
                        return Err(DomainError::LostLeaseOwnership);
                    }
                }

                let withdrawal_event = encode_valid(&WithdrawalRequestedPayload {
                    withdrawal_id,
                    user_id: validated.user_id.clone(),
                })?;
                let identity_command = encode_valid(&VerifyIdentityRequestedPayload {
                    withdrawal_id,
                    user_id: validated.user_id.clone(),
                })?;

                let created = withdrawals
                    .create_with_tx(
                        tx,
                        CreateWithdrawalParams {
                            withdrawal_id,
                            saga_id,
                            user_id: validated.user_id.clone(),
                            asset: validated.asset.clone(),
                            amount_minor: validated.amount_minor,
                            destination_addr: validated.destination_addr.clone(),
                            trace_id: validated.trace_id.clone(),
                            outbox_events: vec![
                                OutboxEventInsert::new(
                                    withdrawal_topics::EVENT_REQUESTED,
                                    withdrawal_event,
                                    withdrawal_topics::ROUTE_KEY_EVT,
                                ),
                                OutboxEventInsert::new(
                                    identity_topics::EVENT_VERIFY_REQUESTED,
                                    identity_command,
                                    identity_topics::ROUTE_KEY_CMD,
                                ),
                            ],
                        },
                    )
                    .await?;

                // Finalize inside the same transaction: the withdrawal and
                // the COMPLETED idempotency row commit together.
                match idempotency
                    .complete_with_tx(
                        tx,
                        FinalizeIdempotencyParams {
                            user_id: validated.user_id.clone(),
                            idempotency_key: validated.idempotency_key.clone(),
                            grpc_code: GRPC_CODE_OK,
                            now,
                            lease_attempt_id: attempt_id,
                            lease_fence,
                        },
                    )
                    .await?
                {
                    FinalizeOutcome::Applied => Ok(CreateWithdrawalResponse {
                        withdrawal_id: created.withdrawal_id,
                        status: created.status,
                    }),
                    FinalizeOutcome::AlreadyFinalized => Err(DomainError::AlreadyFinalized),
                }
            })
        })
        .await
    }

    /// Mark the idempotency row FAILED, retrying transient faults.
    async fn fail_idempotency_with_retry(
        &self,
        validated: &ValidatedCreateWithdrawal,
        reserved: &ReserveIdempotencyOutcome,
        attempt_id: &AttemptId,
        now: DateTime<Utc>,
    ) -> Result<FinalizeOutcome> {
        let lease_fence = reserved.lease_fence;
        retry::run(RetryConfig::default(), is_retryable_finalize, || {
            let idempotency = self.idempotency.clone();
            let params = FinalizeIdempotencyParams {
                user_id: validated.user_id.clone(),
                idempotency_key: validated.idempotency_key.clone(),
                grpc_code: GRPC_CODE_INTERNAL,
                now,
                lease_attempt_id: attempt_id.clone(),
                lease_fence,
            };
            async move {
                with_tx(&self.pool, "withdrawal.fail-idem", move |tx| {
                    Box::pin(async move { idempotency.fail_with_tx(tx, params).await })
                })
                .await
            }
        })
        .await
    }

    /// Read-only pass mapping the durable truth back onto a response.
    async fn reconcile(
        &self,
        validated: &ValidatedCreateWithdrawal,
    ) -> Result<CreateWithdrawalResponse> {
        let idempotency = self.idempotency.clone();
        let withdrawals = self.withdrawals.clone();
        let user_id = validated.user_id.clone();
        let idempotency_key = validated.idempotency_key.clone();

        with_read_tx(&self.pool, "withdrawal.reconcile", move |tx| {
            Box::pin(async move {
                let record = idempotency
                    .get_with_tx(tx, &user_id, &idempotency_key)
                    .await?;

                let withdrawal_found = match &record {
                    Some(record) => withdrawals
                        .get_with_tx(tx, record.withdrawal_id)
                        .await?
                        .is_some(),
                    None => false,
                };

                map_reconcile(record.as_ref(), withdrawal_found)
            })
        })
        .await
    }

    /// Post-commit reconcile under a fresh, bounded deadline. A caller may
    /// already have cancelled; the short deadline still lets us learn the
    /// true outcome instead of guessing.
    async fn reconcile_after_ambiguous_commit(
        &self,
        validated: &ValidatedCreateWithdrawal,
        withdrawal_id: WithdrawalId,
    ) -> Result<CreateWithdrawalResponse> {
        let reconciled = tokio::time::timeout(RECONCILE_DEADLINE, self.reconcile(validated)).await;
        match reconciled {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(DomainError::IdempotencyInProgress { .. })) | Err(_) => {
                // Inconclusive: the caller must not assume failure.
                Err(DomainError::OutcomeUnknown { withdrawal_id })
            }
            Ok(Err(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateWithdrawalRequest {
        CreateWithdrawalRequest {
            user_id: " user-1 ".into(),
            asset: " btc ".into(),
            amount_minor: 1000,
            destination_addr: " bc1qexample ".into(),
            idempotency_key: " key-1 ".into(),
            trace_id: None,
        }
    }

    fn record(status: IdempotencyStatus) -> IdempotencyRecord {
        IdempotencyRecord {
            status,
            withdrawal_id: WithdrawalId::new(),
            request_hash: "hash".into(),
            grpc_code: 0,
            lease_owner: "attempt".into(),
            lease_expires_at: Utc::now(),
            lease_fence: 1,
        }
    }

    #[test]
    fn normalization_trims_and_uppercases() {
        let validated = ValidatedCreateWithdrawal::new(request()).unwrap();
        assert_eq!(validated.user_id, "user-1");
        assert_eq!(validated.asset, "BTC");
        assert_eq!(validated.destination_addr, "bc1qexample");
        assert_eq!(validated.idempotency_key, "key-1");
        assert!(!validated.trace_id.as_str().is_empty());
    }

    #[test]
    fn rejects_missing_fields_and_bad_amounts() {
        let mut missing = request();
        missing.user_id = "   ".into();
        assert!(matches!(
            ValidatedCreateWithdrawal::new(missing),
            Err(DomainError::InvalidInput { .. })
        ));

        let mut zero = request();
        zero.amount_minor = 0;
        assert!(ValidatedCreateWithdrawal::new(zero).is_err());

        let mut negative = request();
        negative.amount_minor = -5;
        assert!(ValidatedCreateWithdrawal::new(negative).is_err());
    }

    #[test]
    fn hash_covers_the_canonical_tuple() {
        let a = canonical_request_hash("user-1", "BTC", 1000, "bc1q");
        let b = canonical_request_hash("user-1", "BTC", 1000, "bc1q");
        let c = canonical_request_hash("user-1", "BTC", 1001, "bc1q");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn semantically_equal_requests_hash_equal() {
        let raw = ValidatedCreateWithdrawal::new(request()).unwrap();
        let tidy = ValidatedCreateWithdrawal::new(CreateWithdrawalRequest {
            user_id: "user-1".into(),
            asset: "BTC".into(),
            amount_minor: 1000,
            destination_addr: "bc1qexample".into(),
            idempotency_key: "key-1".into(),
            trace_id: None,
        })
        .unwrap();
        assert_eq!(raw.request_hash, tidy.request_hash);
    }

    #[test]
    fn lease_check_requires_full_fencing_tuple() {
        let attempt = AttemptId::new();
        let mut rec = record(IdempotencyStatus::InProgress);
        rec.lease_owner = attempt.to_string();
        rec.lease_fence = 2;

        assert!(lease_still_held(&rec, &attempt, 2));
        assert!(!lease_still_held(&rec, &attempt, 1));
        assert!(!lease_still_held(&rec, &AttemptId::new(), 2));

        rec.status = IdempotencyStatus::Completed;
        assert!(!lease_still_held(&rec, &attempt, 2));
    }

    #[test]
    fn reconcile_maps_completed_to_existing_withdrawal() {
        let rec = record(IdempotencyStatus::Completed);
        let response = map_reconcile(Some(&rec), true).unwrap();
        assert_eq!(response.withdrawal_id, rec.withdrawal_id);
        assert_eq!(response.status, WithdrawalStatus::Requested);
    }

    #[test]
    fn reconcile_flags_completed_without_withdrawal_as_invariant_violation() {
        let rec = record(IdempotencyStatus::Completed);
        assert!(matches!(
            map_reconcile(Some(&rec), false),
            Err(DomainError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn reconcile_maps_failed_to_previous_attempt_failed() {
        let mut rec = record(IdempotencyStatus::Failed);
        rec.grpc_code = 13;
        assert!(matches!(
            map_reconcile(Some(&rec), false),
            Err(DomainError::PreviousAttemptFailed { grpc_code: 13 })
        ));
    }

    #[test]
    fn reconcile_in_progress_returns_concurrent_progress_when_present() {
        let rec = record(IdempotencyStatus::InProgress);
        let response = map_reconcile(Some(&rec), true).unwrap();
        assert_eq!(response.withdrawal_id, rec.withdrawal_id);

        let pending = map_reconcile(Some(&rec), false).unwrap_err();
        assert!(matches!(
            pending,
            DomainError::IdempotencyInProgress {
                withdrawal_id: Some(id)
            } if id == rec.withdrawal_id
        ));
    }

    #[test]
    fn reconcile_without_row_reports_in_progress() {
        assert!(matches!(
            map_reconcile(None, false),
            Err(DomainError::IdempotencyInProgress {
                withdrawal_id: None
            })
        ));
    }
}
