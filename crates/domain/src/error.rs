//! Typed error kinds for the withdrawal saga.
//!
//! Errors that imply the database's truth is unknown (`CommitUnknown`,
//! `LostLeaseOwnership`) are distinct variants so callers can route them
//! through reconciliation; local opinions (validation, key reuse) are
//! separate and never trigger a reconcile.

use cbsaga_shared::states::UnknownState;
use cbsaga_shared::WithdrawalId;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, DomainError>;

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("idempotency key reuse with different request")]
    IdempotencyKeyReuse,

    #[error("idempotent request in progress")]
    IdempotencyInProgress {
        withdrawal_id: Option<WithdrawalId>,
    },

    #[error("previous attempt failed (grpc_code={grpc_code})")]
    PreviousAttemptFailed { grpc_code: i32 },

    #[error("withdrawal already exists")]
    WithdrawalAlreadyExists,

    #[error("not the lease owner")]
    LostLeaseOwnership,

    /// Another attempt finalized the idempotency row first; the durable
    /// truth must be read back through reconcile.
    #[error("idempotency row already finalized by another attempt")]
    AlreadyFinalized,

    #[error("could not create withdrawal request")]
    CreateWithdrawalFailed,

    /// The work transaction's commit outcome could not be determined within
    /// the reconcile window. The caller must retry; the request may already
    /// have succeeded.
    #[error("withdrawal outcome unknown; retry with the same idempotency key")]
    OutcomeUnknown { withdrawal_id: WithdrawalId },

    #[error("withdrawal not found: {withdrawal_id}")]
    WithdrawalNotFound { withdrawal_id: WithdrawalId },

    #[error("idempotency key not found")]
    IdempotencyKeyNotFound,

    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    #[error("begin tx failed ({op}): {source}")]
    BeginTx {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("commit outcome unknown ({op}) after {elapsed:?}: {source}")]
    CommitUnknown {
        op: &'static str,
        #[source]
        source: sqlx::Error,
        elapsed: Duration,
    },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("message bus error: {message}")]
    Messaging { message: String },

    #[error(transparent)]
    UnknownState(#[from] UnknownState),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl DomainError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    pub fn messaging(message: impl Into<String>) -> Self {
        Self::Messaging {
            message: message.into(),
        }
    }

    pub fn begin_tx(op: &'static str, source: sqlx::Error) -> Self {
        Self::BeginTx { op, source }
    }

    pub fn commit_unknown(op: &'static str, source: sqlx::Error, elapsed: Duration) -> Self {
        Self::CommitUnknown {
            op,
            source,
            elapsed,
        }
    }

    /// SQLSTATE of the underlying Postgres error, if this error carries one.
    pub fn sqlstate(&self) -> Option<String> {
        let source = match self {
            Self::Database(e) => e,
            Self::BeginTx { source, .. } => source,
            Self::CommitUnknown { source, .. } => source,
            _ => return None,
        };
        source
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_tx_keeps_cause() {
        let err = DomainError::begin_tx("reserve", sqlx::Error::PoolClosed);
        assert!(matches!(err, DomainError::BeginTx { op: "reserve", .. }));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn sqlstate_absent_for_local_errors() {
        assert!(DomainError::IdempotencyKeyReuse.sqlstate().is_none());
        assert!(DomainError::invalid_input("nope").sqlstate().is_none());
    }
}
