//! Retry classification for idempotency finalization.

use cbsaga_domain::DomainError;
use cbsaga_infrastructure::persistence::postgres::{
    is_retryable_begin_cause, is_retryable_postgres,
};

/// Classifier for the fail-idempotency retry loop.
///
/// Lost lease means another attempt owns finalization now; retrying would
/// just loop until the attempts run out. A commit with unknown outcome must
/// be resolved by reconcile, never by blind retry.
pub fn is_retryable_finalize(err: &DomainError) -> bool {
    match err {
        DomainError::LostLeaseOwnership => false,
        DomainError::AlreadyFinalized => false,
        DomainError::CommitUnknown { .. } => false,
        DomainError::BeginTx { source, .. } => is_retryable_begin_cause(source),
        other => is_retryable_postgres(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn io_error() -> sqlx::Error {
        sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))
    }

    #[test]
    fn lost_lease_is_terminal() {
        assert!(!is_retryable_finalize(&DomainError::LostLeaseOwnership));
    }

    #[test]
    fn commit_unknown_is_terminal() {
        let err = DomainError::commit_unknown("fail-idem", io_error(), Duration::from_millis(3));
        assert!(!is_retryable_finalize(&err));
    }

    #[test]
    fn begin_failure_retries_only_on_connection_causes() {
        assert!(is_retryable_finalize(&DomainError::begin_tx(
            "fail-idem",
            io_error()
        )));
        assert!(!is_retryable_finalize(&DomainError::begin_tx(
            "fail-idem",
            sqlx::Error::RowNotFound
        )));
    }

    #[test]
    fn transient_statement_faults_are_retryable() {
        assert!(is_retryable_finalize(&DomainError::Database(io_error())));
        assert!(!is_retryable_finalize(&DomainError::IdempotencyKeyReuse));
    }
}
