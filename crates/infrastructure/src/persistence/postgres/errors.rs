//! Postgres error classification.
//!
//! The retry driver is generic; these classifiers decide which faults are
//! transient. SQLSTATE groups: serialization/deadlock/lock contention and
//! server shutdown states are worth another attempt, connection
//! establishment faults only matter when a BEGIN failed.

use cbsaga_domain::DomainError;

const RETRYABLE_STATEMENT_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
];

const RETRYABLE_BEGIN_SQLSTATES: &[&str] = &[
    "57P03", // cannot_connect_now
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "08006", // connection_failure
    "08001", // sqlclient_unable_to_establish_sqlconnection
];

/// Transient statement-level faults.
pub fn is_retryable_postgres(err: &DomainError) -> bool {
    match err.sqlstate() {
        Some(code) => RETRYABLE_STATEMENT_SQLSTATES.contains(&code.as_str()),
        None => matches!(err, DomainError::Database(source) if is_connection_fault(source)),
    }
}

/// Faults that make retrying a failed BEGIN worthwhile.
pub fn is_retryable_begin_cause(err: &sqlx::Error) -> bool {
    if is_connection_fault(err) {
        return true;
    }
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| RETRYABLE_BEGIN_SQLSTATES.contains(&code.as_ref()))
        .unwrap_or(false)
}

/// Unique-constraint violation (SQLSTATE 23505).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

fn is_connection_fault(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_error() -> sqlx::Error {
        sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))
    }

    #[test]
    fn connection_faults_are_retryable_begin_causes() {
        assert!(is_retryable_begin_cause(&io_error()));
        assert!(is_retryable_begin_cause(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn row_not_found_is_not_retryable() {
        assert!(!is_retryable_begin_cause(&sqlx::Error::RowNotFound));
        assert!(!is_retryable_postgres(&DomainError::Database(
            sqlx::Error::RowNotFound
        )));
    }

    #[test]
    fn local_errors_are_never_retryable() {
        assert!(!is_retryable_postgres(&DomainError::IdempotencyKeyReuse));
        assert!(!is_retryable_postgres(&DomainError::LostLeaseOwnership));
    }

    #[test]
    fn io_faults_inside_statements_are_retryable() {
        assert!(is_retryable_postgres(&DomainError::Database(io_error())));
    }

    #[test]
    fn unique_violation_needs_a_database_error() {
        assert!(!is_unique_violation(&io_error()));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
