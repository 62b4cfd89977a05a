//! Transactional helper.
//!
//! Runs a closure inside one database transaction and maps the two failure
//! points that need distinct handling into typed error kinds:
//!
//! - begin failure → [`DomainError::BeginTx`] (retryable when its cause is a
//!   connection fault),
//! - commit failure → [`DomainError::CommitUnknown`] (the database's truth
//!   is unknown; callers must reconcile, never blindly retry).
//!
//! A closure error rolls the transaction back on drop and is returned
//! verbatim.

use cbsaga_domain::{DomainError, Result};
use futures::future::BoxFuture;
use sqlx::{PgPool, PgTransaction};
use std::time::Instant;

/// Run `f` inside a transaction on `pool`; `op` names the operation for
/// error context.
pub async fn with_tx<T, F>(pool: &PgPool, op: &'static str, f: F) -> Result<T>
where
    T: Send,
    F: for<'t> FnOnce(&'t mut PgTransaction<'static>) -> BoxFuture<'t, Result<T>> + Send,
{
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DomainError::begin_tx(op, e))?;

    let started = Instant::now();
    let out = f(&mut tx).await?;

    tx.commit()
        .await
        .map_err(|e| DomainError::commit_unknown(op, e, started.elapsed()))?;

    Ok(out)
}

/// Like [`with_tx`] but the transaction is read-only; used for projections
/// and reconcile passes.
pub async fn with_read_tx<T, F>(pool: &PgPool, op: &'static str, f: F) -> Result<T>
where
    T: Send,
    F: for<'t> FnOnce(&'t mut PgTransaction<'static>) -> BoxFuture<'t, Result<T>> + Send,
{
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DomainError::begin_tx(op, e))?;

    sqlx::query("SET TRANSACTION READ ONLY")
        .execute(&mut *tx)
        .await?;

    let started = Instant::now();
    let out = f(&mut tx).await?;

    tx.commit()
        .await
        .map_err(|e| DomainError::commit_unknown(op, e, started.elapsed()))?;

    Ok(out)
}
