//! PostgreSQL connection pool construction.

use cbsaga_domain::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// Connect a pool and verify the connection with a ping.
///
/// Callers bound the whole call with their startup deadline
/// (`tokio::time::timeout`), so no extra deadline is applied here.
pub async fn connect_pool(dsn: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .max_lifetime(Duration::from_secs(30 * 60))
        .idle_timeout(Duration::from_secs(5 * 60))
        .connect(dsn)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    info!("postgres connected");
    Ok(pool)
}
