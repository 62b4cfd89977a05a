//! Identity verification worker service.
//!
//! Consumes `VerifyIdentityRequested` commands and emits identity decisions
//! through the identity outbox. No RPC surface; the bus is the only input.

use cbsaga_infrastructure::messaging::{connect_bus, IdentityWorker, IdentityWorkerConfig};
use cbsaga_infrastructure::persistence::postgres::{
    connect_pool, PostgresVerificationRepository,
};
use cbsaga_server::{init_tracing, shutdown_signal, STARTUP_DEADLINE};
use cbsaga_shared::IdentityConfig;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let cfg = IdentityConfig::from_env()?;
    info!(
        env = %cfg.env,
        topic = %cfg.identity_cmd_topic,
        group = %cfg.group_id,
        "identity worker starting"
    );

    let pool = tokio::time::timeout(STARTUP_DEADLINE, connect_pool(&cfg.postgres_dsn))
        .await
        .map_err(|_| anyhow::anyhow!("postgres connect timed out"))??;

    let verification_repo = PostgresVerificationRepository::new(pool.clone());
    verification_repo.run_migrations().await?;
    let verification_repo = Arc::new(verification_repo);

    let bus = connect_bus(&cfg.nats_urls).await?;
    let jetstream = async_nats::jetstream::new(bus);

    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    let worker = IdentityWorker::new(
        jetstream,
        pool,
        verification_repo,
        IdentityWorkerConfig {
            topic: cfg.identity_cmd_topic.clone(),
            durable_name: cfg.group_id.clone(),
            ..Default::default()
        },
    );

    let handle = {
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = worker.start(rx).await {
                error!(error = %e, "identity worker crashed");
            }
        })
    };

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    if tokio::time::timeout(cfg.shutdown_timeout, handle)
        .await
        .is_err()
    {
        error!("identity worker did not stop within the shutdown timeout");
    }

    info!("identity worker stopped");
    Ok(())
}
