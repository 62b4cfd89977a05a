//! Withdrawal orchestrator service.
//!
//! Hosts the gRPC front door (with health and reflection), the identity- and
//! risk-decision consumers, and the shared Postgres pool. Everything stops on
//! SIGINT/SIGTERM within the configured shutdown timeout.

use cbsaga_application::{CreateWithdrawalUseCase, GetWithdrawalUseCase};
use cbsaga_grpc::OrchestratorGrpc;
use cbsaga_infrastructure::messaging::{
    connect_bus, IdentityResultConsumer, IdentityResultConsumerConfig, RiskResultConsumer,
    RiskResultConsumerConfig,
};
use cbsaga_infrastructure::persistence::postgres::{
    connect_pool, PostgresIdempotencyRepository, PostgresWithdrawalRepository,
};
use cbsaga_proto::orchestrator::v1::orchestrator_service_server::OrchestratorServiceServer;
use cbsaga_proto::orchestrator::v1::FILE_DESCRIPTOR_SET;
use cbsaga_server::{init_tracing, shutdown_signal, STARTUP_DEADLINE};
use cbsaga_shared::OrchestratorConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tonic::transport::Server;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let cfg = OrchestratorConfig::from_env()?;
    info!(env = %cfg.env, grpc = %cfg.grpc_addr, "orchestrator starting");

    let pool = tokio::time::timeout(STARTUP_DEADLINE, connect_pool(&cfg.postgres_dsn))
        .await
        .map_err(|_| anyhow::anyhow!("postgres connect timed out"))??;

    let idempotency_repo = PostgresIdempotencyRepository::new(pool.clone());
    idempotency_repo.run_migrations().await?;
    let withdrawal_repo = PostgresWithdrawalRepository::new(pool.clone());
    withdrawal_repo.run_migrations().await?;

    let idempotency_repo = Arc::new(idempotency_repo);
    let withdrawal_repo = Arc::new(withdrawal_repo);

    let bus = connect_bus(&cfg.nats_urls).await?;
    let jetstream = async_nats::jetstream::new(bus);

    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    let identity_consumer = IdentityResultConsumer::new(
        jetstream.clone(),
        pool.clone(),
        withdrawal_repo.clone(),
        IdentityResultConsumerConfig {
            topic: cfg.identity_topic.clone(),
            durable_name: format!("{}-identity", cfg.group_id),
            ..Default::default()
        },
    );
    let risk_consumer = RiskResultConsumer::new(
        jetstream.clone(),
        pool.clone(),
        withdrawal_repo.clone(),
        RiskResultConsumerConfig {
            topic: cfg.risk_topic.clone(),
            durable_name: format!("{}-risk", cfg.group_id),
            ..Default::default()
        },
    );

    let mut consumer_handles = Vec::new();
    {
        let rx = shutdown_tx.subscribe();
        consumer_handles.push(tokio::spawn(async move {
            if let Err(e) = identity_consumer.start(rx).await {
                error!(error = %e, "identity result consumer crashed");
            }
        }));
    }
    {
        let rx = shutdown_tx.subscribe();
        consumer_handles.push(tokio::spawn(async move {
            if let Err(e) = risk_consumer.start(rx).await {
                error!(error = %e, "risk result consumer crashed");
            }
        }));
    }

    let create_withdrawal = Arc::new(CreateWithdrawalUseCase::new(
        pool.clone(),
        idempotency_repo.clone(),
        withdrawal_repo.clone(),
    ));
    let get_withdrawal = Arc::new(GetWithdrawalUseCase::new(withdrawal_repo.clone()));
    let service = OrchestratorGrpc::new(create_withdrawal, get_withdrawal);

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<OrchestratorServiceServer<OrchestratorGrpc>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let addr: SocketAddr = cfg.grpc_addr.parse()?;
    info!(addr = %addr, "gRPC server listening");

    let server_shutdown = shutdown_tx.clone();
    Server::builder()
        .add_service(health_service)
        .add_service(reflection_service)
        .add_service(OrchestratorServiceServer::new(service))
        .serve_with_shutdown(addr, async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = server_shutdown.send(());
        })
        .await?;

    // The gRPC server has drained; give the consumers the rest of the
    // shutdown budget.
    let drained = tokio::time::timeout(
        cfg.shutdown_timeout,
        futures::future::join_all(consumer_handles),
    )
    .await;
    if drained.is_err() {
        error!("consumers did not stop within the shutdown timeout");
    }

    info!("orchestrator stopped");
    Ok(())
}
