//! End-to-end admission-flow tests against a real PostgreSQL.
//!
//! Covers the concrete scenarios of the admission contract: happy path,
//! idempotent replay, key reuse with a different payload, lease steal with
//! stale-fence rejection, and concurrent unique admission.

use cbsaga_application::{CreateWithdrawalRequest, CreateWithdrawalUseCase};
use cbsaga_domain::idempotency::{
    FinalizeIdempotencyParams, IdempotencyRepositoryTx, ReserveIdempotencyParams,
};
use cbsaga_domain::DomainError;
use cbsaga_infrastructure::persistence::postgres::{
    PostgresIdempotencyRepository, PostgresWithdrawalRepository,
};
use cbsaga_shared::event_topics::{identity, withdrawal};
use cbsaga_shared::states::{IdempotencyStatus, WithdrawalStatus};
use cbsaga_shared::{AttemptId, WithdrawalId};
use chrono::{Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct PostgresTestContext {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

static POSTGRES_CONTEXT: OnceCell<PostgresTestContext> = OnceCell::const_new();

async fn get_pool() -> &'static PgPool {
    let ctx = POSTGRES_CONTEXT
        .get_or_init(|| async {
            let container = Postgres::default()
                .with_tag("16-alpine")
                .start()
                .await
                .expect("start postgres container");

            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");

            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&format!(
                    "postgres://postgres:postgres@{host}:{port}/postgres"
                ))
                .await
                .expect("connect test pool");

            PostgresIdempotencyRepository::new(pool.clone())
                .run_migrations()
                .await
                .expect("idempotency migrations");
            PostgresWithdrawalRepository::new(pool.clone())
                .run_migrations()
                .await
                .expect("withdrawal migrations");

            PostgresTestContext {
                _container: container,
                pool,
            }
        })
        .await;
    &ctx.pool
}

fn use_case(pool: &PgPool) -> CreateWithdrawalUseCase {
    CreateWithdrawalUseCase::new(
        pool.clone(),
        Arc::new(PostgresIdempotencyRepository::new(pool.clone())),
        Arc::new(PostgresWithdrawalRepository::new(pool.clone())),
    )
}

fn request(user: &str, key: &str) -> CreateWithdrawalRequest {
    CreateWithdrawalRequest {
        user_id: user.to_string(),
        asset: " btc ".to_string(),
        amount_minor: 1000,
        destination_addr: "bc1qexample".to_string(),
        idempotency_key: key.to_string(),
        trace_id: None,
    }
}

fn request_hash(user: &str) -> String {
    let canonical =
        format!("user_id={user}|asset=BTC|amount_minor=1000|destination_addr=bc1qexample");
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

async fn withdrawal_count(pool: &PgPool, user: &str) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM orchestrator.withdrawals WHERE user_id = $1")
        .bind(user)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn happy_path_commits_all_rows() {
    let pool = get_pool().await;
    let uc = use_case(pool);
    let user = format!("user-{}", Uuid::new_v4());

    let response = uc.execute(request(&user, "key-1")).await.unwrap();
    assert_eq!(response.status, WithdrawalStatus::Requested);

    // Withdrawal row, normalized asset.
    let (asset, status) = sqlx::query_as::<_, (String, String)>(
        "SELECT asset, status FROM orchestrator.withdrawals WHERE id = $1",
    )
    .bind(response.withdrawal_id.as_uuid())
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(asset, "BTC");
    assert_eq!(status, "REQUESTED");

    // Saga row.
    let (state, step) = sqlx::query_as::<_, (String, String)>(
        "SELECT state, current_step FROM orchestrator.saga_instances WHERE withdrawal_id = $1",
    )
    .bind(response.withdrawal_id.as_uuid())
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(state, "STARTED");
    assert_eq!(step, "IDENTITY_CHECK");

    // Two outbox rows with the admission event pair.
    let events = sqlx::query_as::<_, (String, String)>(
        "SELECT event_type, route_key FROM orchestrator.outbox_events \
         WHERE aggregate_id = $1 ORDER BY created_at, event_type",
    )
    .bind(response.withdrawal_id.as_uuid())
    .fetch_all(pool)
    .await
    .unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.contains(&(
        withdrawal::EVENT_REQUESTED.to_string(),
        withdrawal::ROUTE_KEY_EVT.to_string()
    )));
    assert!(events.contains(&(
        identity::EVENT_VERIFY_REQUESTED.to_string(),
        identity::ROUTE_KEY_CMD.to_string()
    )));

    // Idempotency row finalized with the original fence.
    let repo = PostgresIdempotencyRepository::new(pool.clone());
    let mut tx = pool.begin().await.unwrap();
    let record = repo
        .get_with_tx(&mut tx, &user, "key-1")
        .await
        .unwrap()
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
    assert_eq!(record.lease_fence, 1);
    assert_eq!(record.withdrawal_id, response.withdrawal_id);
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn replay_returns_same_withdrawal_without_new_rows() {
    let pool = get_pool().await;
    let uc = use_case(pool);
    let user = format!("user-{}", Uuid::new_v4());

    let first = uc.execute(request(&user, "key-1")).await.unwrap();
    let replay = uc.execute(request(&user, "key-1")).await.unwrap();

    assert_eq!(first.withdrawal_id, replay.withdrawal_id);
    assert_eq!(replay.status, WithdrawalStatus::Requested);
    assert_eq!(withdrawal_count(pool, &user).await, 1);
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn key_reuse_with_different_payload_is_rejected() {
    let pool = get_pool().await;
    let uc = use_case(pool);
    let user = format!("user-{}", Uuid::new_v4());

    uc.execute(request(&user, "key-1")).await.unwrap();

    let mut different = request(&user, "key-1");
    different.amount_minor = 2000;
    let err = uc.execute(different).await.unwrap_err();
    assert!(matches!(err, DomainError::IdempotencyKeyReuse));
    assert_eq!(withdrawal_count(pool, &user).await, 1);
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn crashed_admitter_lease_is_stolen_and_stale_finalize_loses() {
    let pool = get_pool().await;
    let uc = use_case(pool);
    let repo = PostgresIdempotencyRepository::new(pool.clone());
    let user = format!("user-{}", Uuid::new_v4());

    // Admitter A reserved 60s ago and died before its work transaction.
    let a_candidate = WithdrawalId::new();
    let a_attempt = AttemptId::new();
    let mut tx = pool.begin().await.unwrap();
    repo.reserve_with_tx(
        &mut tx,
        ReserveIdempotencyParams {
            user_id: user.clone(),
            idempotency_key: "key-1".into(),
            request_hash: request_hash(&user),
            withdrawal_id: a_candidate,
            lease_attempt_id: a_attempt.clone(),
            lease_ttl: Duration::from_secs(30),
            now: Utc::now() - ChronoDuration::seconds(60),
        },
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    // Admitter B submits the same request, steals the lease and completes,
    // bound to A's candidate withdrawal id.
    let response = uc.execute(request(&user, "key-1")).await.unwrap();
    assert_eq!(response.withdrawal_id, a_candidate);
    assert_eq!(withdrawal_count(pool, &user).await, 1);

    // A resurrects and finalizes with its stale fence.
    let mut tx = pool.begin().await.unwrap();
    let record = repo
        .get_with_tx(&mut tx, &user, "key-1")
        .await
        .unwrap()
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
    assert_eq!(record.lease_fence, 2);

    // The terminal row classifies the stale write as already finalized and
    // never changes status; on a still-live row the same write would get
    // LostLeaseOwnership (covered by the repository tests).
    let mut tx = pool.begin().await.unwrap();
    let outcome = repo
        .complete_with_tx(
            &mut tx,
            FinalizeIdempotencyParams {
                user_id: user.clone(),
                idempotency_key: "key-1".into(),
                grpc_code: 0,
                now: Utc::now(),
                lease_attempt_id: a_attempt,
                lease_fence: 1,
            },
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        outcome,
        cbsaga_domain::idempotency::FinalizeOutcome::AlreadyFinalized
    );
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn concurrent_admissions_create_exactly_one_withdrawal() {
    let pool = get_pool().await;
    let uc = Arc::new(use_case(pool));
    let user = format!("user-{}", Uuid::new_v4());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let uc = uc.clone();
        let req = request(&user, "key-1");
        handles.push(tokio::spawn(async move { uc.execute(req).await }));
    }

    let mut winner = None;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(response) => {
                if let Some(previous) = winner {
                    assert_eq!(previous, response.withdrawal_id);
                }
                winner = Some(response.withdrawal_id);
            }
            Err(DomainError::IdempotencyInProgress { .. }) => {}
            Err(other) => panic!("unexpected admission error: {other}"),
        }
    }

    assert!(winner.is_some(), "no admission succeeded");
    assert_eq!(withdrawal_count(pool, &user).await, 1);
}
