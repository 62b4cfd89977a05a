pub mod errors;
pub mod idempotency_repository;
pub mod pool;
pub mod tx;
pub mod verification_repository;
pub mod withdrawal_repository;

pub use errors::{is_retryable_begin_cause, is_retryable_postgres, is_unique_violation};
pub use idempotency_repository::PostgresIdempotencyRepository;
pub use pool::connect_pool;
pub use tx::{with_read_tx, with_tx};
pub use verification_repository::PostgresVerificationRepository;
pub use withdrawal_repository::PostgresWithdrawalRepository;
