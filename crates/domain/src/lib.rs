//! Domain model for the cbsaga withdrawal platform.
//!
//! This crate defines the entities, repository ports, typed error kinds and
//! the validating codec. It has no knowledge of Postgres SQL, NATS subjects
//! or gRPC; those live in the infrastructure and interface crates.

pub mod codec;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod outbox;
pub mod verifications;
pub mod withdrawals;

pub use error::{DomainError, Result};
