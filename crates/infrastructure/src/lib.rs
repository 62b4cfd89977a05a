//! Infrastructure adapters for the cbsaga withdrawal platform.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │      Application Layer (use cases, consumers' glue)  │
//! └──────────────────────┬──────────────────────────────┘
//!                        │ implements ports from cbsaga-domain
//! ┌──────────────────────▼──────────────────────────────┐
//! │  persistence/postgres: sqlx repositories, tx helper  │
//! │  messaging: JetStream consumers                      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod messaging;
pub mod persistence;
