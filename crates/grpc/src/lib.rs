//! gRPC adapter for the cbsaga orchestrator.
//!
//! Thin layer between tonic transport and the application services:
//!
//! ```text
//! gRPC request → [grpc adapter] → use case → repositories → response
//! ```

pub mod services;

pub use services::OrchestratorGrpc;
