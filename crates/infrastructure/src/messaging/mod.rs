pub mod identity_result_consumer;
pub mod identity_worker;
pub mod nats;
pub mod risk_result_consumer;

pub use identity_result_consumer::{IdentityResultConsumer, IdentityResultConsumerConfig};
pub use identity_worker::{IdentityWorker, IdentityWorkerConfig};
pub use nats::{connect_bus, ensure_stream, header_str, stream_name_for_route_key};
pub use risk_result_consumer::{RiskResultConsumer, RiskResultConsumerConfig};
