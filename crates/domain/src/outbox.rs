//! Transactional outbox model.
//!
//! Outbox rows are only ever inserted inside the same transaction that
//! produced the business state they describe; a separate relay publishes
//! them to the bus and stamps `published_at`.

use serde_json::Value;

/// An outbox event ready to be inserted alongside business rows.
///
/// The owning repository binds the aggregate columns and the trace id; this
/// struct carries what varies per event.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEventInsert {
    pub event_type: String,
    pub payload: Value,
    pub route_key: String,
}

impl OutboxEventInsert {
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        route_key: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            route_key: route_key.into(),
        }
    }
}
