//! NATS JetStream plumbing shared by all consumers.
//!
//! Each route key gets its own stream whose single subject is
//! `cbsaga.<route_key>`; durable pull consumers give every consumer group
//! at-least-once delivery with explicit acks.

use async_nats::jetstream::stream::{Config as StreamConfig, Stream};
use async_nats::jetstream::Context as JetStreamContext;
use async_nats::HeaderMap;
use cbsaga_domain::{DomainError, Result};
use cbsaga_shared::event_topics::subject_for_route_key;
use tracing::info;

/// Connect to the bus. `urls` may hold several servers of one cluster.
pub async fn connect_bus(urls: &[String]) -> Result<async_nats::Client> {
    let joined = urls.join(",");
    let client = async_nats::connect(joined.as_str())
        .await
        .map_err(|e| DomainError::messaging(format!("nats connect failed: {e}")))?;
    info!(servers = %joined, "nats connected");
    Ok(client)
}

/// Stream name for a route key: `cmd.identity` → `CBSAGA_CMD_IDENTITY`.
pub fn stream_name_for_route_key(route_key: &str) -> String {
    format!("CBSAGA_{}", route_key.to_uppercase().replace('.', "_"))
}

/// Get or create the stream backing a route key.
pub async fn ensure_stream(jetstream: &JetStreamContext, route_key: &str) -> Result<Stream> {
    let name = stream_name_for_route_key(route_key);
    let subject = subject_for_route_key(route_key);

    match jetstream.get_stream(&name).await {
        Ok(stream) => Ok(stream),
        Err(_) => {
            let stream = jetstream
                .create_stream(StreamConfig {
                    name: name.clone(),
                    subjects: vec![subject.into()],
                    max_messages: 100_000,
                    max_bytes: 100 * 1024 * 1024,
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    DomainError::messaging(format!("create stream {name} failed: {e}"))
                })?;
            info!(stream = %name, "created jetstream stream");
            Ok(stream)
        }
    }
}

/// Read a string header from a bus message.
pub fn header_str<'a>(headers: Option<&'a HeaderMap>, key: &str) -> Option<&'a str> {
    headers
        .and_then(|h| h.get(key))
        .map(|value| value.as_str())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names_are_uppercased() {
        assert_eq!(stream_name_for_route_key("cmd.identity"), "CBSAGA_CMD_IDENTITY");
        assert_eq!(stream_name_for_route_key("evt.withdrawal"), "CBSAGA_EVT_WITHDRAWAL");
    }

    #[test]
    fn header_lookup_ignores_empty_values() {
        let mut headers = HeaderMap::new();
        headers.insert("trace_id", "abc");
        headers.insert("empty", "");
        assert_eq!(header_str(Some(&headers), "trace_id"), Some("abc"));
        assert_eq!(header_str(Some(&headers), "empty"), None);
        assert_eq!(header_str(Some(&headers), "missing"), None);
        assert_eq!(header_str(None, "trace_id"), None);
    }
}
