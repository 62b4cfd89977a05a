//! Validating JSON codec for event payloads.
//!
//! Every payload that crosses the outbox or the bus goes through a
//! structural [`Validate`] pass: on encode before serialization, on decode
//! after deserialization. A payload that fails validation never reaches the
//! database or a downstream consumer.

use crate::error::{DomainError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Structural validity check for event payloads.
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Validate then serialize.
pub fn encode_valid<T: Validate + Serialize>(value: &T) -> Result<serde_json::Value> {
    value.validate()?;
    Ok(serde_json::to_value(value)?)
}

/// Deserialize then validate.
pub fn decode_valid<T: Validate + DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let value: T = serde_json::from_slice(bytes)?;
    value.validate()?;
    Ok(value)
}

/// Deserialize a `serde_json::Value` then validate.
pub fn decode_value_valid<T: Validate + DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    let value: T = serde_json::from_value(value)?;
    value.validate()?;
    Ok(value)
}

/// Wire envelope used on the bus: `{"payload": <validated object>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub payload: serde_json::Value,
}

/// Unwrap the bus envelope and decode its payload with validation.
pub fn decode_envelope_valid<T: Validate + DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: EventEnvelope = serde_json::from_slice(bytes)?;
    decode_value_valid(envelope.payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        amount: i64,
    }

    impl Validate for Probe {
        fn validate(&self) -> Result<()> {
            if self.name.is_empty() {
                return Err(DomainError::validation("name is empty"));
            }
            if self.amount <= 0 {
                return Err(DomainError::validation("amount not greater than zero"));
            }
            Ok(())
        }
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let probe = Probe {
            name: "btc".into(),
            amount: 1000,
        };
        let encoded = encode_valid(&probe).unwrap();
        let decoded: Probe = decode_valid(&serde_json::to_vec(&encoded).unwrap()).unwrap();
        assert_eq!(decoded, probe);
    }

    #[test]
    fn encode_rejects_invalid_payload() {
        let err = encode_valid(&Probe {
            name: "".into(),
            amount: 1,
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation { .. }));
    }

    #[test]
    fn decode_rejects_structurally_invalid_payload() {
        let err = decode_valid::<Probe>(br#"{"name":"btc","amount":-1}"#).unwrap_err();
        assert!(matches!(err, DomainError::Validation { .. }));
    }

    #[test]
    fn decode_rejects_malformed_json() {
        let err = decode_valid::<Probe>(b"{not json").unwrap_err();
        assert!(matches!(err, DomainError::Serialization(_)));
    }

    #[test]
    fn envelope_unwraps_payload() {
        let bytes = br#"{"payload":{"name":"btc","amount":5}}"#;
        let decoded: Probe = decode_envelope_valid(bytes).unwrap();
        assert_eq!(decoded.amount, 5);
    }

    #[test]
    fn envelope_without_payload_is_rejected() {
        assert!(decode_envelope_valid::<Probe>(br#"{"other":1}"#).is_err());
    }
}
