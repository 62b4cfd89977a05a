//! Event payloads exchanged between the orchestrator and its workers.
//!
//! All payloads implement [`Validate`] and travel inside the bus envelope
//! (`codec::EventEnvelope`) with `trace_id` and `event_type` headers.

use crate::codec::Validate;
use crate::error::{DomainError, Result};
use cbsaga_shared::states::{IdentityDecision, RiskDecision};
use cbsaga_shared::WithdrawalId;
use serde::{Deserialize, Serialize};

/// Published on `evt.withdrawal` when a withdrawal is admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRequestedPayload {
    pub withdrawal_id: WithdrawalId,
    pub user_id: String,
}

impl Validate for WithdrawalRequestedPayload {
    fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(DomainError::validation("user_id is empty"));
        }
        Ok(())
    }
}

/// Published on `cmd.identity` to request identity verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyIdentityRequestedPayload {
    pub withdrawal_id: WithdrawalId,
    pub user_id: String,
}

impl Validate for VerifyIdentityRequestedPayload {
    fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(DomainError::validation("user_id is empty"));
        }
        Ok(())
    }
}

/// Consumed from `evt.identity`: the identity service's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityDecisionPayload {
    pub withdrawal_id: WithdrawalId,
    pub user_id: String,
    pub status: IdentityDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Validate for IdentityDecisionPayload {
    fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(DomainError::validation("user_id is empty"));
        }
        Ok(())
    }
}

/// Published on `cmd.risk` after a successful identity check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCheckRequestedPayload {
    pub withdrawal_id: WithdrawalId,
    pub user_id: String,
    pub asset: String,
    pub amount_minor: i64,
    pub destination_addr: String,
}

impl Validate for RiskCheckRequestedPayload {
    fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(DomainError::validation("user_id is empty"));
        }
        if self.asset.is_empty() {
            return Err(DomainError::validation("asset is empty"));
        }
        if self.amount_minor <= 0 {
            return Err(DomainError::validation(
                "amount_minor not greater than zero",
            ));
        }
        if self.destination_addr.is_empty() {
            return Err(DomainError::validation("destination_addr is empty"));
        }
        Ok(())
    }
}

/// Consumed from `evt.risk`: the risk service's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDecisionPayload {
    pub withdrawal_id: WithdrawalId,
    pub user_id: String,
    pub status: RiskDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Validate for RiskDecisionPayload {
    fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(DomainError::validation("user_id is empty"));
        }
        Ok(())
    }
}

/// Published on `evt.withdrawal` when the saga terminates in failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalFailedPayload {
    pub withdrawal_id: WithdrawalId,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Validate for WithdrawalFailedPayload {
    fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(DomainError::validation("user_id is empty"));
        }
        Ok(())
    }
}

/// Published on `evt.withdrawal` when the saga completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalCompletedPayload {
    pub withdrawal_id: WithdrawalId,
    pub user_id: String,
}

impl Validate for WithdrawalCompletedPayload {
    fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(DomainError::validation("user_id is empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_envelope_valid, encode_valid};

    #[test]
    fn identity_decision_round_trips_through_envelope() {
        let payload = IdentityDecisionPayload {
            withdrawal_id: WithdrawalId::new(),
            user_id: "user-1".into(),
            status: IdentityDecision::Rejected,
            reason: Some("sanctions hit".into()),
        };
        let encoded = encode_valid(&payload).unwrap();
        let envelope = serde_json::json!({ "payload": encoded });
        let decoded: IdentityDecisionPayload =
            decode_envelope_valid(&serde_json::to_vec(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn decision_status_uses_wire_names() {
        let payload = IdentityDecisionPayload {
            withdrawal_id: WithdrawalId::new(),
            user_id: "user-1".into(),
            status: IdentityDecision::Verified,
            reason: None,
        };
        let encoded = encode_valid(&payload).unwrap();
        assert_eq!(encoded["status"], "VERIFIED");
        assert!(encoded.get("reason").is_none());
    }

    #[test]
    fn risk_request_requires_positive_amount() {
        let payload = RiskCheckRequestedPayload {
            withdrawal_id: WithdrawalId::new(),
            user_id: "user-1".into(),
            asset: "BTC".into(),
            amount_minor: 0,
            destination_addr: "bc1q".into(),
        };
        assert!(encode_valid(&payload).is_err());
    }

    #[test]
    fn empty_user_is_structurally_invalid() {
        let payload = WithdrawalRequestedPayload {
            withdrawal_id: WithdrawalId::new(),
            user_id: "".into(),
        };
        assert!(encode_valid(&payload).is_err());
    }
}
