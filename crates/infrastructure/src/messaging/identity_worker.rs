//! Identity verification worker.
//!
//! Consumes `VerifyIdentityRequested` commands, records a verification and
//! emits the decision event through the identity outbox, one transaction
//! per message. The decision itself is a seam: the default checker verifies
//! everything, a real provider integration replaces [`decide`].

use async_nats::jetstream::consumer::pull::Config as PullConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy};
use async_nats::jetstream::Context as JetStreamContext;
use cbsaga_domain::codec::{decode_envelope_valid, encode_valid};
use cbsaga_domain::events::{IdentityDecisionPayload, VerifyIdentityRequestedPayload};
use cbsaga_domain::verifications::{
    VerificationApplication, VerificationRepositoryTx, VerifyAndEmitParams,
};
use cbsaga_domain::{DomainError, Result};
use cbsaga_shared::event_topics::{identity as identity_topics, HEADER_EVENT_TYPE, HEADER_TRACE_ID};
use cbsaga_shared::states::IdentityDecision;
use cbsaga_shared::{TraceId, VerificationId};
use futures::StreamExt;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::nats::{ensure_stream, header_str};
use crate::persistence::postgres::with_tx;

#[derive(Debug, Clone)]
pub struct IdentityWorkerConfig {
    pub topic: String,
    pub durable_name: String,
    pub ack_wait: Duration,
    pub max_deliver: i64,
}

impl Default for IdentityWorkerConfig {
    fn default() -> Self {
        Self {
            topic: identity_topics::ROUTE_KEY_CMD.to_string(),
            durable_name: "cbsaga-identity".to_string(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Applied,
    AlreadyVerified,
    Dropped,
}

pub struct IdentityWorker {
    jetstream: JetStreamContext,
    pool: PgPool,
    repo: Arc<dyn VerificationRepositoryTx>,
    config: IdentityWorkerConfig,
}

impl IdentityWorker {
    pub fn new(
        jetstream: JetStreamContext,
        pool: PgPool,
        repo: Arc<dyn VerificationRepositoryTx>,
        config: IdentityWorkerConfig,
    ) -> Self {
        Self {
            jetstream,
            pool,
            repo,
            config,
        }
    }

    pub async fn start(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let stream = ensure_stream(&self.jetstream, &self.config.topic).await?;

        let consumer = stream
            .create_consumer(PullConsumerConfig {
                durable_name: Some(self.config.durable_name.clone()),
                deliver_policy: DeliverPolicy::New,
                ack_policy: AckPolicy::Explicit,
                ack_wait: self.config.ack_wait,
                max_deliver: self.config.max_deliver,
                ..Default::default()
            })
            .await
            .map_err(|e| DomainError::messaging(format!("create consumer failed: {e}")))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| DomainError::messaging(format!("consumer stream failed: {e}")))?;

        info!(
            topic = %self.config.topic,
            durable = %self.config.durable_name,
            "identity worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("identity worker stopping");
                    return Ok(());
                }
                next = messages.next() => {
                    let Some(message) = next else {
                        warn!("identity worker stream ended");
                        return Ok(());
                    };
                    let message = match message {
                        Ok(message) => message,
                        Err(e) => {
                            error!(error = %e, "identity worker message receive error");
                            continue;
                        }
                    };

                    match self.process(message.headers.as_ref(), &message.payload).await {
                        Ok(disposition) => {
                            debug!(?disposition, "verification command handled");
                            if let Err(e) = message.ack().await {
                                error!(error = %e, "identity worker ack failed");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "verification processing failed");
                        }
                    }
                }
            }
        }
    }

    async fn process(
        &self,
        headers: Option<&async_nats::HeaderMap>,
        payload: &[u8],
    ) -> Result<Disposition> {
        let event_type = header_str(headers, HEADER_EVENT_TYPE).unwrap_or_default();
        if event_type != identity_topics::EVENT_VERIFY_REQUESTED {
            debug!(event_type, "ignoring event type");
            return Ok(Disposition::Dropped);
        }

        let trace_id = match header_str(headers, HEADER_TRACE_ID) {
            Some(value) => TraceId::from_string(value),
            None => {
                warn!("verification command without trace_id header");
                TraceId::new()
            }
        };

        let request: VerifyIdentityRequestedPayload = match decode_envelope_valid(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping structurally invalid verification command");
                return Ok(Disposition::Dropped);
            }
        };

        let (status, reason) = decide(&request);
        let outbox_event_type = match status {
            IdentityDecision::Verified => identity_topics::EVENT_VERIFIED,
            IdentityDecision::Rejected => identity_topics::EVENT_REJECTED,
        };

        let outgoing = encode_valid(&IdentityDecisionPayload {
            withdrawal_id: request.withdrawal_id,
            user_id: request.user_id.clone(),
            status,
            reason: reason.clone(),
        })?;

        let withdrawal_id = request.withdrawal_id;
        let repo = self.repo.clone();
        let applied = with_tx(&self.pool, "identity.verify-and-emit", move |tx| {
            Box::pin(async move {
                repo.verify_and_emit_with_tx(
                    tx,
                    VerifyAndEmitParams {
                        verification_id: VerificationId::new(),
                        withdrawal_id: request.withdrawal_id,
                        user_id: request.user_id,
                        status,
                        reason,
                        outbox_event_type: outbox_event_type.to_string(),
                        outbox_payload: outgoing,
                        trace_id,
                        route_key: identity_topics::ROUTE_KEY_EVT.to_string(),
                    },
                )
                .await
            })
        })
        .await?;

        info!(
            withdrawal_id = %withdrawal_id,
            decision = %status,
            "identity decision emitted"
        );

        Ok(match applied {
            VerificationApplication::Applied => Disposition::Applied,
            VerificationApplication::AlreadyVerified => Disposition::AlreadyVerified,
        })
    }
}

/// Verification decision seam. The default checker verifies every request.
fn decide(_request: &VerifyIdentityRequestedPayload) -> (IdentityDecision, Option<String>) {
    (IdentityDecision::Verified, None)
}
