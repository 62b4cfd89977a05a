//! Risk-decision consumer.
//!
//! Same pump as the identity-result consumer with the RISK_CHECK
//! transitions: an approval completes the withdrawal, a rejection fails it.
//! Either way the terminal withdrawal event lands in the outbox in the same
//! transaction.

use async_nats::jetstream::consumer::pull::Config as PullConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy};
use async_nats::jetstream::Context as JetStreamContext;
use cbsaga_domain::codec::{decode_envelope_valid, encode_valid};
use cbsaga_domain::events::{
    RiskDecisionPayload, WithdrawalCompletedPayload, WithdrawalFailedPayload,
};
use cbsaga_domain::withdrawals::{ApplyRiskResultParams, StepApplication, WithdrawalRepositoryTx};
use cbsaga_domain::{DomainError, Result};
use cbsaga_shared::event_topics::{
    risk as risk_topics, withdrawal as withdrawal_topics, HEADER_EVENT_TYPE, HEADER_TRACE_ID,
};
use cbsaga_shared::states::RiskDecision;
use cbsaga_shared::TraceId;
use chrono::Utc;
use futures::StreamExt;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::nats::{ensure_stream, header_str};
use crate::persistence::postgres::with_tx;

#[derive(Debug, Clone)]
pub struct RiskResultConsumerConfig {
    pub topic: String,
    pub durable_name: String,
    pub ack_wait: Duration,
    pub max_deliver: i64,
}

impl Default for RiskResultConsumerConfig {
    fn default() -> Self {
        Self {
            topic: risk_topics::ROUTE_KEY_EVT.to_string(),
            durable_name: "cbsaga-orchestrator-risk".to_string(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Applied,
    AlreadyProcessed,
    Dropped,
}

pub struct RiskResultConsumer {
    jetstream: JetStreamContext,
    pool: PgPool,
    repo: Arc<dyn WithdrawalRepositoryTx>,
    config: RiskResultConsumerConfig,
}

impl RiskResultConsumer {
    pub fn new(
        jetstream: JetStreamContext,
        pool: PgPool,
        repo: Arc<dyn WithdrawalRepositoryTx>,
        config: RiskResultConsumerConfig,
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
            "risk result consumer started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("risk result consumer stopping");
                    return Ok(());
                }
                next = messages.next() => {
                    let Some(message) = next else {
                        warn!("risk result consumer stream ended");
                        return Ok(());
                    };
                    let message = match message {
                        Ok(message) => message,
                        Err(e) => {
                            error!(error = %e, "risk result message receive error");
                            continue;
                        }
                    };

                    match self.process(message.headers.as_ref(), &message.payload).await {
                        Ok(disposition) => {
                            debug!(?disposition, "risk result message handled");
                            if let Err(e) = message.ack().await {
                                error!(error = %e, "risk result ack failed");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "risk result processing failed");
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
        if event_type != risk_topics::EVENT_CHECK_APPROVED
            && event_type != risk_topics::EVENT_CHECK_REJECTED
        {
            debug!(event_type, "ignoring event type");
            return Ok(Disposition::Dropped);
        }

        let trace_id = match header_str(headers, HEADER_TRACE_ID) {
            Some(value) => TraceId::from_string(value),
            None => {
                warn!("risk result message without trace_id header");
                TraceId::new()
            }
        };

        let decision: RiskDecisionPayload = match decode_envelope_valid(payload) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "dropping structurally invalid risk result");
                return Ok(Disposition::Dropped);
            }
        };

        let repo = self.repo.clone();
        let applied = with_tx(&self.pool, "risk-result.apply", move |tx| {
            Box::pin(async move {
                let withdrawal = repo
                    .get_with_tx(tx, decision.withdrawal_id)
                    .await?
                    .ok_or(DomainError::WithdrawalNotFound {
                        withdrawal_id: decision.withdrawal_id,
                    })?;

                let (outbox_event_type, outgoing) = match decision.status {
                    RiskDecision::Approved => (
                        withdrawal_topics::EVENT_COMPLETED,
                        encode_valid(&WithdrawalCompletedPayload {
                            withdrawal_id: withdrawal.withdrawal_id,
                            user_id: withdrawal.user_id.clone(),
                        })?,
                    ),
                    RiskDecision::Rejected => (
                        withdrawal_topics::EVENT_FAILED,
                        encode_valid(&WithdrawalFailedPayload {
                            withdrawal_id: withdrawal.withdrawal_id,
                            user_id: withdrawal.user_id.clone(),
                            reason: decision.reason.clone(),
                        })?,
                    ),
                };

                repo.apply_risk_result_with_tx(
                    tx,
                    ApplyRiskResultParams {
                        withdrawal_id: decision.withdrawal_id,
                        user_id: decision.user_id,
                        decision: decision.status,
                        reason: decision.reason,
                        now: Utc::now(),
                        trace_id,
                        outbox_event_type: outbox_event_type.to_string(),
                        outbox_payload: outgoing,
                        route_key: withdrawal_topics::ROUTE_KEY_EVT.to_string(),
                    },
                )
                .await
            })
        })
        .await?;

        Ok(match applied {
            StepApplication::Applied => Disposition::Applied,
            StepApplication::AlreadyProcessed => Disposition::AlreadyProcessed,
        })
    }
}
