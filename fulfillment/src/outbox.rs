use chrono::{DateTime, Utc};
use common::config::RelayConfig;
use metrics::counter;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, trace, warn};

use crate::error::MarketError;
use crate::model::{OutboxEvent, OutboxPayload};
use crate::object_store::ObjectStorage;
use crate::storage::{ConversationStorage, OutboxStorage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub retried: usize,
    pub parked: usize,
}

impl RelayReport {
    pub fn handled(&self) -> usize {
        self.delivered + self.retried + self.parked
    }
}

/// Delivers outbox events: chat notifications and object deletions.
pub struct Relay {
    outbox: Arc<dyn OutboxStorage>,
    conversations: Arc<dyn ConversationStorage>,
    objects: Arc<dyn ObjectStorage>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        outbox: Arc<dyn OutboxStorage>,
        conversations: Arc<dyn ConversationStorage>,
        objects: Arc<dyn ObjectStorage>,
        config: RelayConfig,
    ) -> Self {
        info!("Initializing new Relay");
        Self {
            outbox,
            conversations,
            objects,
            config,
        }
    }

    /// Delay before the next attempt of an event that has failed `attempts` times.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.clamp(0, 20) as u32;
        let delay = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_delay_ms);
        Duration::from_millis(delay)
    }

    fn retry_at(&self, event: &OutboxEvent) -> Option<DateTime<Utc>> {
        let attempts = event.attempts + 1;
        if attempts >= self.config.max_attempts as i32 {
            return None;
        }
        let delay = chrono::Duration::from_std(self.backoff(event.attempts)).ok()?;
        Some(Utc::now() + delay)
    }

    async fn deliver(&self, payload: &OutboxPayload) -> Result<(), MarketError> {
        match payload {
            OutboxPayload::ChatMessage {
                consumer_id,
                producer_id,
                sender_id,
                body,
            } => {
                let conversation = self
                    .conversations
                    .find_or_create_conversation(*consumer_id, *producer_id)
                    .await?;
                let message = self
                    .conversations
                    .append_message(conversation.id, *sender_id, body)
                    .await?;
                debug!(
                    conversation_id = conversation.id,
                    message_id = message.id,
                    "Delivered chat message"
                );
                Ok(())
            }
            OutboxPayload::DeleteObject { bucket, url } => {
                let path = self.objects.object_path(bucket, url)?;
                let existed = self.objects.delete(bucket, &path).await?;
                if !existed {
                    debug!(bucket = %bucket, path = %path, "Object was already gone");
                }
                Ok(())
            }
        }
    }

    pub async fn run_once(&self) -> Result<RelayReport, MarketError> {
        let events = self.outbox.fetch_due(self.config.batch_size).await?;
        let mut report = RelayReport::default();

        for event in events {
            match self.deliver(&event.payload).await {
                Ok(()) => {
                    self.outbox.mark_delivered(event.id).await?;
                    counter!("market_outbox_delivered_total").increment(1);
                    report.delivered += 1;
                }
                Err(e) => {
                    counter!("market_outbox_failed_total").increment(1);
                    let retry_at = self.retry_at(&event);
                    self.outbox.mark_failed(event.id, &e.to_string(), retry_at).await?;
                    match retry_at {
                        Some(at) => {
                            warn!(
                                event_id = event.id,
                                attempts = event.attempts + 1,
                                retry_at = %at,
                                error = %e,
                                "Outbox delivery failed, will retry"
                            );
                            report.retried += 1;
                        }
                        None => {
                            error!(
                                event_id = event.id,
                                attempts = event.attempts + 1,
                                error = %e,
                                "Outbox delivery failed, giving up"
                            );
                            report.parked += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    pub async fn run(self) {
        info!(batch_size = self.config.batch_size, "Starting outbox relay");
        let idle = Duration::from_millis(self.config.sleep_ms);
        loop {
            match self.run_once().await {
                Ok(report) if report.handled() == 0 => {
                    trace!("No outbox events due");
                    tokio::time::sleep(idle).await;
                }
                Ok(report) => info!(
                    delivered = report.delivered,
                    retried = report.retried,
                    parked = report.parked,
                    "Relayed outbox batch"
                ),
                Err(e) => {
                    error!(error = %e, "Outbox relay cycle failed");
                    tokio::time::sleep(idle).await;
                }
            }
        }
    }
}
