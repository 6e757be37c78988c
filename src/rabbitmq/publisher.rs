use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::message::OutgoingMessage;
use crate::rabbitmq::channel_manager::ChannelPool;
use crate::rabbitmq::confirms::ConfirmOutcome;
use crate::rabbitmq::errors::PublishError;
use crate::rabbitmq::transport::PublishRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Unroutable messages fail with `PublishError::Unroutable`.
    pub mandatory: bool,
    pub immediate: bool,
    /// Suspend until the broker acks or nacks.
    pub wait_for_confirm: bool,
    /// Retry once on a fresh channel when the channel is lost mid-publish.
    /// The message may then reach the broker twice.
    pub retry_on_channel_lost: bool,
    pub confirm_timeout: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            mandatory: false,
            immediate: false,
            wait_for_confirm: true,
            retry_on_channel_lost: false,
            confirm_timeout: Duration::from_secs(30),
        }
    }
}

impl PublishOptions {
    pub fn fire_and_forget() -> Self {
        PublishOptions {
            wait_for_confirm: false,
            ..PublishOptions::default()
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn with_retry(mut self) -> Self {
        self.retry_on_channel_lost = true;
        self
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    // A return only surfaces through the confirm that follows it.
    fn waits(&self) -> bool {
        self.wait_for_confirm || self.mandatory || self.immediate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Acked,
    NotRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub confirmation: Confirmation,
    pub delivery_tag: Option<u64>,
    /// 2 when the publish was retried after a channel loss.
    pub attempts: u32,
    pub channel_id: String,
}

pub struct Publisher {
    pool: Arc<ChannelPool>,
}

impl Publisher {
    pub fn new(pool: Arc<ChannelPool>) -> Self {
        Publisher { pool }
    }

    pub async fn publish(
        &self,
        message: &OutgoingMessage,
        routing_key: &str,
        exchange: &str,
        options: &PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.publish_once(message, routing_key, exchange, options).await {
                Ok(mut outcome) => {
                    outcome.attempts = attempts;
                    return Ok(outcome);
                }
                Err(err) if err.is_retryable() && options.retry_on_channel_lost && attempts < 2 => {
                    warn!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        error = %err,
                        "Channel lost while publishing, retrying on a fresh channel"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        value: &T,
        routing_key: &str,
        exchange: &str,
        options: &PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        let message = OutgoingMessage::json(value)?;
        self.publish(&message, routing_key, exchange, options).await
    }

    async fn publish_once(
        &self,
        message: &OutgoingMessage,
        routing_key: &str,
        exchange: &str,
        options: &PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        let request = PublishRequest {
            exchange,
            routing_key,
            mandatory: options.mandatory,
            immediate: options.immediate,
            message,
        };

        // The channel goes back to the pool before the confirm wait so other
        // publishers can pipeline on it.
        let (ticket, channel_id) = {
            let channel = self.pool.acquire().await?;
            // Returns and confirms only exist in confirm mode.
            if options.waits() && !channel.confirm_mode() {
                channel.enable_confirms().await?;
            }
            let ticket = channel.publish(request, options.waits()).await?;
            (ticket, channel.id().to_string())
        };

        info!(
            exchange = %exchange,
            routing_key = %routing_key,
            channel_id = %channel_id,
            delivery_tag = ?ticket.delivery_tag,
            "Published message"
        );

        let Some(confirm) = ticket.confirm else {
            return Ok(PublishOutcome {
                confirmation: Confirmation::NotRequested,
                delivery_tag: ticket.delivery_tag,
                attempts: 1,
                channel_id,
            });
        };
        let delivery_tag = ticket.delivery_tag.unwrap_or_default();

        let outcome = match tokio::time::timeout(options.confirm_timeout, confirm).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(PublishError::ChannelLost(format!(
                    "confirm tracking for {} went away",
                    channel_id
                )))
            }
            Err(_) => {
                warn!(delivery_tag, channel_id = %channel_id, "Timed out waiting for publisher confirm");
                return Err(PublishError::ConfirmTimeout {
                    delivery_tag,
                    timeout: options.confirm_timeout,
                });
            }
        };

        debug!(delivery_tag, outcome = ?outcome, "Publisher confirm received");
        match outcome {
            ConfirmOutcome::Acked => Ok(PublishOutcome {
                confirmation: Confirmation::Acked,
                delivery_tag: Some(delivery_tag),
                attempts: 1,
                channel_id,
            }),
            ConfirmOutcome::Returned {
                reply_code,
                reply_text,
            } => Err(PublishError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reply_code,
                reply_text,
            }),
            ConfirmOutcome::Nacked => Err(PublishError::Nacked { delivery_tag }),
            ConfirmOutcome::Lost(reason) => Err(PublishError::ChannelLost(reason)),
            ConfirmOutcome::Closed => Err(PublishError::Closed),
        }
    }
}
