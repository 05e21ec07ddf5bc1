use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use tracing::{debug, error};
use uuid::Uuid;

use super::errors::{MessagingError, Result};
use super::transport::{Acknowledge, BrokerChannel, Delivery, DeliveryStream, Message, QueueSpec};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            confirm_mode: true,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

/// A configured lapin channel behind the [`BrokerChannel`] seam.
pub struct LapinChannel {
    channel: Channel,
    config: ChannelConfig,
}

impl LapinChannel {
    /// Applies QoS and, in confirm mode, publisher confirms to a fresh channel.
    pub async fn configure(channel: Channel, config: ChannelConfig) -> Result<Self> {
        debug!(
            channel_id = %config.id,
            prefetch = %config.prefetch_count,
            confirm = %config.confirm_mode,
            "Configuring channel"
        );

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await?;
        if config.confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }

        Ok(Self { channel, config })
    }

    fn properties(message: &Message) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_timestamp(chrono::Utc::now().timestamp() as u64)
            .with_delivery_mode(if message.persistent {
                PERSISTENT_DELIVERY_MODE
            } else {
                TRANSIENT_DELIVERY_MODE
            });
        if let Some(content_type) = &message.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(correlation_id) = &message.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
        }
        if let Some(reply_to) = &message.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
        }
        properties
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        data,
        properties,
        acker,
        ..
    } = delivery;
    let correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let reply_to = properties
        .reply_to()
        .as_ref()
        .map(|queue| queue.as_str().to_string());
    let persistent = *properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE);

    Delivery::new(
        data,
        correlation_id,
        reply_to,
        persistent,
        Box::new(LapinAcker(acker)),
    )
}

fn with_queue(queue: &str, err: MessagingError) -> MessagingError {
    match err {
        MessagingError::ProvisionConflict { reason, .. } => MessagingError::ProvisionConflict {
            queue: queue.to_string(),
            reason,
        },
        other => other,
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| with_queue(&spec.name, e.into()))?;

        Ok(queue.name().as_str().to_string())
    }

    async fn delete_queue(&self, name: &str) -> Result<u32> {
        let count = self
            .channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(count)
    }

    async fn publish(&self, queue: &str, message: &Message) -> Result<()> {
        let classify = |e: lapin::Error| match MessagingError::from(e) {
            MessagingError::BrokerUnavailable(reason) => MessagingError::BrokerUnavailable(reason),
            other => MessagingError::publish_failed(queue, other.to_string()),
        };

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                Self::properties(message),
            )
            .await
            .map_err(classify)?;

        let confirmation = confirm.await.map_err(classify)?;
        if confirmation.is_nack() {
            error!(channel_id = %self.config.id, queue = %queue, "Broker nacked publish");
            return Err(MessagingError::publish_failed(queue, "broker nacked the message"));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(into_delivery).map_err(MessagingError::from))
            .boxed())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.is_open() {
            self.channel.close(200, "closing channel").await?;
        }
        Ok(())
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}
