use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::connection::BrokerConnection;
use super::errors::{MessagingError, Result};
use super::provisioner::QueueProvisioner;
use super::transport::{Message, QueueSpec};

/// Durable fire-and-forget delivery to named queues.
///
/// Each publish opens its own channel and closes it afterwards. The connection
/// itself is shared and kept alive by its [`BrokerConnection`].
#[derive(Clone)]
pub struct Publisher {
    provisioner: QueueProvisioner,
}

impl Publisher {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self {
            provisioner: QueueProvisioner::new(connection),
        }
    }

    pub async fn publish_json<T: Serialize>(&self, queue: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.publish(queue, payload).await
    }

    /// Ensures `queue` is durable, then publishes one persistent message to it.
    pub async fn publish(&self, queue: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let provisioned = self
            .provisioner
            .provision(&QueueSpec::durable(queue))
            .await
            .map_err(|err| match err {
                MessagingError::BrokerUnavailable(reason) => MessagingError::BrokerUnavailable(reason),
                other => MessagingError::publish_failed(queue, other.to_string()),
            })?;

        let message = Message::new(payload).persistent();
        let result = provisioned.channel.publish(&provisioned.queue, &message).await;

        if let Err(err) = provisioned.channel.close().await {
            warn!(queue = %queue, error = %err, "Failed to close publish channel");
        }

        match &result {
            Ok(()) => info!(queue = %queue, bytes = message.body.len(), "Published durable message"),
            Err(err) => error!(queue = %queue, error = %err, "Failed to publish message"),
        }
        result
    }
}
