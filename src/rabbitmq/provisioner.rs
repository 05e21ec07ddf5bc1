use std::sync::Arc;
use tracing::{debug, warn};

use super::connection::BrokerConnection;
use super::errors::{MessagingError, Result};
use super::transport::{BrokerChannel, QueueSpec};

/// A declared queue together with a channel that is still open after the
/// declaration (a failed declare closes the channel it was sent on).
pub struct Provisioned {
    pub channel: Arc<dyn BrokerChannel>,
    pub queue: String,
}

/// Makes sure a queue exists with the requested parameters before first use.
#[derive(Clone)]
pub struct QueueProvisioner {
    connection: Arc<BrokerConnection>,
}

impl QueueProvisioner {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self { connection }
    }

    /// Declares `spec` on a fresh channel.
    ///
    /// When the queue already exists with other parameters it is deleted and
    /// declared again; messages it held are lost. No other error triggers the
    /// delete. Declaring an already matching queue changes nothing.
    pub async fn provision(&self, spec: &QueueSpec) -> Result<Provisioned> {
        let channel = self.connection.open_channel().await?;

        match channel.declare_queue(spec).await {
            Ok(queue) => {
                debug!(queue = %queue, durable = spec.durable, exclusive = spec.exclusive, "Queue provisioned");
                Ok(Provisioned { channel, queue })
            }
            Err(err) if err.is_conflict() && !spec.is_anonymous() => {
                warn!(
                    queue = %spec.name,
                    durable = spec.durable,
                    error = %err,
                    "Queue exists with conflicting parameters, deleting and redeclaring"
                );
                self.reconcile(spec).await
            }
            Err(err) => Err(err),
        }
    }

    async fn reconcile(&self, spec: &QueueSpec) -> Result<Provisioned> {
        let channel = self.connection.open_channel().await?;

        let dropped = channel.delete_queue(&spec.name).await?;
        if dropped > 0 {
            warn!(queue = %spec.name, dropped, "Discarded messages from conflicting queue");
        }

        match channel.declare_queue(spec).await {
            Ok(queue) => Ok(Provisioned { channel, queue }),
            // Someone redeclared the old shape between our delete and declare.
            Err(MessagingError::ProvisionConflict { queue, reason }) => Err(
                MessagingError::Protocol(format!("queue `{queue}` still conflicts after redeclare: {reason}")),
            ),
            Err(err) => Err(err),
        }
    }
}
