use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::amqp_client::LapinConnector;
use super::errors::{MessagingError, Result};
use super::transport::{BrokerChannel, Connector, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Fixed pause between connection attempts.
    pub delay: Duration,
    /// How often the background supervisor checks the connection.
    pub check_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            check_interval: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            check_interval: delay.min(Duration::from_secs(1)),
        }
    }
}

/// Owns the live broker connection for one component.
///
/// Only [`connect`](Self::connect) and [`reconnect`](Self::reconnect) wait
/// for the broker; everything else fails fast with
/// [`MessagingError::BrokerUnavailable`] while the connection is down.
pub struct BrokerConnection {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    current: RwLock<Option<Arc<dyn Transport>>>,
    reconnecting: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl BrokerConnection {
    fn with_connector(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            current: RwLock::new(None),
            reconnecting: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Connects, retrying forever with the policy's fixed delay.
    pub async fn connect(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Arc<Self> {
        let connection = Arc::new(Self::with_connector(connector, policy));
        connection.reconnect().await;
        connection
    }

    /// Makes exactly one connection attempt.
    pub async fn try_connect(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>> {
        let transport = connector.connect().await?;
        info!(uri = %connector.describe(), "Connected to broker");
        let connection = Self::with_connector(connector, policy);
        connection.replace(Some(transport));
        Ok(Arc::new(connection))
    }

    /// Lapin-backed connection to `uri`, retrying forever.
    pub async fn lapin(uri: &str, policy: ReconnectPolicy) -> Arc<Self> {
        Self::connect(Arc::new(LapinConnector::new(uri)), policy).await
    }

    pub fn is_connected(&self) -> bool {
        self.transport().is_some_and(|transport| transport.is_connected())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, transport: Option<Arc<dyn Transport>>) -> Option<Arc<dyn Transport>> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, transport)
    }

    /// Opens a channel on the current connection without waiting for the broker.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.is_closed() {
            return Err(MessagingError::unavailable("connection has been closed"));
        }
        match self.transport() {
            Some(transport) if transport.is_connected() => transport.open_channel().await,
            _ => Err(MessagingError::unavailable(format!(
                "not connected to {}",
                self.connector.describe()
            ))),
        }
    }

    /// Re-establishes the connection, retrying forever with a fixed delay.
    /// Returns immediately if the connection is already up or has been closed.
    pub async fn reconnect(&self) {
        let _guard = self.reconnecting.lock().await;
        let mut attempt: u32 = 0;

        while !self.is_closed() && !self.is_connected() {
            attempt += 1;
            info!(uri = %self.connector.describe(), attempt, "Attempting to connect to broker");

            match self.connector.connect().await {
                Ok(transport) => {
                    info!(uri = %self.connector.describe(), attempt, "Connected to broker");
                    self.replace(Some(transport));
                    return;
                }
                Err(err) => {
                    warn!(
                        uri = %self.connector.describe(),
                        attempt,
                        error = %err,
                        "Failed to connect to broker. Retrying in {:?}",
                        self.policy.delay
                    );
                    sleep(self.policy.delay).await;
                }
            }
        }
    }

    /// Background task that re-establishes the connection whenever it drops.
    /// Exits once the connection is closed or every other owner has dropped it.
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.policy.check_interval;

        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                if connection.is_closed() {
                    break;
                }
                if !connection.is_connected() {
                    error!(uri = %connection.connector.describe(), "Broker connection lost");
                    connection.reconnect().await;
                }
            }
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Some(transport) = self.replace(None) {
            info!("Closing broker connection gracefully");
            transport.close().await?;
        }
        Ok(())
    }
}
