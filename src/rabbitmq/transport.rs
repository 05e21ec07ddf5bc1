//! Broker-neutral seams between the messaging core and a concrete AMQP client.
//!
//! [`Connector`] opens a [`Transport`] (one live connection), which hands out
//! [`BrokerChannel`]s. Everything above this module talks to these traits only,
//! so the same publisher and RPC client run against lapin in production and
//! against the in-memory broker (`test-util` feature) in tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::uri::{AMQPScheme, AMQPUri};
use std::fmt;
use std::sync::Arc;

use super::errors::Result;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Stream of deliveries for one consumer. It ends (or yields an error) when the
/// channel or connection underneath it goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;

    /// Address for logs, with credentials removed.
    fn describe(&self) -> String;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares `spec` and returns the queue's actual name (broker-generated
    /// for anonymous queues).
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String>;

    /// Deletes a queue, returning how many messages it still held.
    async fn delete_queue(&self, name: &str) -> Result<u32>;

    /// Publishes through the default exchange, routing on the queue name.
    async fn publish(&self, queue: &str, message: &Message) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Work or notification queue that survives a broker restart.
    pub fn durable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    pub fn transient(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Private reply queue: the broker picks the name, only the declaring
    /// connection may use it, and it goes away with that connection.
    pub fn reply() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

/// One outbound unit of transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
    pub content_type: Option<String>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            ..Self::default()
        }
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// One inbound unit of transport, carrying the means to settle it.
pub struct Delivery {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        correlation_id: Option<String>,
        reply_to: Option<String>,
        persistent: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            body,
            correlation_id,
            reply_to,
            persistent,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("persistent", &self.persistent)
            .finish()
    }
}

/// Rebuilds an AMQP URI without its password so it can be logged.
///
/// Input lapin cannot parse keeps its host part only.
pub fn redact_uri(uri: &str) -> String {
    match uri.parse::<AMQPUri>() {
        Ok(parsed) => {
            let scheme = match parsed.scheme {
                AMQPScheme::AMQP => "amqp",
                AMQPScheme::AMQPS => "amqps",
            };
            let vhost = parsed.vhost.replace('%', "%25").replace('/', "%2f");
            format!(
                "{scheme}://{}@{}:{}/{vhost}",
                parsed.authority.userinfo.username, parsed.authority.host, parsed.authority.port
            )
        }
        Err(_) => match uri.split_once("://") {
            Some((scheme, rest)) => match rest.rsplit_once('@') {
                Some((_, host)) => format!("{scheme}://***@{host}"),
                None => uri.to_string(),
            },
            None => uri.to_string(),
        },
    }
}
