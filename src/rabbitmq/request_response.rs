use futures::{FutureExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::BrokerConnection;
use super::errors::{MessagingError, Result};
use super::pending::{PendingCalls, PendingGuard};
use super::provisioner::QueueProvisioner;
use super::transport::{BrokerChannel, Delivery, DeliveryStream, Message, QueueSpec};

const LIVENESS_CHECK: Duration = Duration::from_millis(500);

/// One exclusive reply queue plus the dispatcher pumping it.
struct ReplySession {
    reply_queue: String,
    consume_channel: Arc<dyn BrokerChannel>,
    publish_channel: Arc<dyn BrokerChannel>,
    pending: Arc<PendingCalls>,
    dispatcher: JoinHandle<()>,
}

impl ReplySession {
    async fn open(connection: &BrokerConnection, provisioner: &QueueProvisioner) -> Result<Self> {
        let provisioned = provisioner.provision(&QueueSpec::reply()).await?;
        let reply_queue = provisioned.queue;
        let consume_channel = provisioned.channel;

        let consumer_tag = format!("rpc-client-{}", &Uuid::new_v4().to_string()[..8]);
        let deliveries = consume_channel.consume(&reply_queue, &consumer_tag).await?;
        let publish_channel = connection.open_channel().await?;

        let pending = Arc::new(PendingCalls::default());
        let dispatcher = tokio::spawn(dispatch(
            deliveries,
            consume_channel.clone(),
            pending.clone(),
            reply_queue.clone(),
        ));

        info!(reply_queue = %reply_queue, "RPC reply queue ready");
        Ok(Self {
            reply_queue,
            consume_channel,
            publish_channel,
            pending,
            dispatcher,
        })
    }

    fn is_alive(&self) -> bool {
        !self.pending.is_closed() && self.consume_channel.is_open() && self.publish_channel.is_open()
    }

    async fn shutdown(&self, reason: &str) {
        self.pending.close(reason);
        self.dispatcher.abort();
        for channel in [&self.publish_channel, &self.consume_channel] {
            if let Err(err) = channel.close().await {
                debug!(reply_queue = %self.reply_queue, error = %err, "Channel already gone on shutdown");
            }
        }
    }
}

impl Drop for ReplySession {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Pumps the reply queue until its consumer ends, then fails whatever is
/// still waiting.
async fn dispatch(
    mut deliveries: DeliveryStream,
    channel: Arc<dyn BrokerChannel>,
    pending: Arc<PendingCalls>,
    reply_queue: String,
) {
    let mut liveness = tokio::time::interval(LIVENESS_CHECK);

    let reason = loop {
        tokio::select! {
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => route_reply(&pending, &reply_queue, delivery).await,
                Some(Err(err)) => break format!("reply consumer failed: {err}"),
                None => break "reply consumer closed".to_string(),
            },
            _ = liveness.tick() => {
                if !channel.is_open() {
                    break "reply channel closed".to_string();
                }
            }
        }
    };

    let failed = pending.close(&reason);
    error!(reply_queue = %reply_queue, failed, reason = %reason, "Reply dispatcher stopped");
}

async fn route_reply(pending: &PendingCalls, reply_queue: &str, mut delivery: Delivery) {
    let body = std::mem::take(&mut delivery.body);
    match delivery.correlation_id.as_deref() {
        Some(id) => match pending.resolve(id, body) {
            Some(elapsed) => debug!(correlation_id = %id, ?elapsed, "Reply matched"),
            None => debug!(reply_queue = %reply_queue, correlation_id = %id, "Discarding reply with no waiting call"),
        },
        None => warn!(reply_queue = %reply_queue, "Discarding reply without correlation id"),
    }

    if let Err(err) = delivery.ack().await {
        warn!(reply_queue = %reply_queue, error = %err, "Failed to acknowledge reply");
    }
}

/// Request/response over the broker, correlated by id on a private reply queue.
///
/// Any number of calls may be in flight at once; each waits only for the
/// reply carrying its own correlation id.
pub struct RpcClient {
    connection: Arc<BrokerConnection>,
    provisioner: QueueProvisioner,
    request_queue: String,
    timeout: Duration,
    session: tokio::sync::Mutex<Option<Arc<ReplySession>>>,
}

impl RpcClient {
    /// Provisions the reply queue and starts its dispatcher.
    pub async fn new(
        connection: Arc<BrokerConnection>,
        request_queue: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let provisioner = QueueProvisioner::new(connection.clone());
        let session = ReplySession::open(&connection, &provisioner).await?;

        Ok(Self {
            connection,
            provisioner,
            request_queue: request_queue.to_string(),
            timeout,
            session: tokio::sync::Mutex::new(Some(Arc::new(session))),
        })
    }

    pub fn request_queue(&self) -> &str {
        &self.request_queue
    }

    pub async fn reply_queue(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.reply_queue.clone())
    }

    pub async fn pending_calls(&self) -> usize {
        self.session
            .lock()
            .await
            .as_ref()
            .map_or(0, |session| session.pending.len())
    }

    /// Current session, re-opened once if the previous one died with its
    /// connection. Never waits for the broker.
    async fn session(&self) -> Result<Arc<ReplySession>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            if session.is_alive() {
                *slot = Some(session.clone());
                return Ok(session);
            }
            warn!(reply_queue = %session.reply_queue, "Reply session lost, re-initialising");
            session.shutdown("reply session replaced").await;
        }

        let session = Arc::new(ReplySession::open(&self.connection, &self.provisioner).await?);
        *slot = Some(session.clone());
        Ok(session)
    }

    pub async fn call(&self, payload: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
        self.call_with(payload, self.timeout, std::future::pending::<()>())
            .await
    }

    /// Sends `payload` and waits for the matching reply, at most `timeout`
    /// from the moment of the call, or until `cancel` completes. Giving up
    /// does not retract a request that was already published.
    pub async fn call_with<F>(
        &self,
        payload: impl Into<Vec<u8>>,
        timeout: Duration,
        cancel: F,
    ) -> Result<Vec<u8>>
    where
        F: Future<Output = ()>,
    {
        let correlation_id = Uuid::new_v4().to_string();
        let payload = payload.into();

        // Publishing counts against the deadline too: a blocked broker can
        // hold the confirm indefinitely.
        let exchange = async {
            let session = self.session().await?;
            let receiver = session.pending.register(&correlation_id)?;
            let _guard = PendingGuard::new(&session.pending, correlation_id.clone());

            let message = Message::new(payload)
                .with_correlation_id(&correlation_id)
                .with_reply_to(&session.reply_queue);
            session
                .publish_channel
                .publish(&self.request_queue, &message)
                .await?;
            debug!(
                queue = %self.request_queue,
                correlation_id = %correlation_id,
                "RPC request published"
            );

            receiver.await.unwrap_or_else(|_| {
                Err(MessagingError::unavailable("reply dispatcher stopped"))
            })
        };

        tokio::select! {
            reply = exchange => reply,
            _ = sleep(timeout) => {
                warn!(
                    queue = %self.request_queue,
                    correlation_id = %correlation_id,
                    ?timeout,
                    "RPC call timed out"
                );
                Err(MessagingError::TimedOut(timeout))
            }
            _ = cancel => {
                debug!(correlation_id = %correlation_id, "RPC call cancelled");
                Err(MessagingError::Cancelled)
            }
        }
    }

    pub async fn call_json<T, R>(&self, request: &T) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)?;
        let reply = self.call(payload).await?;
        serde_json::from_slice(&reply).map_err(|e| MessagingError::Deserialization(e.to_string()))
    }

    /// Fails outstanding calls and releases the reply queue. The shared
    /// connection stays open.
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown("RPC client closed").await;
        }
    }
}

/// Consumes a request queue and answers each request on its `reply_to` queue.
pub struct RpcServer {
    connection: Arc<BrokerConnection>,
    provisioner: QueueProvisioner,
    queue: String,
}

impl RpcServer {
    pub fn new(connection: Arc<BrokerConnection>, queue: &str) -> Self {
        Self {
            provisioner: QueueProvisioner::new(connection.clone()),
            connection,
            queue: queue.to_string(),
        }
    }

    /// Subscribes to the (durable) request queue, then serves it in a
    /// background task. Requests published after this returns are handled.
    pub async fn spawn<F, Fut>(&self, handler: F) -> Result<JoinHandle<()>>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        let provisioned = self.provisioner.provision(&QueueSpec::durable(&self.queue)).await?;
        let channel = provisioned.channel;
        let consumer_tag = format!("rpc-server-{}", &Uuid::new_v4().to_string()[..8]);
        let mut requests = channel.consume(&provisioned.queue, &consumer_tag).await?;
        info!("RPC server started on queue: {}", provisioned.queue);

        let handler = Arc::new(handler);
        let queue = provisioned.queue;
        // The consumer lives only as long as its connection.
        let connection = self.connection.clone();
        Ok(tokio::spawn(async move {
            let _connection = connection;
            while let Some(next) = requests.next().await {
                match next {
                    Ok(delivery) => {
                        let channel = channel.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            Self::process_request(channel, delivery, handler).await;
                        });
                    }
                    Err(err) => {
                        error!(queue = %queue, error = %err, "Error receiving request");
                        break;
                    }
                }
            }
            warn!(queue = %queue, "RPC server stopped consuming");
        }))
    }

    /// Serves until the request consumer ends.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        let task = self.spawn(handler).await?;
        task.await
            .map_err(|e| MessagingError::unavailable(format!("RPC server task failed: {e}")))
    }

    async fn process_request<F, Fut>(
        channel: Arc<dyn BrokerChannel>,
        mut delivery: Delivery,
        handler: Arc<F>,
    ) where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        let (Some(reply_to), Some(correlation_id)) =
            (delivery.reply_to.clone(), delivery.correlation_id.clone())
        else {
            error!("Received RPC request without reply_to or correlation_id");
            if let Err(err) = delivery.reject(false).await {
                error!(error = %err, "Failed to reject request");
            }
            return;
        };

        let body = std::mem::take(&mut delivery.body);
        let reply = match AssertUnwindSafe(handler(body)).catch_unwind().await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                error!(correlation_id = %correlation_id, error = %err, "Error processing request");
                if let Err(err) = delivery.reject(false).await {
                    error!(error = %err, "Failed to reject request");
                }
                return;
            }
            Err(_) => {
                error!(correlation_id = %correlation_id, "Request handler panicked");
                if let Err(err) = delivery.reject(false).await {
                    error!(error = %err, "Failed to reject request");
                }
                return;
            }
        };

        let message = Message::new(reply).with_correlation_id(&correlation_id);
        match channel.publish(&reply_to, &message).await {
            Ok(()) => {
                debug!(correlation_id = %correlation_id, reply_to = %reply_to, "Sent RPC reply");
                if let Err(err) = delivery.ack().await {
                    error!(error = %err, "Failed to acknowledge request");
                }
            }
            Err(err) => {
                error!(correlation_id = %correlation_id, error = %err, "Failed to send reply");
                if let Err(err) = delivery.reject(true).await {
                    error!(error = %err, "Failed to requeue request");
                }
            }
        }
    }
}
