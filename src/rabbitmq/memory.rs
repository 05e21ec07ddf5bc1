//! In-process broker with AMQP 0-9-1 default-exchange semantics.
//!
//! Queues are addressed by name, exclusive queues belong to the connection
//! that declared them and disappear with it, a declare that disagrees with an
//! existing queue fails with a precondition conflict and closes the channel,
//! and messages routed to a missing queue are dropped. Faults can be injected
//! (refused connections, dropped connections, rejected publishes, restarts).

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::errors::{MessagingError, Result};
use super::transport::{
    Acknowledge, BrokerChannel, Connector, Delivery, DeliveryStream, Message, QueueSpec, Transport,
};

/// Counters over everything the broker has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connect_attempts: usize,
    pub connections_opened: usize,
    pub declares: usize,
    pub deletes: usize,
    pub published: usize,
    pub unroutable: usize,
    pub acked: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub message_count: usize,
    pub consumer_count: usize,
}

struct ConsumerSlot {
    channel: u64,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct QueueState {
    spec: QueueSpec,
    owner: Option<u64>,
    messages: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    connections: HashSet<u64>,
    // channel id -> owning connection id
    channels: HashMap<u64, u64>,
    next_id: u64,
    refuse_connections: usize,
    offline: bool,
    reject_publishes: bool,
    stall_publishes: bool,
    refuse_deletes: bool,
    // Queue that reappears with these parameters right after it is deleted.
    redeclare_after_delete: Option<QueueSpec>,
    stats: BrokerStats,
}

type Shared = Arc<Mutex<BrokerState>>;

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn close_channel(&mut self, channel: u64) {
        self.channels.remove(&channel);
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|slot| slot.channel != channel);
        }
    }

    fn close_connection(&mut self, connection: u64) {
        if !self.connections.remove(&connection) {
            return;
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, owner)| **owner == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        self.queues
            .retain(|_, queue| queue.owner != Some(connection));
        debug!(connection, "memory broker closed connection");
    }

    fn ensure_open(&self, channel: u64) -> Result<u64> {
        match self.channels.get(&channel) {
            Some(connection) if self.connections.contains(connection) => Ok(*connection),
            Some(_) => Err(MessagingError::unavailable("connection closed")),
            None => Err(MessagingError::unavailable("channel closed")),
        }
    }

    /// Hands `message` to the next live consumer, or queues it.
    fn route(&mut self, shared: &Shared, queue_name: &str, message: Message) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            self.stats.unroutable += 1;
            return;
        };

        while !queue.consumers.is_empty() {
            let index = queue.next_consumer % queue.consumers.len();
            let delivery = Delivery::new(
                message.body.clone(),
                message.correlation_id.clone(),
                message.reply_to.clone(),
                message.persistent,
                Box::new(MemoryAcker {
                    state: shared.clone(),
                    queue: queue_name.to_string(),
                    message: message.clone(),
                }),
            );
            if queue.consumers[index].sender.send(Ok(delivery)).is_ok() {
                queue.next_consumer = index + 1;
                return;
            }
            queue.consumers.remove(index);
        }
        queue.messages.push_back(message);
    }
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Shared,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            state: self.state.clone(),
        }
    }

    /// Declares a queue outside any connection, as another service would have.
    pub fn declare(&self, spec: &QueueSpec) {
        let mut state = lock(&self.state);
        state.queues.entry(spec.name.clone()).or_insert(QueueState {
            spec: spec.clone(),
            owner: None,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        });
    }

    /// Publishes from outside any client connection.
    pub fn inject(&self, queue: &str, message: Message) {
        let mut state = lock(&self.state);
        state.stats.published += 1;
        state.route(&self.state, queue, message);
    }

    pub fn queue_info(&self, name: &str) -> Option<QueueInfo> {
        let state = lock(&self.state);
        state.queues.get(name).map(|queue| QueueInfo {
            name: name.to_string(),
            durable: queue.spec.durable,
            exclusive: queue.spec.exclusive,
            auto_delete: queue.spec.auto_delete,
            message_count: queue.messages.len(),
            consumer_count: queue.consumers.len(),
        })
    }

    /// Messages waiting in a queue, oldest first.
    pub fn messages(&self, name: &str) -> Vec<Message> {
        let state = lock(&self.state);
        state
            .queues
            .get(name)
            .map(|queue| queue.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> BrokerStats {
        lock(&self.state).stats.clone()
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn open_channels(&self) -> usize {
        lock(&self.state).channels.len()
    }

    /// Severs every open connection, as a network partition would.
    pub fn drop_connections(&self) {
        let mut state = lock(&self.state);
        let connections: Vec<u64> = state.connections.iter().copied().collect();
        for connection in connections {
            state.close_connection(connection);
        }
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_connections(&self, count: usize) {
        lock(&self.state).refuse_connections = count;
    }

    /// Offline drops existing connections and refuses new ones until cleared.
    pub fn set_offline(&self, offline: bool) {
        lock(&self.state).offline = offline;
        if offline {
            self.drop_connections();
        }
    }

    pub fn reject_publishes(&self, reject: bool) {
        lock(&self.state).reject_publishes = reject;
    }

    /// Publishes never complete, as under broker flow control.
    pub fn stall_publishes(&self, stall: bool) {
        lock(&self.state).stall_publishes = stall;
    }

    /// Queue deletes fail with ACCESS_REFUSED.
    pub fn refuse_deletes(&self, refuse: bool) {
        lock(&self.state).refuse_deletes = refuse;
    }

    /// The next delete of `spec.name` is immediately followed by another
    /// client declaring it again with `spec`.
    pub fn redeclare_after_delete(&self, spec: &QueueSpec) {
        lock(&self.state).redeclare_after_delete = Some(spec.clone());
    }

    /// Restart: connections drop, transient queues vanish, durable queues
    /// keep only their persistent messages.
    pub fn restart(&self) {
        self.drop_connections();
        let mut state = lock(&self.state);
        state.queues.retain(|_, queue| queue.spec.durable);
        for queue in state.queues.values_mut() {
            queue.messages.retain(|message| message.persistent);
        }
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    state: Shared,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let mut state = lock(&self.state);
        state.stats.connect_attempts += 1;
        if state.offline {
            return Err(MessagingError::unavailable("connection refused"));
        }
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(MessagingError::unavailable("connection refused"));
        }
        let id = state.next_id();
        state.connections.insert(id);
        state.stats.connections_opened += 1;
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            id,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

pub struct MemoryConnection {
    state: Shared,
    id: u64,
}

#[async_trait]
impl Transport for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = lock(&self.state);
        if !state.connections.contains(&self.id) {
            return Err(MessagingError::unavailable("connection closed"));
        }
        let id = state.next_id();
        state.channels.insert(id, self.id);
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connections.contains(&self.id)
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state).close_connection(self.id);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        lock(&self.state).close_connection(self.id);
    }
}

pub struct MemoryChannel {
    state: Shared,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let mut state = lock(&self.state);
        let connection = state.ensure_open(self.id)?;
        state.stats.declares += 1;

        let name = if spec.is_anonymous() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != connection) {
                state.close_channel(self.id);
                return Err(MessagingError::Protocol(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{name}'"
                )));
            }
            let current = &existing.spec;
            if current.durable != spec.durable
                || current.exclusive != spec.exclusive
                || current.auto_delete != spec.auto_delete
            {
                let reason = format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{name}': received '{}' but current is '{}'",
                    spec.durable, current.durable
                );
                state.close_channel(self.id);
                return Err(MessagingError::ProvisionConflict {
                    queue: name,
                    reason,
                });
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                spec: QueueSpec {
                    name: name.clone(),
                    ..spec.clone()
                },
                owner: spec.exclusive.then_some(connection),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> Result<u32> {
        let mut state = lock(&self.state);
        let connection = state.ensure_open(self.id)?;
        if state.refuse_deletes {
            state.close_channel(self.id);
            return Err(MessagingError::Protocol(format!(
                "ACCESS_REFUSED - delete access to queue '{name}' refused"
            )));
        }
        if let Some(queue) = state.queues.get(name) {
            if queue.owner.is_some_and(|owner| owner != connection) {
                state.close_channel(self.id);
                return Err(MessagingError::Protocol(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{name}'"
                )));
            }
        }
        state.stats.deletes += 1;
        let dropped = state
            .queues
            .remove(name)
            .map(|queue| queue.messages.len() as u32)
            .unwrap_or(0);

        if state
            .redeclare_after_delete
            .as_ref()
            .is_some_and(|spec| spec.name == name)
        {
            if let Some(spec) = state.redeclare_after_delete.take() {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec,
                        owner: None,
                        messages: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
            }
        }
        Ok(dropped)
    }

    async fn publish(&self, queue: &str, message: &Message) -> Result<()> {
        let stalled = {
            let state = lock(&self.state);
            state.ensure_open(self.id)?;
            state.stall_publishes
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;
        if state.reject_publishes {
            return Err(MessagingError::publish_failed(queue, "broker nacked the message"));
        }
        state.stats.published += 1;
        state.route(&self.state, queue, message.clone());
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = lock(&self.state);
            let connection = state.ensure_open(self.id)?;
            let Some(target) = state.queues.get(queue) else {
                state.close_channel(self.id);
                return Err(MessagingError::Protocol(format!(
                    "NOT_FOUND - no queue '{queue}'"
                )));
            };
            if target.owner.is_some_and(|owner| owner != connection) {
                state.close_channel(self.id);
                return Err(MessagingError::Protocol(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{queue}'"
                )));
            }

            let backlog: Vec<Message> = state
                .queues
                .get_mut(queue)
                .map(|target| {
                    target.consumers.push(ConsumerSlot {
                        channel: self.id,
                        sender,
                    });
                    target.messages.drain(..).collect()
                })
                .unwrap_or_default();
            for message in backlog {
                state.route(&self.state, queue, message);
            }
        }

        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    fn is_open(&self) -> bool {
        lock(&self.state).ensure_open(self.id).is_ok()
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state).close_channel(self.id);
        Ok(())
    }
}

struct MemoryAcker {
    state: Shared,
    queue: String,
    message: Message,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        lock(&self.state).stats.acked += 1;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let mut state = lock(&self.state);
        state.stats.rejected += 1;
        if requeue {
            state.route(&self.state, &self.queue, self.message.clone());
        }
        Ok(())
    }
}
