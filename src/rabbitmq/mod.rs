// src/rabbitmq/mod.rs
// Broker plumbing: connection supervision, queue provisioning, durable
// publishing and correlated request/response.

pub mod errors;
pub mod transport;
pub mod connection;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod provisioner;
pub mod publisher;
pub mod request_response;

// lapin-backed transport
mod amqp_client;
mod channel_manager;

mod pending;

pub use amqp_client::{LapinConnection, LapinConnector};
pub use channel_manager::ChannelConfig;
pub use connection::{BrokerConnection, ReconnectPolicy};
pub use errors::{MessagingError, Result};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBroker;
pub use provisioner::QueueProvisioner;
pub use publisher::Publisher;
pub use request_response::{RpcClient, RpcServer};
pub use transport::{Delivery, Message, QueueSpec};
