// One integration test binary; the modules share its helpers.

mod connection_test;
mod publisher_test;
mod rpc_test;

use gateway_mq::rabbitmq::{BrokerConnection, MemoryBroker, ReconnectPolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub async fn connect(broker: &MemoryBroker) -> Arc<BrokerConnection> {
    BrokerConnection::connect(
        Arc::new(broker.connector()),
        ReconnectPolicy::fixed(Duration::from_millis(10)),
    )
    .await
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Fails the test if `future` has not finished within two seconds.
pub async fn bounded<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("operation hung")
}
