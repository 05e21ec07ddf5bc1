use gateway_mq::rabbitmq::{BrokerConnection, MemoryBroker, MessagingError, ReconnectPolicy};
use std::sync::Arc;
use std::time::Duration;

use crate::{connect, eventually};

#[tokio::test]
async fn test_connection_retries_with_fixed_delay() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(3);

    let started = tokio::time::Instant::now();
    let connection = BrokerConnection::connect(
        Arc::new(broker.connector()),
        ReconnectPolicy::fixed(Duration::from_millis(20)),
    )
    .await;

    assert!(connection.is_connected());
    assert_eq!(broker.stats().connect_attempts, 4);
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn test_request_paths_fail_fast_while_disconnected() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    broker.set_offline(true);

    let started = tokio::time::Instant::now();
    let err = connection.open_channel().await.err();

    assert!(matches!(err, Some(MessagingError::BrokerUnavailable(_))));
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn test_supervisor_reconnects_in_background() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let _supervisor = connection.spawn_supervisor();

    broker.drop_connections();
    assert!(!connection.is_connected());

    eventually("reconnection", || connection.is_connected()).await;
    assert_eq!(broker.stats().connections_opened, 2);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance at AMQP_ADDR
async fn test_live_broker_round_trip() {
    use gateway_mq::env::Config;
    use gateway_mq::rabbitmq::{LapinConnector, Publisher, RpcClient, RpcServer};

    let config = Config::load().expect("AMQP_ADDR must be set");
    let connector = LapinConnector::new(&config.amqp_addr).with_connect_timeout(config.connect_timeout());
    let connection = BrokerConnection::try_connect(Arc::new(connector), config.reconnect_policy())
        .await
        .expect("broker should be reachable");

    let queue = format!("gateway_mq_it_{}", uuid::Uuid::new_v4().simple());
    let _worker = RpcServer::new(connection.clone(), &queue)
        .spawn(|body| async move { Ok::<_, MessagingError>(body) })
        .await
        .unwrap();
    let client = RpcClient::new(connection.clone(), &queue, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(client.call(b"ping".to_vec()).await.unwrap(), b"ping");
    client.close().await;

    Publisher::new(connection.clone())
        .publish(&format!("{queue}_durable"), b"{}".to_vec())
        .await
        .unwrap();

    connection.close().await.unwrap();
}
