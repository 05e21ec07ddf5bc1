use futures::future::join_all;
use gateway_mq::rabbitmq::{MemoryBroker, Message, MessagingError, QueueSpec, RpcClient, RpcServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::{bounded, connect, eventually};

const OCR_QUEUE: &str = "ocr_service";

async fn echo_worker(broker: &MemoryBroker) -> JoinHandle<()> {
    RpcServer::new(connect(broker).await, OCR_QUEUE)
        .spawn(|body| async move { Ok::<_, MessagingError>(body) })
        .await
        .unwrap()
}

async fn client(broker: &MemoryBroker, timeout: Duration) -> Arc<RpcClient> {
    Arc::new(RpcClient::new(connect(broker).await, OCR_QUEUE, timeout).await.unwrap())
}

#[tokio::test]
async fn test_echo_round_trip() {
    let broker = MemoryBroker::new();
    let _worker = echo_worker(&broker).await;
    let client = client(&broker, Duration::from_secs(2)).await;

    let payload = br#"{"user_name":"Ada","file":"aGVsbG8="}"#.to_vec();
    let reply = client.call(payload.clone()).await.unwrap();

    assert_eq!(reply, payload);
}

#[tokio::test]
async fn test_foreign_replies_are_discarded() {
    let broker = MemoryBroker::new();
    broker.declare(&QueueSpec::durable(OCR_QUEUE));
    let client = client(&broker, Duration::from_secs(2)).await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call(b"request".to_vec()).await }
    });
    eventually("request to be published", || !broker.messages(OCR_QUEUE).is_empty()).await;

    let request = broker.messages(OCR_QUEUE).remove(0);
    let reply_to = request.reply_to.unwrap();
    let correlation_id = request.correlation_id.unwrap();

    broker.inject(&reply_to, Message::new(b"foreign".to_vec()).with_correlation_id("not-ours"));
    broker.inject(&reply_to, Message::new(b"anonymous".to_vec()));
    broker.inject(&reply_to, Message::new(b"ours".to_vec()).with_correlation_id(correlation_id));

    let reply = bounded(call).await.unwrap().unwrap();
    assert_eq!(reply, b"ours");
    eventually("all replies acknowledged", || broker.stats().acked == 3).await;
    assert_eq!(client.pending_calls().await, 0);
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_replies() {
    let broker = MemoryBroker::new();
    let _worker = RpcServer::new(connect(&broker).await, OCR_QUEUE)
        .spawn(|body| async move {
            // Later requests answer first.
            let n: u64 = serde_json::from_slice(&body)?;
            tokio::time::sleep(Duration::from_millis(50 - n * 5)).await;
            Ok::<_, MessagingError>(body)
        })
        .await
        .unwrap();
    let client = client(&broker, Duration::from_secs(2)).await;

    let calls = (0..10u64).map(|n| {
        let client = client.clone();
        async move { client.call_json::<_, u64>(&n).await }
    });
    let replies = bounded(join_all(calls)).await;

    for (n, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap(), n as u64);
    }
}

#[tokio::test]
async fn test_timeout_leaves_client_usable() {
    let broker = MemoryBroker::new();
    broker.declare(&QueueSpec::durable(OCR_QUEUE));
    let client = client(&broker, Duration::from_millis(100)).await;

    let err = client.call(b"first".to_vec()).await.err();
    assert!(matches!(err, Some(MessagingError::TimedOut(_))));
    assert_eq!(client.pending_calls().await, 0);

    // The worker also answers the stale request; that reply must be dropped.
    let _worker = echo_worker(&broker).await;
    let reply = client.call(b"second".to_vec()).await.unwrap();

    assert_eq!(reply, b"second");
    assert_eq!(client.pending_calls().await, 0);
}

#[tokio::test]
async fn test_dropped_connection_fails_waiting_call() {
    let broker = MemoryBroker::new();
    broker.declare(&QueueSpec::durable(OCR_QUEUE));
    let client = client(&broker, Duration::from_secs(30)).await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call(b"request".to_vec()).await }
    });
    eventually("request to be published", || !broker.messages(OCR_QUEUE).is_empty()).await;
    broker.drop_connections();

    let result = bounded(call).await.unwrap();
    assert!(matches!(result, Err(MessagingError::BrokerUnavailable(_))));
}

#[tokio::test]
async fn test_calls_fail_fast_while_broker_is_down() {
    let broker = MemoryBroker::new();
    let client = client(&broker, Duration::from_secs(30)).await;
    broker.set_offline(true);

    let result = bounded(client.call(b"request".to_vec())).await;

    assert!(matches!(result, Err(MessagingError::BrokerUnavailable(_))));
}

#[tokio::test]
async fn test_client_recovers_after_reconnect() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let _supervisor = connection.spawn_supervisor();
    let client = RpcClient::new(connection.clone(), OCR_QUEUE, Duration::from_secs(2))
        .await
        .unwrap();
    let first_reply_queue = client.reply_queue().await.unwrap();

    broker.drop_connections();
    eventually("reconnection", || connection.is_connected()).await;
    let _worker = echo_worker(&broker).await;

    let reply = client.call(b"again".to_vec()).await.unwrap();

    assert_eq!(reply, b"again");
    assert_ne!(client.reply_queue().await.unwrap(), first_reply_queue);
    assert!(broker.queue_info(&first_reply_queue).is_none());
}

#[tokio::test]
async fn test_cancelled_call_is_forgotten() {
    let broker = MemoryBroker::new();
    broker.declare(&QueueSpec::durable(OCR_QUEUE));
    let client = client(&broker, Duration::from_secs(30)).await;

    let result = client
        .call_with(
            b"request".to_vec(),
            Duration::from_secs(30),
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await;

    assert!(matches!(result, Err(MessagingError::Cancelled)));
    assert_eq!(client.pending_calls().await, 0);
}
