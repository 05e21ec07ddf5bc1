use futures::StreamExt;
use gateway_mq::message::EmailNotification;
use gateway_mq::rabbitmq::transport::BrokerChannel;
use gateway_mq::rabbitmq::{MemoryBroker, Message, Publisher, QueueProvisioner, QueueSpec};
use gateway_mq::services::NotificationSender;

use crate::{bounded, connect};

const NOTIFICATION: &str = r#"{"email":"a@b.com","subject":"x","other":"null","body":"OTP 123456"}"#;

#[tokio::test]
async fn test_notification_is_published_durably_and_delivered_once() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let publisher = Publisher::new(connection.clone());

    let notification: EmailNotification = serde_json::from_str(NOTIFICATION).unwrap();
    publisher
        .publish_json("email_notification", &notification)
        .await
        .unwrap();

    assert!(broker.queue_info("email_notification").unwrap().durable);

    // Drain it the way the notification service would.
    let channel = connection.open_channel().await.unwrap();
    let mut deliveries = channel
        .consume("email_notification", "notification-service")
        .await
        .unwrap();
    let delivery = bounded(deliveries.next()).await.unwrap().unwrap();
    assert!(delivery.persistent);
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&delivery.body).unwrap(),
        serde_json::from_str::<serde_json::Value>(NOTIFICATION).unwrap()
    );
    delivery.ack().await.unwrap();

    let nothing_more =
        tokio::time::timeout(std::time::Duration::from_millis(50), deliveries.next()).await;
    assert!(nothing_more.is_err());
    assert_eq!(broker.stats().published, 1);
    assert_eq!(broker.stats().acked, 1);
}

#[tokio::test]
async fn test_provisioning_twice_changes_nothing() {
    let broker = MemoryBroker::new();
    let provisioner = QueueProvisioner::new(connect(&broker).await);
    let spec = QueueSpec::durable("email_notification");

    provisioner.provision(&spec).await.unwrap();
    let before = broker.queue_info("email_notification").unwrap();
    provisioner.provision(&spec).await.unwrap();

    assert_eq!(broker.queue_info("email_notification").unwrap(), before);
    assert_eq!(broker.stats().deletes, 0);
}

#[tokio::test]
async fn test_transient_queue_is_reconciled_to_durable() {
    let broker = MemoryBroker::new();
    broker.declare(&QueueSpec::transient("email_notification"));
    broker.inject("email_notification", Message::new(b"stale".to_vec()));
    let sender = NotificationSender::new(connect(&broker).await, "email_notification");

    sender.send_otp("a@b.com").await.unwrap();

    let info = broker.queue_info("email_notification").unwrap();
    assert!(info.durable);
    // The stale message went with the old queue.
    assert_eq!(info.message_count, 1);
    assert!(broker.messages("email_notification")[0].persistent);
}

#[tokio::test]
async fn test_published_messages_survive_restart() {
    let broker = MemoryBroker::new();
    let publisher = Publisher::new(connect(&broker).await);

    publisher
        .publish("email_notification", NOTIFICATION.as_bytes().to_vec())
        .await
        .unwrap();
    broker.restart();

    let kept = broker.messages("email_notification");
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].body, NOTIFICATION.as_bytes());
}
