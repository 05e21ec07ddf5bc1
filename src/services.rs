//! The two broker-facing operations the gateway's services perform.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::message::{generate_otp, EmailNotification, OcrCall, OcrRequest};
use crate::rabbitmq::{BrokerConnection, Publisher, Result, RpcClient};

/// Publishes email notifications durably to the notification queue.
#[derive(Clone)]
pub struct NotificationSender {
    publisher: Publisher,
    queue: String,
}

impl NotificationSender {
    pub fn new(connection: Arc<BrokerConnection>, queue: &str) -> Self {
        Self {
            publisher: Publisher::new(connection),
            queue: queue.to_string(),
        }
    }

    pub async fn send(&self, notification: &EmailNotification) -> Result<()> {
        self.publisher.publish_json(&self.queue, notification).await
    }

    /// Generates an OTP, queues the verification mail, and returns the OTP
    /// so the caller can store it.
    pub async fn send_otp(&self, email: &str) -> Result<String> {
        let otp = generate_otp();
        self.send(&EmailNotification::otp_verification(email, &otp)).await?;
        info!(queue = %self.queue, email = %email, "OTP notification queued");
        Ok(otp)
    }
}

/// Synchronous OCR over the broker.
pub struct OcrGateway {
    client: RpcClient,
}

impl OcrGateway {
    pub async fn new(connection: Arc<BrokerConnection>, queue: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: RpcClient::new(connection, queue, timeout).await?,
        })
    }

    /// Sends `request` wrapped as `{"image_data": ...}`. The worker's reply is
    /// passed through as JSON, whatever its shape.
    pub async fn recognize(&self, request: &OcrRequest) -> Result<Value> {
        self.client.call_json(&OcrCall::from(request)).await
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}
