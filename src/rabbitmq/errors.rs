// src/rabbitmq/errors.rs

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    /// The connection could not be established or was lost.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The broker took the connection but rejected or failed to confirm a publish.
    #[error("publish to `{queue}` failed: {reason}")]
    PublishFailed { queue: String, reason: String },

    #[error("no reply within {0:?}")]
    TimedOut(Duration),

    #[error("call cancelled by caller")]
    Cancelled,

    /// A queue already exists with parameters different from the requested ones.
    #[error("queue `{queue}` exists with conflicting parameters: {reason}")]
    ProvisionConflict { queue: String, reason: String },

    #[error("broker rejected operation: {0}")]
    Protocol(String),

    #[error("message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("message deserialization error: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, MessagingError>;

impl MessagingError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        MessagingError::BrokerUnavailable(reason.into())
    }

    pub fn publish_failed(queue: &str, reason: impl Into<String>) -> Self {
        MessagingError::PublishFailed {
            queue: queue.to_string(),
            reason: reason.into(),
        }
    }

    /// HTTP status a gateway should answer with when this error ends a request.
    pub fn status_code(&self) -> u16 {
        match self {
            MessagingError::BrokerUnavailable(_) => 503,
            MessagingError::TimedOut(_) => 504,
            MessagingError::PublishFailed { .. }
            | MessagingError::Protocol(_)
            | MessagingError::ProvisionConflict { .. }
            | MessagingError::Deserialization(_) => 502,
            MessagingError::Cancelled => 499,
            MessagingError::Serialization(_) => 400,
            MessagingError::Configuration(_) => 500,
        }
    }

    /// Whether trying again later, without changing the request, can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MessagingError::BrokerUnavailable(_)
                | MessagingError::TimedOut(_)
                | MessagingError::PublishFailed { .. }
        )
    }

    pub(crate) fn is_conflict(&self) -> bool {
        matches!(self, MessagingError::ProvisionConflict { .. })
    }
}

/// Classifies a lapin error by kind.
///
/// Connection and I/O failures mean the broker is gone; a soft
/// `PRECONDITION_FAILED` means a declare disagreed with existing state. The
/// caller fills in the queue name for conflicts via [`MessagingError::ProvisionConflict`].
impl From<LapinError> for MessagingError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::IOError(_)
            | LapinError::InvalidConnectionState(_)
            | LapinError::InvalidChannelState(_)
            | LapinError::InvalidChannel(_)
            | LapinError::ChannelsLimitReached => MessagingError::BrokerUnavailable(error.to_string()),
            LapinError::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    MessagingError::ProvisionConflict {
                        queue: String::new(),
                        reason: amqp.to_string(),
                    }
                }
                AMQPErrorKind::Hard(_) => MessagingError::BrokerUnavailable(amqp.to_string()),
                _ => MessagingError::Protocol(amqp.to_string()),
            },
            _ => MessagingError::Protocol(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_maps_to_service_unavailable() {
        let err = MessagingError::unavailable("connection refused");
        assert_eq!(err.status_code(), 503);
        assert!(err.is_retryable());
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        let err = MessagingError::TimedOut(Duration::from_secs(3));
        assert_eq!(err.status_code(), 504);
        assert_eq!(err.to_string(), "no reply within 3s");
    }

    #[test]
    fn publish_failure_names_the_queue() {
        let err = MessagingError::publish_failed("email_notification", "nack");
        assert_eq!(
            err.to_string(),
            "publish to `email_notification` failed: nack"
        );
        assert_eq!(err.status_code(), 502);
    }

    #[test]
    fn serialization_errors_are_not_retryable() {
        let serde_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: MessagingError = serde_err.into();
        assert!(!err.is_retryable());
        assert!(!err.is_conflict());
    }

    #[test]
    fn io_errors_mean_the_broker_is_gone() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: MessagingError = LapinError::IOError(std::sync::Arc::new(io)).into();
        assert!(matches!(err, MessagingError::BrokerUnavailable(_)));
    }
}
