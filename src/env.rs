use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::rabbitmq::{ChannelConfig, ReconnectPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub amqp_addr: String,
    pub ocr_queue: String,
    pub email_notification_queue: String,
    pub rpc_timeout_seconds: u64,
    pub reconnect_delay_seconds: u64,
    pub rabbitmq_prefetch_count: u16,
    pub rabbitmq_connect_timeout_seconds: u64,
}

fn default_ocr_queue() -> String {
    "ocr_service".to_string()
}

fn default_email_notification_queue() -> String {
    "email_notification".to_string()
}

fn default_rpc_timeout_seconds() -> u64 {
    30
}

fn default_reconnect_delay_seconds() -> u64 {
    5
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

impl Config {
    /// Reads the process environment, after loading `.env` if present.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let amqp_addr = lookup("AMQP_ADDR")
            .or_else(|| lookup("RABBITMQ_URL"))
            .filter(|addr| !addr.trim().is_empty())
            .ok_or_else(|| anyhow!("AMQP_ADDR (or RABBITMQ_URL) must be set"))?;

        Ok(Config {
            amqp_addr: normalize_addr(amqp_addr.trim()),
            ocr_queue: lookup("OCR_QUEUE").unwrap_or_else(default_ocr_queue),
            email_notification_queue: lookup("EMAIL_NOTIFICATION_QUEUE")
                .unwrap_or_else(default_email_notification_queue),
            rpc_timeout_seconds: parse_or(&lookup, "RPC_TIMEOUT_SECONDS", default_rpc_timeout_seconds)?,
            reconnect_delay_seconds: parse_or(
                &lookup,
                "RABBITMQ_RECONNECT_DELAY_SECONDS",
                default_reconnect_delay_seconds,
            )?,
            rabbitmq_prefetch_count: parse_or(&lookup, "RABBITMQ_PREFETCH_COUNT", default_prefetch_count)?,
            rabbitmq_connect_timeout_seconds: parse_or(
                &lookup,
                "RABBITMQ_CONNECT_TIMEOUT_SECONDS",
                default_connect_timeout_seconds,
            )?,
        })
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.rabbitmq_connect_timeout_seconds)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::fixed(Duration::from_secs(self.reconnect_delay_seconds))
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            prefetch_count: self.rabbitmq_prefetch_count,
            ..ChannelConfig::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: fn() -> T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {val:?}")),
        None => Ok(default()),
    }
}

/// Accepts either a full AMQP URI or a bare broker host.
fn normalize_addr(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else if addr.contains(':') {
        format!("amqp://{addr}/%2f")
    } else {
        format!("amqp://{addr}:5672/%2f")
    }
}
