use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gateway_mq::env::Config;
use gateway_mq::rabbitmq::{BrokerConnection, LapinConnector, MessagingError, RpcClient, RpcServer};
use gateway_mq::services::NotificationSender;

const USAGE: &str = "usage: gateway-mq <worker | call '<json>' | notify <email>>";

enum Command {
    Worker,
    Call(String),
    Notify(String),
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args {
        [cmd] if cmd == "worker" => Ok(Command::Worker),
        [cmd, payload] if cmd == "call" => Ok(Command::Call(payload.clone())),
        [cmd, email] if cmd == "notify" => Ok(Command::Notify(email.clone())),
        _ => bail!(USAGE),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    let config = Config::load().context("failed to load configuration")?;

    let connector = LapinConnector::new(&config.amqp_addr)
        .with_connect_timeout(config.connect_timeout())
        .with_channel_config(config.channel_config());
    connector.validate()?;
    let connection = BrokerConnection::connect(Arc::new(connector), config.reconnect_policy()).await;
    let supervisor = connection.spawn_supervisor();

    let outcome = tokio::select! {
        outcome = run(command, &config, connection.clone()) => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    connection.close().await.context("failed to close broker connection")?;
    supervisor.abort();
    outcome
}

async fn run(command: Command, config: &Config, connection: Arc<BrokerConnection>) -> Result<()> {
    match command {
        Command::Worker => {
            info!(queue = %config.ocr_queue, "Starting echo worker");
            RpcServer::new(connection, &config.ocr_queue)
                .run(|body| async move { Ok::<_, MessagingError>(body) })
                .await?;
        }
        Command::Call(payload) => {
            let request: serde_json::Value =
                serde_json::from_str(&payload).context("call payload must be valid JSON")?;
            let client = RpcClient::new(connection, &config.ocr_queue, config.rpc_timeout()).await?;
            let result = client.call_json::<_, serde_json::Value>(&request).await;
            client.close().await;
            match result {
                Ok(reply) => println!("{reply}"),
                Err(err) => {
                    error!(status = err.status_code(), error = %err, "RPC call failed");
                    return Err(err.into());
                }
            }
        }
        Command::Notify(email) => {
            let sender = NotificationSender::new(connection, &config.email_notification_queue);
            let otp = sender.send_otp(&email).await?;
            println!("{otp}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn parses_subcommands() {
        assert!(matches!(parse_args(&args(&["worker"])), Ok(Command::Worker)));
        assert!(matches!(
            parse_args(&args(&["call", "{}"])),
            Ok(Command::Call(payload)) if payload == "{}"
        ));
        assert!(matches!(
            parse_args(&args(&["notify", "a@b.com"])),
            Ok(Command::Notify(email)) if email == "a@b.com"
        ));
    }

    #[test]
    fn rejects_unknown_commands() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["publish"])).is_err());
        assert!(parse_args(&args(&["call"])).is_err());
    }
}
