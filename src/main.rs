use anyhow::{Context, Result};
use cuterabbit::config::{self, ClientConfig};
use cuterabbit::message::Delivery;
use cuterabbit::rabbitmq::{Client, ExchangeDeclaration, ExchangeKind, HandlerError, QueueDeclaration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const EXCHANGE: &str = "logs";
const QUEUE: &str = "potato";
const ROUTING_KEYS: [&str; 2] = ["info", "warning"];

fn load_config() -> Result<ClientConfig> {
    match config::load_config() {
        Ok(config) => Ok(config),
        Err(err) => {
            info!("No config file ({}), reading RABBITMQ_* environment variables", err);
            cuterabbit::env::load().context("Failed to load configuration from the environment")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let client = Client::connect(config).await?;

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "Connection event");
        }
    });

    client
        .declare_exchange(ExchangeDeclaration::new(EXCHANGE, ExchangeKind::Topic))
        .await?;
    client
        .declare_queue(QueueDeclaration::new(QUEUE).durable(true))
        .await?;
    for routing_key in ROUTING_KEYS {
        client.bind(QUEUE, EXCHANGE, routing_key).await?;
    }

    let registration = client
        .consume(
            QUEUE,
            |delivery: Delivery| async move {
                match delivery.body_str() {
                    Some(body) => info!(routing_key = %delivery.routing_key, body, "Received!"),
                    None => warn!(routing_key = %delivery.routing_key, bytes = delivery.body.len(), "Received non-UTF-8 message"),
                }
                Ok::<(), HandlerError>(())
            },
            client.subscribe_options(),
        )
        .await?;
    info!(queue = QUEUE, consumer = registration.id(), "Waiting for messages, press Ctrl+C to exit");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    client.close().await;
    info!("Bye");
    Ok(())
}
