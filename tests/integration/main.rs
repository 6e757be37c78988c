// Integration tests run against the in-memory broker, so no RabbitMQ
// instance is needed.

use cuterabbit::config::{ClientConfig, RecoveryConfig};
use cuterabbit::rabbitmq::{Client, MemoryBroker};
use std::sync::Arc;
use std::time::Duration;

mod consume;
mod publish;
mod recovery;
mod topology;

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.recovery = RecoveryConfig::default()
        .with_reconnect_policy(None, 10)
        .without_jitter();
    config.recovery.max_delay_ms = 100;
    config.channel.acquire_timeout_ms = 5_000;
    config
}

pub async fn connect(broker: &MemoryBroker) -> Client {
    connect_with(broker, test_config()).await
}

pub async fn connect_with(broker: &MemoryBroker, config: ClientConfig) -> Client {
    Client::connect_with(config, Arc::new(broker.clone()))
        .await
        .expect("client should connect to the memory broker")
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
