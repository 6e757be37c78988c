use dotenv::dotenv;
use std::env;

use crate::config::{ClientConfig, ConnectionParams, RecoveryConfig};
use crate::rabbitmq::channel_manager::ChannelConfig;
use crate::rabbitmq::errors::{RabbitMQError, Result};

pub const URL: &str = "RABBITMQ_URL";
pub const HOST: &str = "RABBITMQ_HOST";
pub const PORT: &str = "RABBITMQ_PORT";
pub const LOGIN: &str = "RABBITMQ_LOGIN";
pub const PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const VIRTUAL_HOST: &str = "RABBITMQ_VHOST";
pub const TLS: &str = "RABBITMQ_TLS";
pub const HEARTBEAT: &str = "RABBITMQ_HEARTBEAT_SECONDS";
pub const PREFETCH: &str = "RABBITMQ_PREFETCH_COUNT";
pub const MAX_RECONNECT_ATTEMPTS: &str = "RABBITMQ_MAX_RECONNECT_ATTEMPTS";

/// Builds a client configuration from `RABBITMQ_*` variables, reading a
/// `.env` file first when one is present. `RABBITMQ_URL` seeds the connection;
/// the individual variables override it. Unset variables keep their defaults.
pub fn load() -> Result<ClientConfig> {
    dotenv().ok();
    from_lookup(|key| env::var(key).ok())
}

pub(crate) fn from_lookup<F>(lookup: F) -> Result<ClientConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = match lookup(URL) {
        Some(url) => ConnectionParams::from_uri(&url).map_err(RabbitMQError::Config)?,
        None => ConnectionParams::default(),
    };

    let host = lookup(HOST).unwrap_or_else(|| defaults.host().to_string());
    let port = match lookup(PORT) {
        Some(val) => val.parse()?,
        None => defaults.port(),
    };
    let login = lookup(LOGIN).unwrap_or_else(|| defaults.login().to_string());
    let password = lookup(PASSWORD).unwrap_or_else(|| defaults.password().to_string());
    let virtual_host = lookup(VIRTUAL_HOST).unwrap_or_else(|| defaults.virtual_host().to_string());
    let tls = match lookup(TLS) {
        Some(val) => parse_flag(TLS, &val)?,
        None => defaults.tls(),
    };

    let mut connection = ConnectionParams::new(&host, port)
        .with_credentials(&login, &password)
        .with_virtual_host(&virtual_host)
        .with_tls(tls)
        .with_heartbeat(defaults.heartbeat().as_secs() as u16)
        .with_connection_timeout(defaults.connection_timeout());
    if let Some(val) = lookup(HEARTBEAT) {
        connection = connection.with_heartbeat(val.parse()?);
    }
    connection.validate().map_err(RabbitMQError::Config)?;

    let mut channel = ChannelConfig::default();
    if let Some(val) = lookup(PREFETCH) {
        channel.prefetch_count = val.parse()?;
    }

    let mut recovery = RecoveryConfig::default();
    if let Some(val) = lookup(MAX_RECONNECT_ATTEMPTS) {
        recovery.max_attempts = Some(val.parse()?);
    }

    Ok(ClientConfig {
        connection,
        recovery,
        channel,
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(RabbitMQError::Config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}
