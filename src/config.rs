// src/config.rs
use anyhow::{anyhow, Context, Result};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::rabbitmq::channel_manager::ChannelConfig;

/// Everything needed to reach a broker. Immutable once built: the builder
/// methods consume the value and the session only ever holds a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_login")]
    login: String,
    #[serde(default = "default_password")]
    password: String,
    #[serde(default = "default_virtual_host")]
    virtual_host: String,
    #[serde(default)]
    tls: bool,
    #[serde(default = "default_heartbeat")]
    heartbeat_seconds: u16,
    #[serde(default = "default_timeout")]
    connection_timeout_ms: u64,
    #[serde(default)]
    connection_name: Option<String>,
    #[serde(default)]
    client_properties: BTreeMap<String, String>,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_login() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_virtual_host() -> String { "/".to_string() }
fn default_heartbeat() -> u16 { 60 }
fn default_timeout() -> u64 { 5000 }

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams {
            host: default_host(),
            port: default_port(),
            login: default_login(),
            password: default_password(),
            virtual_host: default_virtual_host(),
            tls: false,
            heartbeat_seconds: default_heartbeat(),
            connection_timeout_ms: default_timeout(),
            connection_name: None,
            client_properties: BTreeMap::new(),
        }
    }
}

impl ConnectionParams {
    pub fn new(host: &str, port: u16) -> Self {
        ConnectionParams {
            host: host.to_string(),
            port,
            ..ConnectionParams::default()
        }
    }

    /// Parses an `amqp://` or `amqps://` URL. Heartbeat and connection timeout
    /// come from the query string when present.
    pub fn from_uri(uri: &str) -> std::result::Result<Self, String> {
        let parsed = AMQPUri::from_str(uri).map_err(|e| format!("invalid AMQP URI: {}", e))?;
        let defaults = ConnectionParams::default();
        let params = ConnectionParams {
            host: parsed.authority.host,
            port: parsed.authority.port,
            login: parsed.authority.userinfo.username,
            password: parsed.authority.userinfo.password,
            virtual_host: parsed.vhost,
            tls: matches!(parsed.scheme, AMQPScheme::AMQPS),
            heartbeat_seconds: parsed.query.heartbeat.unwrap_or(defaults.heartbeat_seconds),
            connection_timeout_ms: parsed
                .query
                .connection_timeout
                .unwrap_or(defaults.connection_timeout_ms),
            ..defaults
        };
        params.validate()?;
        Ok(params)
    }

    pub fn with_credentials(mut self, login: &str, password: &str) -> Self {
        self.login = login.to_string();
        self.password = password.to_string();
        self
    }

    pub fn with_virtual_host(mut self, virtual_host: &str) -> Self {
        self.virtual_host = virtual_host.to_string();
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat_seconds = seconds;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_string());
        self
    }

    pub fn with_client_property(mut self, key: &str, value: &str) -> Self {
        self.client_properties
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn host(&self) -> &str { &self.host }
    pub fn port(&self) -> u16 { self.port }
    pub fn login(&self) -> &str { &self.login }
    pub fn password(&self) -> &str { &self.password }
    pub fn virtual_host(&self) -> &str { &self.virtual_host }
    pub fn tls(&self) -> bool { self.tls }
    pub fn heartbeat(&self) -> Duration { Duration::from_secs(self.heartbeat_seconds.into()) }
    pub fn connection_timeout(&self) -> Duration { Duration::from_millis(self.connection_timeout_ms) }
    pub fn connection_name(&self) -> Option<&str> { self.connection_name.as_deref() }
    pub fn client_properties(&self) -> &BTreeMap<String, String> { &self.client_properties }

    /// `host:port` for log lines and errors.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.host.is_empty() {
            return Err("host cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("port cannot be 0".to_string());
        }
        if self.virtual_host.is_empty() {
            return Err("virtual host cannot be empty".to_string());
        }
        Ok(())
    }

    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: if self.tls { AMQPScheme::AMQPS } else { AMQPScheme::AMQP },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.login.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat_seconds),
                connection_timeout: Some(self.connection_timeout_ms),
                ..AMQPQueryString::default()
            },
        }
    }
}

impl fmt::Display for ConnectionParams {
    /// Renders a URI with the password masked.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        let vhost = if self.virtual_host == "/" { "%2f" } else { self.virtual_host.as_str() };
        write!(f, "{}://{}:***@{}:{}/{}", scheme, self.login, self.host, self.port, vhost)
    }
}

/// Reconnection policy of the transport session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// `None` retries until the session is closed.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_initial_delay() -> u64 { 1000 }
fn default_multiplier() -> u32 { 2 }
fn default_max_delay() -> u64 { 30000 }
fn default_jitter() -> bool { true }

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            initial_delay_ms: default_initial_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
            max_attempts: None,
            jitter: default_jitter(),
        }
    }
}

impl RecoveryConfig {
    pub fn with_reconnect_policy(mut self, max_attempts: Option<u32>, initial_delay_ms: u64) -> Self {
        self.max_attempts = max_attempts;
        self.initial_delay_ms = initial_delay_ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        if !self.jitter {
            return Duration::from_millis(delay);
        }
        // Exponential backoff with jitter
        let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
        Duration::from_millis((delay as f64 + jitter).max(0.0) as u64)
    }
}

// Configuration structures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionParams,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

impl ClientConfig {
    pub fn new(connection: ConnectionParams) -> Self {
        ClientConfig {
            connection,
            ..ClientConfig::default()
        }
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    // Check various locations
    let locations = [
        ("Current directory", Path::new("cuterabbit.json")),
        ("Current directory (alternative)", Path::new("config/cuterabbit.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".cuterabbit.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find cuterabbit.json in the current directory, config/, or the home directory"
    ))
}

pub fn load_config() -> Result<ClientConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(config_path: &Path) -> Result<ClientConfig> {
    let config_content = fs::read_to_string(config_path)
        .context(format!("Failed to read config file at {}", config_path.display()))?;

    let config: ClientConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    config
        .connection
        .validate()
        .map_err(|e| anyhow!("Configuration error: {}", e))?;

    Ok(config)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&ClientConfig::default())
        .context("Failed to serialize default configuration")?;

    // Create parent directories if they don't exist
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
