// src/rabbitmq/errors.rs

use std::time::Duration;
use thiserror::Error;

/// AMQP reply codes the client reacts to.
pub const ACCESS_REFUSED: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const RESOURCE_LOCKED: u16 = 405;
pub const PRECONDITION_FAILED: u16 = 406;
pub const NOT_IMPLEMENTED: u16 = 540;

/// Failure reported by the transport collaborator (lapin or the in-memory broker).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("broker refused operation ({code}): {text}")]
    Refused { code: u16, text: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// True when the failure comes from losing the channel or the connection
    /// underneath it, as opposed to the broker rejecting the request.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed(_) | TransportError::ChannelClosed(_)
        )
    }

    pub fn reply_code(&self) -> Option<u16> {
        match self {
            TransportError::Refused { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to connect to {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("connection to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("invalid connection parameters: {0}")]
    InvalidParams(String),

    #[error("session was closed and cannot reconnect")]
    SessionClosed,
}

/// Raised when no usable channel can be handed out.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel (or the connection below it) went away; recovery is in
    /// progress and the operation can be retried.
    #[error("channel lost: {0}")]
    Lost(String),

    #[error("timed out after {0:?} waiting for an open channel")]
    AcquireTimeout(Duration),

    #[error("client is closed")]
    Closed,
}

impl ChannelError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChannelError::Closed)
    }
}

impl From<TransportError> for ChannelError {
    fn from(error: TransportError) -> Self {
        ChannelError::Lost(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("{kind} '{name}' is already declared as {existing}, refusing {requested}")]
    Conflict {
        kind: &'static str,
        name: String,
        existing: String,
        requested: String,
    },

    #[error("invalid declaration: {0}")]
    Invalid(String),

    #[error("broker rejected {kind} '{name}': {source}")]
    Rejected {
        kind: &'static str,
        name: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl DeclarationError {
    pub(crate) fn from_transport(kind: &'static str, name: &str, error: TransportError) -> Self {
        if error.is_connection_loss() {
            DeclarationError::Channel(ChannelError::Lost(error.to_string()))
        } else {
            DeclarationError::Rejected {
                kind,
                name: name.to_string(),
                source: error,
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DeclarationError::Channel(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("message to '{exchange}' with routing key '{routing_key}' was unroutable ({reply_code}: {reply_text})")]
    Unroutable {
        exchange: String,
        routing_key: String,
        reply_code: u16,
        reply_text: String,
    },

    #[error("broker nacked delivery {delivery_tag}")]
    Nacked { delivery_tag: u64 },

    #[error("no confirmation for delivery {delivery_tag} after {timeout:?}")]
    ConfirmTimeout { delivery_tag: u64, timeout: Duration },

    #[error("channel lost while publishing: {0}")]
    ChannelLost(String),

    #[error("broker rejected publish: {0}")]
    Rejected(#[source] TransportError),

    #[error("message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("client is closed")]
    Closed,
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::ChannelLost(_))
    }
}

impl From<ChannelError> for PublishError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::Closed => PublishError::Closed,
            other => PublishError::ChannelLost(other.to_string()),
        }
    }
}

impl From<TransportError> for PublishError {
    fn from(error: TransportError) -> Self {
        if error.is_connection_loss() {
            PublishError::ChannelLost(error.to_string())
        } else {
            PublishError::Rejected(error)
        }
    }
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("broker refused consumer on '{queue}': {source}")]
    Rejected {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("invalid subscription: {0}")]
    Invalid(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl SubscribeError {
    pub(crate) fn from_transport(queue: &str, error: TransportError) -> Self {
        if error.is_connection_loss() {
            SubscribeError::Channel(ChannelError::Lost(error.to_string()))
        } else {
            SubscribeError::Rejected {
                queue: queue.to_string(),
                source: error,
            }
        }
    }
}

/// Outcome of a failed message handler. The variant decides whether the
/// message goes back to the queue.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("recoverable handler failure: {0}")]
    Recoverable(#[source] anyhow::Error),

    #[error("non-recoverable handler failure: {0}")]
    NonRecoverable(#[source] anyhow::Error),

    /// Left to the registration's classifier.
    #[error("handler failure: {0}")]
    Unclassified(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn recoverable<E: Into<anyhow::Error>>(error: E) -> Self {
        HandlerError::Recoverable(error.into())
    }

    pub fn non_recoverable<E: Into<anyhow::Error>>(error: E) -> Self {
        HandlerError::NonRecoverable(error.into())
    }
}

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Declaration(#[from] DeclarationError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error("configuration error: {0}")]
    Config(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl From<std::env::VarError> for RabbitMQError {
    fn from(err: std::env::VarError) -> Self {
        RabbitMQError::Config(format!("Environment variable error: {}", err))
    }
}

impl From<std::num::ParseIntError> for RabbitMQError {
    fn from(err: std::num::ParseIntError) -> Self {
        RabbitMQError::Config(format!("Parse error: {}", err))
    }
}
