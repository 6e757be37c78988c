//! Resilient RabbitMQ client: a single supervised connection, pooled
//! channels, publisher confirms, and topology plus consumers that come back
//! on their own after the broker does.

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use config::{ClientConfig, ConnectionParams, RecoveryConfig};
pub use message::{Delivery, FieldValue, MessageProperties, OutgoingMessage};
pub use rabbitmq::{Client, HandlerError, PublishOptions, SubscribeOptions};
