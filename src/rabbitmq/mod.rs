// src/rabbitmq/mod.rs
pub mod channel_manager;
pub mod client;
pub mod confirms;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod lapin_transport;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod publisher;
pub mod topology;
pub mod transport;

pub use channel_manager::{ChannelConfig, ChannelPool, PoolStats};
pub use client::Client;
pub use connection::{Session, SessionEvent, SessionState};
pub use consumer::{
    AckMode, ConsumerStats, Disposition, ErrorClassifier, MessageHandler, Registration, RegistrationState,
    SubscribeOptions,
};
pub use errors::{
    ChannelError, ConnectError, DeclarationError, HandlerError, PublishError, RabbitMQError, Result,
    SubscribeError,
};
pub use lapin_transport::LapinConnector;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBroker;
pub use publisher::{Confirmation, PublishOptions, PublishOutcome};
pub use topology::{Binding, Declaration, ExchangeDeclaration, ExchangeKind, QueueDeclaration, QueueInfo};
