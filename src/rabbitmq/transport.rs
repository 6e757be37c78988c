// src/rabbitmq/transport.rs
// The seam between the client core and whatever speaks AMQP on the wire.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::config::ConnectionParams;
use crate::message::{Delivery, OutgoingMessage};
use crate::rabbitmq::errors::TransportError;
use crate::rabbitmq::topology::{Binding, ExchangeDeclaration, QueueDeclaration, QueueInfo};

pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;
pub type EventStream = BoxStream<'static, ChannelEvent>;

/// Asynchronous notifications a channel receives from the broker outside of
/// request/response pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool },
    /// A mandatory/immediate publish came back; its ack follows.
    Returned {
        delivery_tag: u64,
        reply_code: u16,
        reply_text: String,
    },
    Closed { reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub mandatory: bool,
    pub immediate: bool,
    pub message: &'a OutgoingMessage,
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Link>, TransportError>;
}

/// One physical connection.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<Box<dyn ChannelLink>, TransportError>;

    fn is_connected(&self) -> bool;

    /// Resolves with a reason once the connection is lost or closed.
    async fn closed(&self) -> String;

    async fn close(&self) -> Result<(), TransportError>;
}

/// One AMQP channel on a [`Link`]. Callers serialize writes; implementations
/// do not have to be safe for concurrent writes.
#[async_trait]
pub trait ChannelLink: Send + Sync + 'static {
    /// Channel number on the connection.
    fn number(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, declaration: &ExchangeDeclaration) -> Result<(), TransportError>;

    async fn queue_declare(&self, declaration: &QueueDeclaration) -> Result<QueueInfo, TransportError>;

    async fn queue_bind(&self, binding: &Binding) -> Result<(), TransportError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    /// Switches the channel to confirm mode; delivery tags restart at 1.
    async fn confirm_select(&self) -> Result<(), TransportError>;

    /// Returns the delivery tag the broker will confirm, or 0 outside confirm mode.
    async fn basic_publish(&self, request: PublishRequest<'_>) -> Result<u64, TransportError>;

    /// Starts a consumer with a broker-assigned tag.
    async fn basic_consume(&self, queue: &str, no_ack: bool) -> Result<(String, DeliveryStream), TransportError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Event stream of the channel. Only the first call returns it.
    fn take_events(&self) -> Option<EventStream>;

    async fn close(&self) -> Result<(), TransportError>;
}
