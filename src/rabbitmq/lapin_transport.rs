// src/rabbitmq/lapin_transport.rs
// Transport backed by lapin: framing, TLS and the socket live there.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable as AmqpTable, LongString, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use crate::config::ConnectionParams;
use crate::message::{Delivery, FieldTable, FieldValue, MessageProperties};
use crate::rabbitmq::errors::TransportError;
use crate::rabbitmq::topology::{
    Binding, ExchangeDeclaration, ExchangeKind, QueueDeclaration, QueueInfo,
};
use crate::rabbitmq::transport::{
    ChannelEvent, ChannelLink, Connector, DeliveryStream, EventStream, Link, PublishRequest,
};

const REPLY_SUCCESS: u16 = 200;

fn map_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::ProtocolError(amqp) => TransportError::Refused {
            code: amqp.get_id(),
            text: amqp.get_message().as_str().to_string(),
        },
        lapin::Error::InvalidChannelState(state) => {
            TransportError::ChannelClosed(format!("channel is {:?}", state))
        }
        lapin::Error::InvalidConnectionState(state) => {
            TransportError::ConnectionClosed(format!("connection is {:?}", state))
        }
        lapin::Error::IOError(io) => TransportError::ConnectionClosed(io.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

fn to_amqp_table(table: &FieldTable) -> AmqpTable {
    let mut amqp = AmqpTable::default();
    for (key, value) in table {
        let value = match value {
            FieldValue::Bool(b) => AMQPValue::Boolean(*b),
            FieldValue::Int(i) => AMQPValue::LongLongInt(*i),
            FieldValue::Str(s) => AMQPValue::LongString(LongString::from(s.clone())),
        };
        amqp.insert(ShortString::from(key.clone()), value);
    }
    amqp
}

fn from_amqp_table(table: &AmqpTable) -> FieldTable {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::Boolean(b) => FieldValue::Bool(*b),
                AMQPValue::ShortShortInt(i) => FieldValue::Int((*i).into()),
                AMQPValue::ShortShortUInt(i) => FieldValue::Int((*i).into()),
                AMQPValue::ShortInt(i) => FieldValue::Int((*i).into()),
                AMQPValue::ShortUInt(i) => FieldValue::Int((*i).into()),
                AMQPValue::LongInt(i) => FieldValue::Int((*i).into()),
                AMQPValue::LongUInt(i) => FieldValue::Int((*i).into()),
                AMQPValue::LongLongInt(i) => FieldValue::Int(*i),
                AMQPValue::LongString(s) => {
                    FieldValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(s) => FieldValue::Str(s.as_str().to_string()),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(to_amqp_table(&properties.headers));
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(2);
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(expiration) = &properties.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.clone()));
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp.timestamp().max(0) as u64);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());
    MessageProperties {
        content_type: text(basic.content_type()),
        message_id: text(basic.message_id()),
        correlation_id: text(basic.correlation_id()),
        reply_to: text(basic.reply_to()),
        headers: basic.headers().as_ref().map(from_amqp_table).unwrap_or_default(),
        persistent: *basic.delivery_mode() == Some(2),
        priority: *basic.priority(),
        expiration: text(basic.expiration()),
        timestamp: (*basic.timestamp()).and_then(MessageProperties::timestamp_from_secs),
    }
}

fn to_delivery(delivery: LapinDelivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    }
}

fn to_lapin_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
    }
}

// Must run inside a tokio runtime: the executor binds to the current one.
fn connection_properties(params: &ConnectionParams) -> ConnectionProperties {
    let mut properties = ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current());
    if let Some(name) = params.connection_name() {
        properties = properties.with_connection_name(LongString::from(name.to_string()));
    }
    for (key, value) in params.client_properties() {
        properties.client_properties.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    properties
}

/// Opens connections with lapin on the current tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Link>, TransportError> {
        let connection = Connection::connect_uri(params.amqp_uri(), connection_properties(params))
            .await
            .map_err(|err| match map_error(err) {
                TransportError::ConnectionClosed(reason) => TransportError::ConnectionRefused(reason),
                other => other,
            })?;

        let (closed_tx, closed_rx) = watch::channel(None);
        connection.on_error(move |err| {
            error!(error = %err, "RabbitMQ connection error");
            closed_tx.send_replace(Some(err.to_string()));
        });

        info!(endpoint = %params.endpoint(), "lapin connection established");
        Ok(Arc::new(LapinLink {
            connection,
            closed: closed_rx,
        }))
    }
}

struct LapinLink {
    connection: Connection,
    closed: watch::Receiver<Option<String>>,
}

#[async_trait]
impl Link for LapinLink {
    async fn open_channel(&self) -> Result<Box<dyn ChannelLink>, TransportError> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;
        let (events, events_rx) = mpsc::unbounded();
        debug!(number = channel.id(), "lapin channel opened");
        Ok(Box::new(LapinChannel {
            channel,
            confirm: AtomicBool::new(false),
            next_tag: AtomicU64::new(0),
            events,
            events_rx: Mutex::new(Some(events_rx.boxed())),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        let reason = match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_string(),
        };
        reason
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await
            .map_err(map_error)
    }
}

struct LapinChannel {
    channel: lapin::Channel,
    confirm: AtomicBool,
    // lapin confirms each publish on its own future; tags are numbered here
    // the way the broker numbers them.
    next_tag: AtomicU64,
    events: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<EventStream>>,
}

#[async_trait]
impl ChannelLink for LapinChannel {
    fn number(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(&self, declaration: &ExchangeDeclaration) -> Result<(), TransportError> {
        let options = ExchangeDeclareOptions {
            durable: declaration.durable,
            auto_delete: declaration.auto_delete,
            internal: declaration.internal,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(
                &declaration.name,
                to_lapin_kind(&declaration.kind),
                options,
                to_amqp_table(&declaration.arguments),
            )
            .await
            .map_err(map_error)
    }

    async fn queue_declare(&self, declaration: &QueueDeclaration) -> Result<QueueInfo, TransportError> {
        let options = QueueDeclareOptions {
            durable: declaration.durable,
            exclusive: declaration.exclusive,
            auto_delete: declaration.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare(&declaration.name, options, to_amqp_table(&declaration.arguments))
            .await
            .map_err(map_error)?;
        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_bind(&self, binding: &Binding) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                to_amqp_table(&binding.arguments),
            )
            .await
            .map_err(map_error)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(map_error)
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_error)?;
        self.next_tag.store(0, Ordering::SeqCst);
        self.confirm.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_publish(&self, request: PublishRequest<'_>) -> Result<u64, TransportError> {
        let options = BasicPublishOptions {
            mandatory: request.mandatory,
            immediate: request.immediate,
        };
        let confirm = self
            .channel
            .basic_publish(
                request.exchange,
                request.routing_key,
                options,
                &request.message.body,
                to_basic_properties(&request.message.properties),
            )
            .await
            .map_err(map_error)?;

        if !self.confirm.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.events.clone();

        tokio::spawn(async move {
            let forwarded = match confirm.await {
                Ok(Confirmation::Ack(returned)) => {
                    if let Some(returned) = returned {
                        let _ = events.unbounded_send(ChannelEvent::Returned {
                            delivery_tag,
                            reply_code: returned.reply_code,
                            reply_text: returned.reply_text.as_str().to_string(),
                        });
                    }
                    events.unbounded_send(ChannelEvent::Ack {
                        delivery_tag,
                        multiple: false,
                    })
                }
                Ok(Confirmation::Nack(_)) => events.unbounded_send(ChannelEvent::Nack {
                    delivery_tag,
                    multiple: false,
                }),
                Ok(Confirmation::NotRequested) => Ok(()),
                Err(err) => events.unbounded_send(ChannelEvent::Closed {
                    reason: map_error(err).to_string(),
                }),
            };
            if forwarded.is_err() {
                trace!(delivery_tag, "Confirm arrived after the channel was dropped");
            }
        });
        Ok(delivery_tag)
    }

    async fn basic_consume(&self, queue: &str, no_ack: bool) -> Result<(String, DeliveryStream), TransportError> {
        let options = BasicConsumeOptions {
            no_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, "", options, AmqpTable::default())
            .await
            .map_err(map_error)?;
        let tag = consumer.tag().as_str().to_string();

        let stream = consumer
            .map(|delivery| delivery.map(to_delivery).map_err(map_error))
            .boxed();
        Ok((tag, stream))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_error)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.channel
            .basic_nack(delivery_tag, options)
            .await
            .map_err(map_error)
    }

    fn take_events(&self) -> Option<EventStream> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "Closing channel")
            .await
            .map_err(map_error)
    }
}
