// src/rabbitmq/memory.rs
// In-process broker used by tests and local runs. Speaks the transport traits
// directly; no sockets, no persistence.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::ConnectionParams;
use crate::message::{Delivery, MessageProperties};
use crate::rabbitmq::errors::{
    TransportError, ACCESS_REFUSED, NOT_FOUND, PRECONDITION_FAILED, RESOURCE_LOCKED,
};
use crate::rabbitmq::topology::{
    Binding, ExchangeDeclaration, ExchangeKind, QueueDeclaration, QueueInfo,
};
use crate::rabbitmq::transport::{
    ChannelEvent, ChannelLink, Connector, DeliveryStream, EventStream, Link, PublishRequest,
};

const NO_ROUTE: u16 = 312;
const NO_CONSUMERS: u16 = 313;
const FORCED_CLOSE: &str = "CONNECTION_FORCED - broker forced connection closure";

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            redelivered: self.redelivered,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            body: self.body.clone(),
            properties: self.properties.clone(),
        }
    }
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ConnectionEntry {
    closed: watch::Sender<Option<String>>,
    next_channel_number: u16,
}

struct ChannelEntry {
    connection: u64,
    confirm: bool,
    next_publish_tag: u64,
    prefetch: u16,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

struct ConsumerEntry {
    tag: String,
    channel: u64,
    no_ack: bool,
    deliveries: mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

struct QueueEntry {
    declaration: QueueDeclaration,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
}

struct BrokerState {
    available: bool,
    nack_publishes: bool,
    withhold_confirms: bool,
    connect_attempts: usize,
    next_id: u64,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    exchanges: BTreeMap<String, ExchangeDeclaration>,
    queues: BTreeMap<String, QueueEntry>,
    bindings: Vec<Binding>,
}

impl BrokerState {
    fn new() -> Self {
        let mut exchanges = BTreeMap::new();
        for (name, kind) in [
            ("", ExchangeKind::Direct),
            ("amq.direct", ExchangeKind::Direct),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.topic", ExchangeKind::Topic),
        ] {
            exchanges.insert(name.to_string(), ExchangeDeclaration::new(name, kind).durable(true));
        }

        BrokerState {
            available: true,
            nack_publishes: false,
            withhold_confirms: false,
            connect_attempts: 0,
            next_id: 0,
            connections: HashMap::new(),
            channels: HashMap::new(),
            exchanges,
            queues: BTreeMap::new(),
            bindings: Vec::new(),
        }
    }

    fn kill_connections(&mut self) {
        let ids: Vec<u64> = self.connections.keys().copied().collect();
        debug!(count = ids.len(), "Memory broker killing connections");
        for id in ids {
            self.close_connection(id, FORCED_CLOSE);
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self, connection: u64, key: u64) -> Result<(), TransportError> {
        if !self.connections.contains_key(&connection) {
            return Err(TransportError::ConnectionClosed("connection is closed".to_string()));
        }
        if !self.channels.contains_key(&key) {
            return Err(TransportError::ChannelClosed("channel is closed".to_string()));
        }
        Ok(())
    }

    fn channel_mut(&mut self, key: u64) -> Result<&mut ChannelEntry, TransportError> {
        self.channels
            .get_mut(&key)
            .ok_or_else(|| TransportError::ChannelClosed("channel is closed".to_string()))
    }

    /// Channel exception: closes the channel and reports the reply code.
    fn raise(&mut self, key: u64, code: u16, text: String) -> TransportError {
        debug!(code, text = %text, "Memory broker closing channel");
        self.close_channel(key, Some(text.clone()));
        TransportError::Refused { code, text }
    }

    fn close_channel(&mut self, key: u64, reason: Option<String>) {
        let Some(entry) = self.channels.remove(&key) else {
            return;
        };

        let mut touched = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != key);
            if queue.consumers.len() != before {
                touched.push(name.clone());
            }
        }
        // Newest first so the original order is restored at the head.
        for (_, unacked) in entry.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.messages.push_front(message);
                touched.push(unacked.queue);
            }
        }
        if let Some(reason) = reason {
            let _ = entry.events.unbounded_send(ChannelEvent::Closed { reason });
        }

        touched.sort();
        touched.dedup();
        for name in touched {
            self.dispatch(&name);
        }
    }

    fn close_connection(&mut self, id: u64, reason: &str) {
        let Some(connection) = self.connections.remove(&id) else {
            return;
        };
        let keys: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == id)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.close_channel(key, Some(reason.to_string()));
        }

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.delete_queue(&name);
        }
        connection.closed.send_replace(Some(reason.to_string()));
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }
        let Some(declaration) = self.exchanges.get(exchange) else {
            return Vec::new();
        };

        let mut routes: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match &declaration.kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                ExchangeKind::Headers | ExchangeKind::Custom(_) => false,
            })
            .map(|b| b.queue.clone())
            .collect();
        routes.sort();
        routes.dedup();
        routes
    }

    /// Hands ready messages to consumers round-robin, honouring prefetch.
    fn dispatch(&mut self, name: &str) {
        let BrokerState { queues, channels, .. } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        while !queue.messages.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&index| {
                    let consumer = &queue.consumers[index];
                    channels.get(&consumer.channel).is_some_and(|channel| {
                        consumer.no_ack
                            || channel.prefetch == 0
                            || channel.unacked.len() < usize::from(channel.prefetch)
                    })
                });
            let Some(index) = chosen else {
                break;
            };
            queue.cursor = index + 1;

            let Some(message) = queue.messages.pop_front() else {
                break;
            };
            let channel_key = queue.consumers[index].channel;
            let no_ack = queue.consumers[index].no_ack;
            let Some(channel) = channels.get_mut(&channel_key) else {
                queue.messages.push_front(message);
                break;
            };
            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;

            let sent = queue.consumers[index]
                .deliveries
                .unbounded_send(Ok(message.to_delivery(delivery_tag)))
                .is_ok();
            if !sent {
                queue.messages.push_front(message);
                queue.consumers.remove(index);
                continue;
            }
            trace!(queue = %name, delivery_tag, "Memory broker delivered message");
            if !no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: name.to_string(),
                        message,
                    },
                );
            }
        }
    }
}

/// `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Broker double. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    /// Drops every open connection as a network failure would.
    pub fn kill_connections(&self) {
        self.state.lock().kill_connections();
    }

    /// Kills connections and forgets everything that is not durable.
    pub fn restart(&self) {
        let mut state = self.state.lock();
        state.kill_connections();
        state.exchanges.retain(|_, e| e.durable);
        let transient: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| !q.declaration.durable)
            .map(|(name, _)| name.clone())
            .collect();
        for name in transient {
            state.delete_queue(&name);
        }
        for queue in state.queues.values_mut() {
            queue.messages.retain(|m| m.properties.persistent);
        }
        let BrokerState { bindings, exchanges, .. } = &mut *state;
        bindings.retain(|b| exchanges.contains_key(&b.exchange));
    }

    /// While unavailable every connection attempt is refused.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn nack_publishes(&self, nack: bool) {
        self.state.lock().nack_publishes = nack;
    }

    /// Stops sending publisher confirms.
    pub fn withhold_confirms(&self, withhold: bool) {
        self.state.lock().withhold_confirms = withhold;
    }

    /// Closes every channel consuming from `queue` with a channel error,
    /// leaving the connection up.
    pub fn close_consumer_channels(&self, queue: &str) {
        let mut state = self.state.lock();
        let mut keys: Vec<u64> = state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.channel).collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys.dedup();
        for key in keys {
            state.close_channel(key, Some("CHANNEL_ERROR - forced by test".to_string()));
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.state.lock().bindings.clone()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages ready for delivery.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Delivered but not yet acknowledged messages of `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn Link>, TransportError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if !state.available {
            return Err(TransportError::ConnectionRefused(format!(
                "{} is not reachable",
                params.endpoint()
            )));
        }

        let id = state.next_id();
        let (closed, closed_rx) = watch::channel(None);
        state.connections.insert(
            id,
            ConnectionEntry {
                closed,
                next_channel_number: 0,
            },
        );
        debug!(connection = id, "Memory broker accepted connection");

        Ok(Arc::new(MemoryLink {
            broker: self.clone(),
            id,
            closed: closed_rx,
        }))
    }
}

struct MemoryLink {
    broker: MemoryBroker,
    id: u64,
    closed: watch::Receiver<Option<String>>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn open_channel(&self) -> Result<Box<dyn ChannelLink>, TransportError> {
        let mut state = self.broker.state.lock();
        let Some(connection) = state.connections.get_mut(&self.id) else {
            return Err(TransportError::ConnectionClosed("connection is closed".to_string()));
        };
        connection.next_channel_number += 1;
        let number = connection.next_channel_number;

        let key = state.next_id();
        let (events, events_rx) = mpsc::unbounded();
        state.channels.insert(
            key,
            ChannelEntry {
                connection: self.id,
                confirm: false,
                next_publish_tag: 0,
                prefetch: 0,
                next_delivery_tag: 0,
                unacked: BTreeMap::new(),
                events,
            },
        );

        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
            key,
            number,
            events: Mutex::new(Some(events_rx.boxed())),
        }))
    }

    fn is_connected(&self) -> bool {
        self.broker.state.lock().connections.contains_key(&self.id)
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
        self.broker
            .state
            .lock()
            .close_connection(self.id, "closed by client");
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
    key: u64,
    number: u16,
    events: Mutex<Option<EventStream>>,
}

#[async_trait]
impl ChannelLink for MemoryChannel {
    fn number(&self) -> u16 {
        self.number
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().check(self.connection, self.key).is_ok()
    }

    async fn exchange_declare(&self, declaration: &ExchangeDeclaration) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.check(self.connection, self.key)?;

        match state.exchanges.get(&declaration.name) {
            Some(existing) => {
                if existing.kind != declaration.kind
                    || existing.durable != declaration.durable
                    || existing.auto_delete != declaration.auto_delete
                    || existing.internal != declaration.internal
                {
                    let text = format!(
                        "PRECONDITION_FAILED - inequivalent arg for exchange '{}' in vhost '/'",
                        declaration.name
                    );
                    return Err(state.raise(self.key, PRECONDITION_FAILED, text));
                }
            }
            None if declaration.name.starts_with("amq.") => {
                let text = format!(
                    "ACCESS_REFUSED - exchange name '{}' contains reserved prefix 'amq.*'",
                    declaration.name
                );
                return Err(state.raise(self.key, ACCESS_REFUSED, text));
            }
            None => {
                state
                    .exchanges
                    .insert(declaration.name.clone(), declaration.clone());
            }
        }
        Ok(())
    }

    async fn queue_declare(&self, declaration: &QueueDeclaration) -> Result<QueueInfo, TransportError> {
        let mut state = self.broker.state.lock();
        state.check(self.connection, self.key)?;

        let name = if declaration.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            declaration.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != self.connection) {
                let text = format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    name
                );
                return Err(state.raise(self.key, RESOURCE_LOCKED, text));
            }
            let current = &existing.declaration;
            if current.durable != declaration.durable
                || current.exclusive != declaration.exclusive
                || current.auto_delete != declaration.auto_delete
            {
                let text = format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}' in vhost '/'",
                    name
                );
                return Err(state.raise(self.key, PRECONDITION_FAILED, text));
            }
        } else {
            let mut stored = declaration.clone();
            stored.name = name.clone();
            state.queues.insert(
                name.clone(),
                QueueEntry {
                    declaration: stored,
                    owner: declaration.exclusive.then_some(self.connection),
                    messages: VecDeque::new(),
                    consumers: Vec::new(),
                    cursor: 0,
                },
            );
        }

        let queue = &state.queues[&name];
        Ok(QueueInfo {
            name: name.clone(),
            message_count: queue.messages.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn queue_bind(&self, binding: &Binding) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.check(self.connection, self.key)?;

        if !state.queues.contains_key(&binding.queue) {
            let text = format!("NOT_FOUND - no queue '{}' in vhost '/'", binding.queue);
            return Err(state.raise(self.key, NOT_FOUND, text));
        }
        if binding.exchange.is_empty() {
            let text = "ACCESS_REFUSED - operation not permitted on the default exchange".to_string();
            return Err(state.raise(self.key, ACCESS_REFUSED, text));
        }
        if !state.exchanges.contains_key(&binding.exchange) {
            let text = format!("NOT_FOUND - no exchange '{}' in vhost '/'", binding.exchange);
            return Err(state.raise(self.key, NOT_FOUND, text));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.check(self.connection, self.key)?;
        state.channel_mut(self.key)?.prefetch = prefetch_count;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.check(self.connection, self.key)?;
        let channel = state.channel_mut(self.key)?;
        channel.confirm = true;
        channel.next_publish_tag = 0;
        Ok(())
    }

    async fn basic_publish(&self, request: PublishRequest<'_>) -> Result<u64, TransportError> {
        let mut state = self.broker.state.lock();
        state.check(self.connection, self.key)?;

        if !state.exchanges.contains_key(request.exchange) {
            let text = format!("NOT_FOUND - no exchange '{}' in vhost '/'", request.exchange);
            return Err(state.raise(self.key, NOT_FOUND, text));
        }
        let routes = state.route(request.exchange, request.routing_key);
        let has_consumers = routes
            .iter()
            .any(|q| state.queues.get(q).is_some_and(|q| !q.consumers.is_empty()));
        let nack = state.nack_publishes;
        let withhold = state.withhold_confirms;

        let channel = state.channel_mut(self.key)?;
        let delivery_tag = if channel.confirm {
            channel.next_publish_tag += 1;
            channel.next_publish_tag
        } else {
            0
        };
        let events = channel.events.clone();

        let returned = if request.mandatory && routes.is_empty() {
            Some((NO_ROUTE, "NO_ROUTE"))
        } else if request.immediate && !has_consumers {
            Some((NO_CONSUMERS, "NO_CONSUMERS"))
        } else {
            None
        };

        match returned {
            Some((reply_code, reply_text)) if delivery_tag > 0 => {
                let _ = events.unbounded_send(ChannelEvent::Returned {
                    delivery_tag,
                    reply_code,
                    reply_text: reply_text.to_string(),
                });
            }
            Some(_) => {}
            None if nack => {}
            None => {
                let message = StoredMessage {
                    exchange: request.exchange.to_string(),
                    routing_key: request.routing_key.to_string(),
                    body: request.message.body.clone(),
                    properties: request.message.properties.clone(),
                    redelivered: false,
                };
                for queue in &routes {
                    if let Some(entry) = state.queues.get_mut(queue) {
                        entry.messages.push_back(message.clone());
                    }
                }
                for queue in &routes {
                    state.dispatch(queue);
                }
            }
        }

        if delivery_tag > 0 && !withhold {
            let event = if nack {
                ChannelEvent::Nack { delivery_tag, multiple: false }
            } else {
                ChannelEvent::Ack { delivery_tag, multiple: false }
            };
            let _ = events.unbounded_send(event);
        }
        Ok(delivery_tag)
    }

    async fn basic_consume(&self, queue: &str, no_ack: bool) -> Result<(String, DeliveryStream), TransportError> {
        let mut state = self.broker.state.lock();
        state.check(self.connection, self.key)?;

        let owner = match state.queues.get(queue) {
            Some(entry) => entry.owner,
            None => {
                let text = format!("NOT_FOUND - no queue '{}' in vhost '/'", queue);
                return Err(state.raise(self.key, NOT_FOUND, text));
            }
        };
        if owner.is_some_and(|owner| owner != self.connection) {
            let text = format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                queue
            );
            return Err(state.raise(self.key, RESOURCE_LOCKED, text));
        }

        let tag = format!("amq.ctag-{}", Uuid::new_v4().simple());
        let (deliveries, stream) = mpsc::unbounded();
        if let Some(entry) = state.queues.get_mut(queue) {
            entry.consumers.push(ConsumerEntry {
                tag: tag.clone(),
                channel: self.key,
                no_ack,
                deliveries,
            });
        }
        state.dispatch(queue);
        Ok((tag, stream.boxed()))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.check(self.connection, self.key)?;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.tag == consumer_tag && c.channel == self.key));
        }
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.check(self.connection, self.key)?;
        let removed = state.channel_mut(self.key)?.unacked.remove(&delivery_tag);
        match removed {
            Some(unacked) => {
                state.dispatch(&unacked.queue);
                Ok(())
            }
            None => {
                let text = format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag);
                Err(state.raise(self.key, PRECONDITION_FAILED, text))
            }
        }
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.check(self.connection, self.key)?;
        let removed = state.channel_mut(self.key)?.unacked.remove(&delivery_tag);
        let Some(unacked) = removed else {
            let text = format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag);
            return Err(state.raise(self.key, PRECONDITION_FAILED, text));
        };

        if requeue {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
        state.dispatch(&unacked.queue);
        Ok(())
    }

    fn take_events(&self) -> Option<EventStream> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state.lock().close_channel(self.key, None);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.broker.state.lock().close_channel(self.key, None);
    }
}
