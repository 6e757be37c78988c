// src/rabbitmq/topology.rs
// Desired-state store for exchanges, queues and bindings, replayed after recovery.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::message::{FieldTable, FieldValue};
use crate::rabbitmq::channel_manager::{Channel, ChannelPool};
use crate::rabbitmq::errors::DeclarationError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl ExchangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub arguments: FieldTable,
}

impl ExchangeDeclaration {
    pub fn new(name: &str, kind: ExchangeKind) -> Self {
        ExchangeDeclaration {
            name: name.to_string(),
            kind,
            durable: false,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn argument<V: Into<FieldValue>>(mut self, key: &str, value: V) -> Self {
        self.arguments.insert(key.to_string(), value.into());
        self
    }

    fn conflicts_with(&self, other: &ExchangeDeclaration) -> bool {
        self.kind != other.kind || self.durable != other.durable
    }

    fn describe(&self) -> String {
        format!("{} (durable={})", self.kind, self.durable)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDeclaration {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: FieldTable,
}

impl QueueDeclaration {
    pub fn new(name: &str) -> Self {
        QueueDeclaration {
            name: name.to_string(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            arguments: FieldTable::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn argument<V: Into<FieldValue>>(mut self, key: &str, value: V) -> Self {
        self.arguments.insert(key.to_string(), value.into());
        self
    }

    fn conflicts_with(&self, other: &QueueDeclaration) -> bool {
        self.durable != other.durable || self.exclusive != other.exclusive
    }

    fn describe(&self) -> String {
        format!("durable={}, exclusive={}", self.durable, self.exclusive)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    #[serde(default)]
    pub arguments: FieldTable,
}

impl Binding {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> Self {
        Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            arguments: FieldTable::new(),
        }
    }

    pub fn argument<V: Into<FieldValue>>(mut self, key: &str, value: V) -> Self {
        self.arguments.insert(key.to_string(), value.into());
        self
    }
}

/// Broker's answer to a queue declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Declaration {
    Exchange(ExchangeDeclaration),
    Queue(QueueDeclaration),
    Binding(Binding),
}

impl Declaration {
    fn same_entity(&self, other: &Declaration) -> bool {
        match (self, other) {
            (Declaration::Exchange(a), Declaration::Exchange(b)) => a.name == b.name,
            (Declaration::Queue(a), Declaration::Queue(b)) => a.name == b.name,
            (Declaration::Binding(a), Declaration::Binding(b)) => a == b,
            _ => false,
        }
    }

    async fn apply(&self, channel: &Channel) -> Result<(), DeclarationError> {
        match self {
            Declaration::Exchange(exchange) => channel
                .exchange_declare(exchange)
                .await
                .map_err(|e| DeclarationError::from_transport("exchange", &exchange.name, e)),
            Declaration::Queue(queue) => channel
                .queue_declare(queue)
                .await
                .map(|_| ())
                .map_err(|e| DeclarationError::from_transport("queue", &queue.name, e)),
            Declaration::Binding(binding) => channel
                .queue_bind(binding)
                .await
                .map_err(|e| DeclarationError::from_transport("binding", &binding.queue, e)),
        }
    }
}

/// Counts of what a replay re-issued.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub exchanges: usize,
    pub queues: usize,
    pub bindings: usize,
}

#[derive(Default)]
struct TopologyState {
    entries: Vec<Declaration>,
    queue_info: HashMap<String, QueueInfo>,
}

impl TopologyState {
    fn find(&self, declaration: &Declaration) -> Option<&Declaration> {
        self.entries.iter().find(|e| e.same_entity(declaration))
    }

    /// Last write wins, keeping the original position.
    fn store(&mut self, declaration: Declaration) {
        match self.entries.iter_mut().find(|e| e.same_entity(&declaration)) {
            Some(existing) => *existing = declaration,
            None => self.entries.push(declaration),
        }
    }
}

pub struct TopologyManager {
    pool: Arc<ChannelPool>,
    state: Mutex<TopologyState>,
    // Serializes check-declare-store so two callers cannot race on one name.
    declare_lock: tokio::sync::Mutex<()>,
}

impl TopologyManager {
    pub fn new(pool: Arc<ChannelPool>) -> Self {
        TopologyManager {
            pool,
            state: Mutex::new(TopologyState::default()),
            declare_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn declare_exchange(
        &self,
        declaration: ExchangeDeclaration,
    ) -> Result<ExchangeDeclaration, DeclarationError> {
        if declaration.name.is_empty() {
            return Err(DeclarationError::Invalid(
                "the default exchange cannot be declared".to_string(),
            ));
        }
        if let Some(known) = self.known_exchange(&declaration) {
            return known;
        }

        // Lease before locking: a replay holds the lock while the pool is
        // not ready yet.
        let channel = self.pool.acquire().await?;
        let _guard = self.declare_lock.lock().await;
        if let Some(known) = self.known_exchange(&declaration) {
            return known;
        }

        let wanted = Declaration::Exchange(declaration.clone());
        wanted.apply(&channel).await?;
        self.state.lock().store(wanted);

        info!(
            exchange = %declaration.name,
            kind = %declaration.kind,
            durable = declaration.durable,
            "Exchange declared"
        );
        Ok(declaration)
    }

    // Some(..) when the broker does not need to be asked.
    fn known_exchange(
        &self,
        declaration: &ExchangeDeclaration,
    ) -> Option<Result<ExchangeDeclaration, DeclarationError>> {
        let wanted = Declaration::Exchange(declaration.clone());
        let state = self.state.lock();
        let Some(Declaration::Exchange(existing)) = state.find(&wanted) else {
            return None;
        };
        if existing == declaration {
            debug!(exchange = %declaration.name, "Exchange already declared, skipping");
            return Some(Ok(declaration.clone()));
        }
        if existing.conflicts_with(declaration) {
            return Some(Err(DeclarationError::Conflict {
                kind: "exchange",
                name: declaration.name.clone(),
                existing: existing.describe(),
                requested: declaration.describe(),
            }));
        }
        None
    }

    pub async fn declare_queue(
        &self,
        declaration: QueueDeclaration,
    ) -> Result<QueueInfo, DeclarationError> {
        if declaration.name.is_empty() {
            return Err(DeclarationError::Invalid(
                "server-named queues cannot be recovered; supply a queue name".to_string(),
            ));
        }
        if let Some(known) = self.known_queue(&declaration) {
            return known;
        }

        let channel = self.pool.acquire().await?;
        let _guard = self.declare_lock.lock().await;
        if let Some(known) = self.known_queue(&declaration) {
            return known;
        }

        let info = channel
            .queue_declare(&declaration)
            .await
            .map_err(|e| DeclarationError::from_transport("queue", &declaration.name, e))?;

        {
            let mut state = self.state.lock();
            state.store(Declaration::Queue(declaration.clone()));
            state.queue_info.insert(declaration.name.clone(), info.clone());
        }

        info!(
            queue = %info.name,
            durable = declaration.durable,
            messages = info.message_count,
            "Queue declared"
        );
        Ok(info)
    }

    fn known_queue(&self, declaration: &QueueDeclaration) -> Option<Result<QueueInfo, DeclarationError>> {
        let wanted = Declaration::Queue(declaration.clone());
        let state = self.state.lock();
        let Some(Declaration::Queue(existing)) = state.find(&wanted) else {
            return None;
        };
        if existing == declaration {
            debug!(queue = %declaration.name, "Queue already declared, skipping");
            return state.queue_info.get(&declaration.name).cloned().map(Ok);
        }
        if existing.conflicts_with(declaration) {
            return Some(Err(DeclarationError::Conflict {
                kind: "queue",
                name: declaration.name.clone(),
                existing: existing.describe(),
                requested: declaration.describe(),
            }));
        }
        None
    }

    pub async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), DeclarationError> {
        self.bind_with(Binding::new(queue, exchange, routing_key)).await
    }

    pub async fn bind_with(&self, binding: Binding) -> Result<(), DeclarationError> {
        if binding.queue.is_empty() {
            return Err(DeclarationError::Invalid("binding needs a queue name".to_string()));
        }
        let wanted = Declaration::Binding(binding.clone());
        if self.is_known(&wanted) {
            return Ok(());
        }

        let channel = self.pool.acquire().await?;
        let _guard = self.declare_lock.lock().await;
        if self.is_known(&wanted) {
            return Ok(());
        }
        wanted.apply(&channel).await?;
        self.state.lock().store(wanted);

        info!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            "Queue bound"
        );
        Ok(())
    }

    fn is_known(&self, declaration: &Declaration) -> bool {
        let known = self.state.lock().find(declaration).is_some();
        if known {
            debug!(declaration = ?declaration, "Binding already exists, skipping");
        }
        known
    }

    /// Re-issues every stored declaration on `channel`, in insertion order.
    pub async fn replay_all(&self, channel: &Channel) -> Result<ReplayReport, DeclarationError> {
        let _guard = self.declare_lock.lock().await;
        let entries = self.snapshot();
        let mut report = ReplayReport::default();

        for entry in &entries {
            if let Err(err) = entry.apply(channel).await {
                warn!(channel_id = %channel.id(), error = %err, "Topology replay interrupted");
                return Err(err);
            }
            match entry {
                Declaration::Exchange(_) => report.exchanges += 1,
                Declaration::Queue(_) => report.queues += 1,
                Declaration::Binding(_) => report.bindings += 1,
            }
        }

        info!(
            channel_id = %channel.id(),
            exchanges = report.exchanges,
            queues = report.queues,
            bindings = report.bindings,
            "Topology replayed"
        );
        Ok(report)
    }

    /// Declarations in the order they were first made.
    pub fn snapshot(&self) -> Vec<Declaration> {
        self.state.lock().entries.clone()
    }
}
