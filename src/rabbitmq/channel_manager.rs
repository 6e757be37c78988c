use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rabbitmq::confirms::{ConfirmOutcome, ConfirmTracker};
use crate::rabbitmq::connection::{Session, SessionEvent, SessionState};
use crate::rabbitmq::errors::{ChannelError, PublishError, TransportError};
use crate::rabbitmq::topology::{Binding, ExchangeDeclaration, QueueDeclaration, QueueInfo};
use crate::rabbitmq::transport::{ChannelEvent, ChannelLink, DeliveryStream, PublishRequest};

// Pause before retrying a channel open that raced a dying connection.
const REOPEN_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration options for the channels handed out by the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Default prefetch for consumer channels (0 means unlimited)
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,

    /// Whether operation channels start in publisher confirm mode. Publishes
    /// that wait for a confirm switch their channel over regardless.
    #[serde(default = "default_confirm_mode")]
    pub confirm_mode: bool,

    /// How long `acquire` may wait for the session to come back
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Healthy channels kept around for reuse
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
}

fn default_prefetch() -> u16 { 10 }
fn default_confirm_mode() -> bool { true }
fn default_acquire_timeout() -> u64 { 30000 }
fn default_max_idle() -> usize { 8 }

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: default_prefetch(),
            confirm_mode: default_confirm_mode(),
            acquire_timeout_ms: default_acquire_timeout(),
            max_idle: default_max_idle(),
        }
    }
}

impl ChannelConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
    Errored,
}

/// Handle on a publish that reached the broker.
pub struct PublishTicket {
    pub delivery_tag: Option<u64>,
    pub confirm: Option<oneshot::Receiver<ConfirmOutcome>>,
}

/// One logical channel. Every write goes through an async lock, so at most
/// one frame-write is in flight per channel.
pub struct Channel {
    id: String,
    epoch: u64,
    link: Box<dyn ChannelLink>,
    state: Mutex<ChannelState>,
    confirm_mode: AtomicBool,
    write: tokio::sync::Mutex<()>,
    confirms: Arc<ConfirmTracker>,
}

impl Channel {
    fn new(link: Box<dyn ChannelLink>, epoch: u64) -> Arc<Self> {
        let channel = Arc::new(Channel {
            id: format!("channel-{}", &Uuid::new_v4().simple().to_string()[..8]),
            epoch,
            link,
            state: Mutex::new(ChannelState::Open),
            confirm_mode: AtomicBool::new(false),
            write: tokio::sync::Mutex::new(()),
            confirms: Arc::new(ConfirmTracker::default()),
        });
        channel.spawn_event_pump();
        channel
    }

    fn spawn_event_pump(self: &Arc<Self>) {
        let Some(mut events) = self.link.take_events() else {
            return;
        };
        let confirms = self.confirms.clone();
        let channel = Arc::downgrade(self);
        let channel_id = self.id.clone();

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let ChannelEvent::Closed { reason } = &event {
                    if let Some(channel) = channel.upgrade() {
                        channel.mark_errored(reason);
                    }
                }
                confirms.handle(&event);
            }
            debug!(channel_id = %channel_id, "Channel event stream ended");
            confirms.fail_all(ConfirmOutcome::Lost(format!(
                "event stream of {} ended",
                channel_id
            )));
        });
    }

    /// Return the channel ID for logging
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn number(&self) -> u16 {
        self.link.number()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Check if the channel is in a healthy state
    pub fn is_healthy(&self) -> bool {
        self.state() == ChannelState::Open && self.link.is_open()
    }

    pub fn confirm_mode(&self) -> bool {
        self.confirm_mode.load(Ordering::SeqCst)
    }

    pub fn pending_confirms(&self) -> usize {
        self.confirms.pending()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn mark_errored(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ChannelState::Open | ChannelState::Closing) {
                debug!(channel_id = %self.id, reason, "Channel errored");
                *state = ChannelState::Errored;
            }
        }
        self.confirms.fail_all(ConfirmOutcome::Lost(reason.to_string()));
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        match self.state() {
            ChannelState::Open => Ok(()),
            state => Err(TransportError::ChannelClosed(format!(
                "{} is {:?}",
                self.id, state
            ))),
        }
    }

    async fn write<'a, T, F, Fut>(&'a self, op: F) -> Result<T, TransportError>
    where
        F: FnOnce(&'a dyn ChannelLink) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let _write = self.write.lock().await;
        self.ensure_open()?;
        let result = op(self.link.as_ref()).await;
        // Any AMQP channel exception closes the channel on the broker side.
        if let Err(err) = &result {
            self.mark_errored(&err.to_string());
        }
        result
    }

    pub async fn exchange_declare(&self, declaration: &ExchangeDeclaration) -> Result<(), TransportError> {
        self.write(|link| link.exchange_declare(declaration)).await
    }

    pub async fn queue_declare(&self, declaration: &QueueDeclaration) -> Result<QueueInfo, TransportError> {
        self.write(|link| link.queue_declare(declaration)).await
    }

    pub async fn queue_bind(&self, binding: &Binding) -> Result<(), TransportError> {
        self.write(|link| link.queue_bind(binding)).await
    }

    pub async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        debug!(channel_id = %self.id, prefetch = prefetch_count, "Setting channel QoS");
        self.write(|link| link.basic_qos(prefetch_count)).await
    }

    pub async fn enable_confirms(&self) -> Result<(), TransportError> {
        if self.confirm_mode() {
            return Ok(());
        }
        debug!(channel_id = %self.id, "Enabling confirm mode");
        self.write(|link| link.confirm_select()).await?;
        self.confirm_mode.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn basic_consume(&self, queue: &str, no_ack: bool) -> Result<(String, DeliveryStream), TransportError> {
        self.write(|link| link.basic_consume(queue, no_ack)).await
    }

    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.write(|link| link.basic_cancel(consumer_tag)).await
    }

    pub async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.write(|link| link.basic_ack(delivery_tag)).await
    }

    pub async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.write(|link| link.basic_nack(delivery_tag, requeue)).await
    }

    /// Sends a message. In confirm mode the delivery tag is reserved under the
    /// write lock so it matches the broker's numbering.
    pub(crate) async fn publish(&self, request: PublishRequest<'_>, wait: bool) -> Result<PublishTicket, PublishError> {
        let _write = self.write.lock().await;
        self.ensure_open()?;

        if !self.confirm_mode() {
            if let Err(err) = self.link.basic_publish(request).await {
                self.mark_errored(&err.to_string());
                return Err(err.into());
            }
            return Ok(PublishTicket {
                delivery_tag: None,
                confirm: None,
            });
        }

        let (delivery_tag, confirm) = self.confirms.reserve(wait).map_err(|outcome| match outcome {
            ConfirmOutcome::Closed => PublishError::Closed,
            ConfirmOutcome::Lost(reason) => PublishError::ChannelLost(reason),
            other => PublishError::ChannelLost(format!("{:?}", other)),
        })?;

        match self.link.basic_publish(request).await {
            Ok(sent) => {
                if sent != delivery_tag {
                    warn!(
                        channel_id = %self.id,
                        expected = delivery_tag,
                        actual = sent,
                        "Broker delivery tag out of step with local numbering"
                    );
                }
                Ok(PublishTicket {
                    delivery_tag: Some(delivery_tag),
                    confirm,
                })
            }
            Err(err) => {
                self.confirms.abandon(delivery_tag);
                self.mark_errored(&err.to_string());
                Err(err.into())
            }
        }
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        let _write = self.write.lock().await;
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Open {
                *state = ChannelState::Closed;
                return Ok(());
            }
            *state = ChannelState::Closing;
        }
        self.confirms.fail_all(ConfirmOutcome::Closed);
        let result = self.link.close().await;
        *self.state.lock() = ChannelState::Closed;
        debug!(channel_id = %self.id, "Channel closed");
        result
    }
}

enum ChannelRole {
    Operation,
    Consumer { prefetch: u16 },
}

#[derive(Default)]
struct PoolInner {
    idle: Vec<Arc<Channel>>,
    leased: HashMap<String, Weak<Channel>>,
    consumers: HashMap<String, Weak<Channel>>,
    epoch: u64,
    closed: bool,
    created: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub consumers: usize,
    pub created: u64,
    pub epoch: u64,
}

/// Hands out channels on the session's connection, lazily creating them and
/// recreating them after a loss.
pub struct ChannelPool {
    session: Session,
    config: ChannelConfig,
    inner: Mutex<PoolInner>,
    // Closed from a connection loss until the pool is usable again.
    ready: watch::Sender<bool>,
    hold_until_replayed: AtomicBool,
}

impl ChannelPool {
    pub fn new(session: Session, config: ChannelConfig) -> Arc<Self> {
        debug!(
            prefetch = %config.prefetch_count,
            confirm = %config.confirm_mode,
            "Creating channel pool"
        );
        let (ready, _) = watch::channel(true);
        let pool = Arc::new(ChannelPool {
            session: session.clone(),
            config,
            inner: Mutex::new(PoolInner::default()),
            ready,
            hold_until_replayed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&pool);
        session.on_state_change(move |event| {
            if let Some(pool) = weak.upgrade() {
                pool.handle_session_event(event);
            }
        });
        pool
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn handle_session_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Disconnected { reason } => self.invalidate(reason, true),
            SessionEvent::Recovered { .. } if !self.hold_until_replayed.load(Ordering::SeqCst) => {
                self.ready.send_replace(true);
            }
            SessionEvent::RecoveryFailed { .. } => {
                self.invalidate("session recovery failed", false);
                // Waiters move on and fail on the session instead.
                self.ready.send_replace(true);
            }
            _ => {}
        }
    }

    /// After a recovery, keep `acquire` suspended until `mark_ready` is
    /// called, e.g. once the topology has been replayed.
    pub fn hold_until_replayed(&self) {
        self.hold_until_replayed.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Connection generation, bumped on every loss.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Lets `acquire` hand out channels again. Refused when the connection
    /// was lost after `epoch` was read, or is down right now.
    pub fn mark_ready(&self, epoch: u64) -> bool {
        let inner = self.inner.lock();
        if inner.closed || inner.epoch != epoch || self.session.state() != SessionState::Connected {
            debug!(epoch, current = inner.epoch, "Channel pool not marked ready");
            return false;
        }
        self.ready.send_replace(true);
        true
    }

    /// Get a channel for the scope of one operation, creating one if needed.
    /// Suspends while the session is recovering and until the pool is ready.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledChannel, ChannelError> {
        self.lease(true).await
    }

    /// Like `acquire` but does not wait for `mark_ready`. Meant for
    /// restoring the topology on a fresh connection.
    pub async fn acquire_for_replay(self: &Arc<Self>) -> Result<PooledChannel, ChannelError> {
        self.lease(false).await
    }

    async fn lease(self: &Arc<Self>, gated: bool) -> Result<PooledChannel, ChannelError> {
        let channel = self.with_timeout(self.checkout(gated)).await?;
        Ok(PooledChannel {
            channel,
            pool: Arc::downgrade(self),
        })
    }

    /// Returns a channel to the pool. Dropping the handle does the same.
    pub fn release(&self, channel: PooledChannel) {
        drop(channel);
    }

    /// A dedicated channel for a long-lived consumer, tracked so it can be
    /// invalidated on connection loss.
    pub async fn acquire_consumer_channel(&self, prefetch: u16) -> Result<Arc<Channel>, ChannelError> {
        self.with_timeout(async {
            self.wait_ready().await?;
            self.open_channel(ChannelRole::Consumer { prefetch }, true).await
        })
        .await
    }

    pub async fn release_consumer_channel(&self, channel: &Arc<Channel>) {
        self.inner.lock().consumers.remove(channel.id());
        if let Err(err) = channel.close().await {
            debug!(channel_id = %channel.id(), error = %err, "Consumer channel was already gone");
        }
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, ChannelError>
    where
        F: Future<Output = Result<T, ChannelError>>,
    {
        let timeout = self.config.acquire_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| ChannelError::AcquireTimeout(timeout))?
    }

    async fn wait_ready(&self) -> Result<(), ChannelError> {
        let mut ready = self.ready.subscribe();
        loop {
            if self.inner.lock().closed {
                return Err(ChannelError::Closed);
            }
            if *ready.borrow_and_update() {
                return Ok(());
            }
            if ready.changed().await.is_err() {
                return Err(ChannelError::Closed);
            }
        }
    }

    async fn checkout(&self, gated: bool) -> Result<Arc<Channel>, ChannelError> {
        if gated {
            self.wait_ready().await?;
        }
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(ChannelError::Closed);
            }
            while let Some(channel) = inner.idle.pop() {
                if channel.is_healthy() && channel.epoch() == inner.epoch {
                    inner
                        .leased
                        .insert(channel.id().to_string(), Arc::downgrade(&channel));
                    return Ok(channel);
                }
                debug!(channel_id = %channel.id(), "Discarding stale idle channel");
            }
        }
        self.open_channel(ChannelRole::Operation, gated).await
    }

    async fn open_channel(&self, role: ChannelRole, gated: bool) -> Result<Arc<Channel>, ChannelError> {
        loop {
            let link = self.session.wait_connected().await?;
            // The connection may have dropped and come back since the gate
            // was checked.
            if gated && !self.is_ready() {
                self.wait_ready().await?;
                continue;
            }
            let epoch = {
                let inner = self.inner.lock();
                if inner.closed {
                    return Err(ChannelError::Closed);
                }
                inner.epoch
            };

            let raw = match link.open_channel().await {
                Ok(raw) => raw,
                Err(err) if err.is_connection_loss() => {
                    debug!(error = %err, "Connection went away while opening a channel");
                    tokio::time::sleep(REOPEN_BACKOFF).await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let channel = Channel::new(raw, epoch);

            let configured = match role {
                ChannelRole::Operation if self.config.confirm_mode => channel.enable_confirms().await,
                ChannelRole::Consumer { prefetch } if prefetch > 0 => channel.basic_qos(prefetch).await,
                _ => Ok(()),
            };
            match configured {
                Ok(()) => {}
                Err(err) if err.is_connection_loss() => {
                    tokio::time::sleep(REOPEN_BACKOFF).await;
                    continue;
                }
                Err(err) => {
                    return Err(ChannelError::Lost(format!(
                        "Failed to configure channel: {}",
                        err
                    )))
                }
            }

            let registered = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    Err(ChannelError::Closed)
                } else if inner.epoch != epoch {
                    Ok(false)
                } else {
                    inner.created += 1;
                    let tracking = match role {
                        ChannelRole::Operation => &mut inner.leased,
                        ChannelRole::Consumer { .. } => &mut inner.consumers,
                    };
                    tracking.insert(channel.id().to_string(), Arc::downgrade(&channel));
                    Ok(true)
                }
            };
            match registered {
                Ok(true) => {
                    info!(
                        channel_id = %channel.id(),
                        number = channel.number(),
                        confirm = channel.confirm_mode(),
                        "Channel created and configured successfully"
                    );
                    return Ok(channel);
                }
                Ok(false) => {
                    channel.mark_errored("connection lost while the channel was opening");
                    continue;
                }
                Err(err) => {
                    let _ = channel.close().await;
                    return Err(err);
                }
            }
        }
    }

    fn give_back(&self, channel: Arc<Channel>) {
        let mut inner = self.inner.lock();
        inner.leased.remove(channel.id());
        if inner.closed || !channel.is_healthy() || channel.epoch() != inner.epoch {
            debug!(channel_id = %channel.id(), "Dropping released channel");
            return;
        }
        if inner.idle.len() >= self.config.max_idle {
            drop(inner);
            close_when_drained(channel);
            return;
        }
        inner.idle.push(channel);
    }

    /// Marks every channel errored, failing their pending publishes. Channels
    /// are recreated on the next `acquire`.
    pub fn invalidate_all(&self, reason: &str) {
        self.invalidate(reason, false)
    }

    fn invalidate(&self, reason: &str, suspend: bool) {
        let (channels, epoch) = {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            if suspend {
                self.ready.send_replace(false);
            }
            let mut channels: Vec<Arc<Channel>> = inner.idle.drain(..).collect();
            channels.extend(inner.leased.drain().filter_map(|(_, c)| c.upgrade()));
            channels.extend(inner.consumers.drain().filter_map(|(_, c)| c.upgrade()));
            (channels, inner.epoch)
        };

        warn!(epoch, count = channels.len(), reason, "Invalidating channels");
        for channel in channels {
            channel.mark_errored(reason);
        }
    }

    /// Fails every pending publish with `Closed` and closes all channels.
    pub async fn close(&self) {
        let channels = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            self.ready.send_replace(true);
            let mut channels: Vec<Arc<Channel>> = inner.idle.drain(..).collect();
            channels.extend(inner.leased.drain().filter_map(|(_, c)| c.upgrade()));
            channels.extend(inner.consumers.drain().filter_map(|(_, c)| c.upgrade()));
            channels
        };

        for channel in &channels {
            channel.confirms.fail_all(ConfirmOutcome::Closed);
        }
        for channel in channels {
            if let Err(err) = channel.close().await {
                debug!(channel_id = %channel.id(), error = %err, "Ignoring close failure");
            }
        }
        info!("Channel pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            idle: inner.idle.len(),
            leased: inner.leased.len(),
            consumers: inner.consumers.len(),
            created: inner.created,
            epoch: inner.epoch,
        }
    }
}

// Over the idle cap: close once every publish on it has its confirm.
fn close_when_drained(channel: Arc<Channel>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            channel.confirms.wait_drained().await;
            let _ = channel.close().await;
        });
    }
}

/// A channel leased from the pool for one operation.
pub struct PooledChannel {
    channel: Arc<Channel>,
    pool: Weak<ChannelPool>,
}

impl Deref for PooledChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(self.channel.clone());
        }
    }
}
