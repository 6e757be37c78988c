use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::message::Delivery;
use crate::rabbitmq::channel_manager::{Channel, ChannelPool};
use crate::rabbitmq::connection::{Session, SessionEvent};
use crate::rabbitmq::errors::{ChannelError, HandlerError, SubscribeError};
use crate::rabbitmq::transport::DeliveryStream;

const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);
// Upper bound on locally tracked failure counts per registration.
const MAX_TRACKED_REDELIVERIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The broker considers a message settled once delivered.
    Auto,
    Manual,
}

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Requeue,
    Reject,
}

/// Decides the fate of errors a handler did not classify itself.
pub trait ErrorClassifier: Send + Sync + 'static {
    fn classify(&self, error: &anyhow::Error) -> Disposition;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&anyhow::Error) -> Disposition + Send + Sync + 'static,
{
    fn classify(&self, error: &anyhow::Error) -> Disposition {
        self(error)
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        self(delivery).await
    }
}

#[derive(Clone)]
pub struct SubscribeOptions {
    pub ack_mode: AckMode,
    pub prefetch: u16,
    /// Concurrent handler invocations; defaults to the prefetch count.
    pub parallelism: Option<usize>,
    /// Requeues allowed before a failing message is rejected. `None` requeues
    /// forever.
    pub max_redeliveries: Option<u32>,
    pub classifier: Option<Arc<dyn ErrorClassifier>>,
    pub resubscribe_delay: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            ack_mode: AckMode::Manual,
            prefetch: 10,
            parallelism: None,
            max_redeliveries: None,
            classifier: None,
            resubscribe_delay: Duration::from_millis(200),
        }
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("ack_mode", &self.ack_mode)
            .field("prefetch", &self.prefetch)
            .field("parallelism", &self.parallelism)
            .field("max_redeliveries", &self.max_redeliveries)
            .field("classifier", &self.classifier.is_some())
            .field("resubscribe_delay", &self.resubscribe_delay)
            .finish()
    }
}

impl SubscribeOptions {
    pub fn auto_ack(mut self) -> Self {
        self.ack_mode = AckMode::Auto;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = Some(max_redeliveries);
        self
    }

    pub fn with_classifier<C: ErrorClassifier>(mut self, classifier: C) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    fn permits(&self) -> usize {
        self.parallelism
            .unwrap_or_else(|| usize::from(self.prefetch))
            .max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Pending,
    Active,
    Suspended,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    /// basic.consume calls that succeeded, the first one included.
    pub subscriptions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Ack,
    Requeue,
    Reject,
}

struct RegistrationInner {
    id: String,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    options: SubscribeOptions,
    state: watch::Sender<RegistrationState>,
    consumer_tag: Mutex<Option<String>>,
    cancel: watch::Sender<bool>,
    // Local failure counts for brokers that do not send x-delivery-count.
    redeliveries: Mutex<HashMap<String, u32>>,
    stats: Mutex<ConsumerStats>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle on one logical consumer. It stays the same across resubscriptions.
#[derive(Clone)]
pub struct Registration {
    inner: Arc<RegistrationInner>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.inner.id)
            .field("queue", &self.inner.queue)
            .field("state", &self.state())
            .finish()
    }
}

impl Registration {
    fn new(queue: &str, handler: Arc<dyn MessageHandler>, options: SubscribeOptions) -> Self {
        let (state, _) = watch::channel(RegistrationState::Pending);
        let (cancel, _) = watch::channel(false);
        Registration {
            inner: Arc::new(RegistrationInner {
                id: format!("consumer-{}", Uuid::new_v4()),
                queue: queue.to_string(),
                handler,
                options,
                state,
                consumer_tag: Mutex::new(None),
                cancel,
                redeliveries: Mutex::new(HashMap::new()),
                stats: Mutex::new(ConsumerStats::default()),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn state(&self) -> RegistrationState {
        *self.inner.state.borrow()
    }

    /// Tag of the current broker-side consumer; changes on resubscribe.
    pub fn consumer_tag(&self) -> Option<String> {
        self.inner.consumer_tag.lock().clone()
    }

    pub fn stats(&self) -> ConsumerStats {
        *self.inner.stats.lock()
    }

    pub async fn wait_for_state(&self, state: RegistrationState) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    fn set_state(&self, next: RegistrationState) {
        self.inner.state.send_if_modified(|current| {
            // Cancelled is terminal.
            if *current == RegistrationState::Cancelled || *current == next {
                return false;
            }
            debug!(registration = %self.inner.id, from = ?*current, to = ?next, "Consumer state change");
            *current = next;
            true
        });
    }

    fn is_cancelled(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    fn record(&self, update: impl FnOnce(&mut ConsumerStats)) {
        update(&mut *self.inner.stats.lock());
    }

    /// Requeue unless the message already failed `max_redeliveries` times.
    /// Auto-ack consumers never settle, so nothing is counted for them.
    fn requeue_or_reject(&self, delivery_key: &str, delivery_count: Option<u32>) -> Decision {
        let options = &self.inner.options;
        let Some(max) = options.max_redeliveries else {
            return Decision::Requeue;
        };
        if options.ack_mode == AckMode::Auto {
            return Decision::Requeue;
        }
        let mut redeliveries = self.inner.redeliveries.lock();
        let previous = delivery_count.unwrap_or_else(|| redeliveries.get(delivery_key).copied().unwrap_or(0));
        if previous >= max {
            redeliveries.remove(delivery_key);
            return Decision::Reject;
        }
        if redeliveries.len() >= MAX_TRACKED_REDELIVERIES && !redeliveries.contains_key(delivery_key) {
            warn!(
                registration = %self.inner.id,
                tracked = redeliveries.len(),
                "Too many failing messages tracked, resetting redelivery counts"
            );
            redeliveries.clear();
        }
        redeliveries.insert(delivery_key.to_string(), previous + 1);
        Decision::Requeue
    }

    // Messages unsettled on a dead channel may be consumed elsewhere.
    fn reset_redeliveries(&self) {
        self.inner.redeliveries.lock().clear();
    }

    fn forget(&self, delivery_key: &str) {
        if self.inner.options.max_redeliveries.is_some() {
            self.inner.redeliveries.lock().remove(delivery_key);
        }
    }
}

async fn wait_until_set(flag: &mut watch::Receiver<bool>) {
    while !*flag.borrow_and_update() {
        if flag.changed().await.is_err() {
            return;
        }
    }
}

/// Subscribes a registration on a fresh consumer channel.
async fn start_consumer(
    pool: &ChannelPool,
    registration: &Registration,
) -> Result<(Arc<Channel>, DeliveryStream), SubscribeError> {
    let options = &registration.inner.options;
    let channel = pool.acquire_consumer_channel(options.prefetch).await?;
    let no_ack = options.ack_mode == AckMode::Auto;

    match channel.basic_consume(registration.queue(), no_ack).await {
        Ok((tag, deliveries)) => {
            info!(
                registration = %registration.id(),
                queue = %registration.queue(),
                consumer_tag = %tag,
                channel_id = %channel.id(),
                "Started consuming from queue"
            );
            *registration.inner.consumer_tag.lock() = Some(tag);
            registration.record(|s| s.subscriptions += 1);
            registration.set_state(RegistrationState::Active);
            Ok((channel, deliveries))
        }
        Err(err) => {
            pool.release_consumer_channel(&channel).await;
            Err(SubscribeError::from_transport(registration.queue(), err))
        }
    }
}

/// Runs one message through the handler and settles it.
async fn process(registration: Registration, channel: Arc<Channel>, delivery: Delivery) {
    let inner = &registration.inner;
    let delivery_tag = delivery.delivery_tag;
    let delivery_key = delivery.redelivery_key();
    let delivery_count = delivery.delivery_count();
    registration.record(|s| s.delivered += 1);

    let result = AssertUnwindSafe(inner.handler.handle(delivery))
        .catch_unwind()
        .await;

    let decision = match result {
        Ok(Ok(())) => Decision::Ack,
        Ok(Err(HandlerError::Recoverable(err))) => {
            warn!(queue = %inner.queue, delivery_tag, error = %err, "Recoverable handler failure");
            registration.requeue_or_reject(&delivery_key, delivery_count)
        }
        Ok(Err(HandlerError::NonRecoverable(err))) => {
            error!(queue = %inner.queue, delivery_tag, error = %err, "Non-recoverable handler failure");
            Decision::Reject
        }
        Ok(Err(HandlerError::Unclassified(err))) => {
            let disposition = inner
                .options
                .classifier
                .as_ref()
                .map_or(Disposition::Requeue, |classifier| classifier.classify(&err));
            warn!(queue = %inner.queue, delivery_tag, error = %err, ?disposition, "Handler failure");
            match disposition {
                Disposition::Requeue => registration.requeue_or_reject(&delivery_key, delivery_count),
                Disposition::Reject => Decision::Reject,
            }
        }
        Err(_) => {
            error!(queue = %inner.queue, delivery_tag, "Message handler panicked");
            Decision::Reject
        }
    };

    if inner.options.ack_mode == AckMode::Auto {
        return;
    }

    let settled = match decision {
        Decision::Ack => channel.basic_ack(delivery_tag).await,
        Decision::Requeue => channel.basic_nack(delivery_tag, true).await,
        Decision::Reject => channel.basic_nack(delivery_tag, false).await,
    };
    if let Err(err) = settled {
        // The broker requeues whatever was unacked on a dead channel.
        warn!(
            queue = %inner.queue,
            delivery_tag,
            error = %err,
            "Failed to settle message, it will be redelivered"
        );
        return;
    }

    match decision {
        Decision::Ack => {
            registration.forget(&delivery_key);
            registration.record(|s| s.acked += 1);
        }
        Decision::Requeue => registration.record(|s| s.requeued += 1),
        Decision::Reject => {
            registration.forget(&delivery_key);
            registration.record(|s| s.rejected += 1);
        }
    }
}

struct Worker {
    registration: Registration,
    pool: Arc<ChannelPool>,
    gate: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self, mut channel: Arc<Channel>, mut deliveries: DeliveryStream) {
        let mut cancel = self.registration.inner.cancel.subscribe();
        let permits = self.registration.inner.options.permits();
        let semaphore = Arc::new(Semaphore::new(permits));

        loop {
            let cancelled = loop {
                tokio::select! {
                    biased;
                    _ = wait_until_set(&mut cancel) => break true,
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                break true;
                            };
                            let registration = self.registration.clone();
                            let channel = channel.clone();
                            tokio::spawn(async move {
                                process(registration, channel, delivery).await;
                                drop(permit);
                            });
                        }
                        Some(Err(err)) => {
                            warn!(queue = %self.registration.queue(), error = %err, "Consumer stream failed");
                            break false;
                        }
                        None => break false,
                    },
                }
            };

            if cancelled {
                self.shutdown(&channel, &semaphore, permits).await;
                return;
            }

            self.registration.set_state(RegistrationState::Suspended);
            info!(
                registration = %self.registration.id(),
                queue = %self.registration.queue(),
                "Consumer stream ended, waiting to resubscribe"
            );
            self.pool.release_consumer_channel(&channel).await;
            self.registration.reset_redeliveries();

            match self.resubscribe(&mut cancel).await {
                Some((fresh, stream)) => {
                    channel = fresh;
                    deliveries = stream;
                }
                None => {
                    *self.registration.inner.consumer_tag.lock() = None;
                    self.registration.set_state(RegistrationState::Cancelled);
                    return;
                }
            }
        }
    }

    async fn resubscribe(&mut self, cancel: &mut watch::Receiver<bool>) -> Option<(Arc<Channel>, DeliveryStream)> {
        let mut delay = self.registration.inner.options.resubscribe_delay;
        loop {
            tokio::select! {
                _ = wait_until_set(cancel) => return None,
                _ = wait_until_set(&mut self.gate) => {}
            }
            tokio::select! {
                _ = wait_until_set(cancel) => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            // The gate may have closed again while sleeping.
            if !*self.gate.borrow() {
                continue;
            }

            match start_consumer(&self.pool, &self.registration).await {
                Ok(subscribed) => {
                    if self.registration.is_cancelled() {
                        self.pool.release_consumer_channel(&subscribed.0).await;
                        return None;
                    }
                    return Some(subscribed);
                }
                Err(SubscribeError::Channel(ChannelError::Closed)) => return None,
                Err(err) => {
                    warn!(
                        registration = %self.registration.id(),
                        queue = %self.registration.queue(),
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "Resubscribe failed"
                    );
                    delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
                }
            }
        }
    }

    async fn shutdown(&self, channel: &Arc<Channel>, semaphore: &Semaphore, permits: usize) {
        if let Some(tag) = self.registration.consumer_tag() {
            if let Err(err) = channel.basic_cancel(&tag).await {
                debug!(consumer_tag = %tag, error = %err, "basic.cancel failed, channel already gone");
            }
        }
        // Let in-flight handlers settle their messages first.
        let _ = semaphore.acquire_many(permits as u32).await;
        self.pool.release_consumer_channel(channel).await;
        *self.registration.inner.consumer_tag.lock() = None;
        self.registration.set_state(RegistrationState::Cancelled);
        info!(
            registration = %self.registration.id(),
            queue = %self.registration.queue(),
            "Consumer cancelled"
        );
    }
}

/// Owns every live registration and decides when they may resubscribe.
pub struct ConsumerRegistry {
    pool: Arc<ChannelPool>,
    // Closed while the connection is down, opened once topology is replayed.
    gate: watch::Sender<bool>,
    registrations: Mutex<Vec<Registration>>,
}

impl ConsumerRegistry {
    pub fn new(session: &Session, pool: Arc<ChannelPool>) -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        let registry = Arc::new(ConsumerRegistry {
            pool,
            gate,
            registrations: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&registry);
        session.on_state_change(move |event| {
            if let Some(registry) = weak.upgrade() {
                if matches!(
                    event,
                    SessionEvent::Disconnected { .. } | SessionEvent::RecoveryFailed { .. }
                ) {
                    registry.suspend_all();
                }
            }
        });
        registry
    }

    pub async fn subscribe<H: MessageHandler>(
        &self,
        queue: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Registration, SubscribeError> {
        if queue.is_empty() {
            return Err(SubscribeError::Invalid("queue name must not be empty".to_string()));
        }
        if options.parallelism == Some(0) {
            return Err(SubscribeError::Invalid("parallelism must be at least 1".to_string()));
        }

        let registration = Registration::new(queue, Arc::new(handler), options);
        let (channel, deliveries) = match start_consumer(&self.pool, &registration).await {
            Ok(subscribed) => subscribed,
            Err(err) => {
                registration.set_state(RegistrationState::Cancelled);
                return Err(err);
            }
        };

        let worker = Worker {
            registration: registration.clone(),
            pool: self.pool.clone(),
            gate: self.gate.subscribe(),
        };
        let handle = tokio::spawn(worker.run(channel, deliveries));
        *registration.inner.task.lock() = Some(handle);
        self.registrations.lock().push(registration.clone());
        Ok(registration)
    }

    /// Cancels the consumer and waits for in-flight handlers to finish.
    pub async fn unsubscribe(&self, registration: &Registration) {
        self.registrations
            .lock()
            .retain(|r| r.id() != registration.id());
        registration.inner.cancel.send_replace(true);

        let task = registration.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(registration = %registration.id(), error = %err, "Consumer task failed");
            }
        }
        registration.set_state(RegistrationState::Cancelled);
    }

    /// Holds back resubscription until `resume_all`.
    pub fn suspend_all(&self) {
        if self.gate.send_replace(false) {
            debug!(count = self.registrations.lock().len(), "Consumers suspended");
        }
    }

    pub fn resume_all(&self) {
        self.gate.send_replace(true);
        info!(count = self.registrations.lock().len(), "Consumers resumed");
    }

    pub async fn cancel_all(&self) {
        let registrations: Vec<Registration> = self.registrations.lock().clone();
        for registration in &registrations {
            self.unsubscribe(registration).await;
        }
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().clone()
    }
}
