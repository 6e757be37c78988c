use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::message::OutgoingMessage;
use crate::rabbitmq::channel_manager::{ChannelPool, PoolStats};
use crate::rabbitmq::connection::{Session, SessionEvent, SessionState};
use crate::rabbitmq::consumer::{ConsumerRegistry, MessageHandler, Registration, SubscribeOptions};
use crate::rabbitmq::errors::{ConnectError, DeclarationError, PublishError, SubscribeError};
use crate::rabbitmq::lapin_transport::LapinConnector;
use crate::rabbitmq::publisher::{PublishOptions, PublishOutcome, Publisher};
use crate::rabbitmq::topology::{
    Binding, Declaration, ExchangeDeclaration, QueueDeclaration, QueueInfo, ReplayReport, TopologyManager,
};
use crate::rabbitmq::transport::Connector;

const REPLAY_RETRY_DELAY: Duration = Duration::from_millis(500);

struct ClientInner {
    config: ClientConfig,
    session: Session,
    pool: Arc<ChannelPool>,
    topology: Arc<TopologyManager>,
    publisher: Publisher,
    registry: Arc<ConsumerRegistry>,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
}

/// Entry point: one connection, a channel pool, the declared topology and
/// every consumer, kept alive across broker outages.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub async fn connect(config: ClientConfig) -> Result<Client, ConnectError> {
        Self::connect_with(config, Arc::new(LapinConnector)).await
    }

    /// Connects through a custom transport, e.g. the in-memory broker.
    pub async fn connect_with(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Client, ConnectError> {
        let session = Session::new(config.connection.clone(), config.recovery.clone(), connector);
        let pool = ChannelPool::new(session.clone(), config.channel.clone());
        pool.hold_until_replayed();
        let registry = ConsumerRegistry::new(&session, pool.clone());
        let topology = Arc::new(TopologyManager::new(pool.clone()));
        let publisher = Publisher::new(pool.clone());

        // Subscribe before connecting so no Recovered event can slip past.
        let events = session.subscribe();
        session.start().await?;

        let task = tokio::spawn(restore_after_recovery(
            events,
            session.clone(),
            pool.clone(),
            topology.clone(),
            registry.clone(),
        ));

        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                session,
                pool,
                topology,
                publisher,
                registry,
                recovery_task: Mutex::new(Some(task)),
            }),
        })
    }

    pub async fn declare_exchange(
        &self,
        declaration: ExchangeDeclaration,
    ) -> Result<ExchangeDeclaration, DeclarationError> {
        self.inner.topology.declare_exchange(declaration).await
    }

    pub async fn declare_queue(&self, declaration: QueueDeclaration) -> Result<QueueInfo, DeclarationError> {
        self.inner.topology.declare_queue(declaration).await
    }

    pub async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), DeclarationError> {
        self.inner.topology.bind(queue, exchange, routing_key).await
    }

    pub async fn bind_with(&self, binding: Binding) -> Result<(), DeclarationError> {
        self.inner.topology.bind_with(binding).await
    }

    pub async fn publish<M: Into<OutgoingMessage>>(
        &self,
        message: M,
        routing_key: &str,
        exchange: &str,
        options: &PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        let message = message.into();
        self.inner
            .publisher
            .publish(&message, routing_key, exchange, options)
            .await
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        value: &T,
        routing_key: &str,
        exchange: &str,
        options: &PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        self.inner
            .publisher
            .publish_json(value, routing_key, exchange, options)
            .await
    }

    pub async fn consume<H: MessageHandler>(
        &self,
        queue: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Registration, SubscribeError> {
        self.inner.registry.subscribe(queue, handler, options).await
    }

    pub async fn unsubscribe(&self, registration: &Registration) {
        self.inner.registry.unsubscribe(registration).await
    }

    /// Subscribe options seeded with the configured prefetch count.
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions::default().with_prefetch(self.inner.config.channel.prefetch_count)
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.session.subscribe()
    }

    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.session.on_state_change(listener)
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.session.is_closed()
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn topology(&self) -> Vec<Declaration> {
        self.inner.topology.snapshot()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.inner.registry.registrations()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Cancels consumers, fails pending publishes with `Closed`, stops any
    /// reconnect in progress and closes the connection.
    pub async fn close(&self) {
        if self.inner.session.is_closed() {
            return;
        }
        info!("Closing RabbitMQ client");
        self.inner.registry.cancel_all().await;
        self.inner.pool.close().await;
        self.inner.session.close().await;
        if let Some(task) = self.inner.recovery_task.lock().take() {
            task.abort();
        }
    }
}

/// Replays topology and reopens the consumer gate after each recovery.
async fn restore_after_recovery(
    mut events: broadcast::Receiver<SessionEvent>,
    session: Session,
    pool: Arc<ChannelPool>,
    topology: Arc<TopologyManager>,
    registry: Arc<ConsumerRegistry>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Recovered { replay_topology }) => {
                restore(&session, &pool, &topology, &registry, replay_topology).await;
            }
            Ok(SessionEvent::Closed) | Ok(SessionEvent::RecoveryFailed { .. }) => return,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed session events, replaying topology");
                if session.state() == SessionState::Connected {
                    restore(&session, &pool, &topology, &registry, true).await;
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

// Channels and consumers come back only once the topology is in place on
// the connection that is current at the end.
async fn restore(
    session: &Session,
    pool: &Arc<ChannelPool>,
    topology: &TopologyManager,
    registry: &ConsumerRegistry,
    replay_topology: bool,
) {
    let epoch = pool.epoch();
    if replay_topology {
        replay_with_retry(session, pool, topology).await;
    }
    if pool.mark_ready(epoch) {
        registry.resume_all();
    } else {
        debug!(epoch, "Connection changed during restore, waiting for the next recovery");
    }
}

// Gives up once the connection drops again; the next recovery replays anew.
async fn replay_with_retry(session: &Session, pool: &Arc<ChannelPool>, topology: &TopologyManager) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match replay_once(pool, topology).await {
            Ok(_) => return,
            Err(err) if err.is_retryable() && session.state() == SessionState::Connected => {
                warn!(attempt, error = %err, "Topology replay failed, retrying");
                tokio::time::sleep(REPLAY_RETRY_DELAY).await;
            }
            Err(err) => {
                error!(attempt, error = %err, "Topology replay failed");
                return;
            }
        }
    }
}

async fn replay_once(pool: &Arc<ChannelPool>, topology: &TopologyManager) -> Result<ReplayReport, DeclarationError> {
    let channel = pool.acquire_for_replay().await?;
    topology.replay_all(&channel).await
}
