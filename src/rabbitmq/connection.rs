use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionParams, RecoveryConfig};
use crate::rabbitmq::errors::{ChannelError, ConnectError};
use crate::rabbitmq::transport::{Connector, Link};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Recovering,
}

/// Lifecycle notifications, delivered to listeners in registration order and
/// then to broadcast subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    Recovering { attempt: u32, delay: Duration },
    Recovered { replay_topology: bool },
    RecoveryFailed { attempts: u32 },
    Closed,
}

type Listener = Box<dyn Fn(&SessionEvent) + Send + Sync>;

struct SessionInner {
    params: ConnectionParams,
    recovery: RecoveryConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<SessionState>,
    link: RwLock<Option<Arc<dyn Link>>>,
    events: broadcast::Sender<SessionEvent>,
    listeners: Mutex<Vec<Listener>>,
    closed: AtomicBool,
    failure: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the single physical connection and brings it back after a loss.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Creates a session without connecting, so listeners can be registered
    /// before the first event fires.
    pub fn new(params: ConnectionParams, recovery: RecoveryConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);

        Session {
            inner: Arc::new(SessionInner {
                params,
                recovery,
                connector,
                state,
                link: RwLock::new(None),
                events,
                listeners: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                failure: Mutex::new(None),
                shutdown,
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub async fn connect(
        params: ConnectionParams,
        recovery: RecoveryConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConnectError> {
        let session = Session::new(params, recovery, connector);
        session.start().await?;
        Ok(session)
    }

    /// Makes the initial connection attempt, bounded by the connection timeout.
    /// A failed first attempt is reported to the caller rather than retried.
    pub async fn start(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::SessionClosed);
        }
        if inner.link.read().is_some() {
            return Ok(());
        }
        inner.params.validate().map_err(ConnectError::InvalidParams)?;

        let endpoint = inner.params.endpoint();
        let timeout = inner.params.connection_timeout();
        inner.state.send_replace(SessionState::Connecting);
        info!(uri = %inner.params, "Attempting to connect to RabbitMQ");

        let link = match tokio::time::timeout(timeout, inner.connector.connect(&inner.params)).await {
            Ok(Ok(link)) => link,
            Ok(Err(source)) => {
                inner.state.send_replace(SessionState::Disconnected);
                error!(endpoint = %endpoint, error = %source, "Failed to connect to RabbitMQ");
                return Err(ConnectError::Transport { endpoint, source });
            }
            Err(_) => {
                inner.state.send_replace(SessionState::Disconnected);
                error!(endpoint = %endpoint, ?timeout, "Connection attempt timed out");
                return Err(ConnectError::Timeout { endpoint, timeout });
            }
        };

        if !inner.install(link.clone()) {
            let _ = link.close().await;
            return Err(ConnectError::SessionClosed);
        }
        info!(endpoint = %endpoint, "Successfully connected to RabbitMQ");
        inner.emit(SessionEvent::Connected);
        self.spawn_supervisor(link);
        Ok(())
    }

    fn spawn_supervisor(&self, link: Arc<dyn Link>) {
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut link = link;
            loop {
                let reason = tokio::select! {
                    reason = link.closed() => reason,
                    _ = shutdown_requested(&mut shutdown) => return,
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                match inner.recover(reason, &mut shutdown).await {
                    Some(fresh) => link = fresh,
                    None => return,
                }
            }
        });
        *self.inner.supervisor.lock() = Some(handle);
    }

    /// Registers a synchronous listener. Listeners run in registration order
    /// on the task that emits the event, before broadcast subscribers see it.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().push(Box::new(listener));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.inner.params
    }

    /// The current link, if connected.
    pub fn link(&self) -> Option<Arc<dyn Link>> {
        self.inner.link.read().clone()
    }

    /// Suspends until the session is connected. Fails once the session is
    /// closed or has given up recovering.
    pub async fn wait_connected(&self) -> Result<Arc<dyn Link>, ChannelError> {
        let mut state = self.inner.state.subscribe();
        loop {
            if self.is_closed() {
                return Err(ChannelError::Closed);
            }
            if let Some(reason) = self.inner.failure.lock().clone() {
                return Err(ChannelError::Lost(reason));
            }
            if *state.borrow_and_update() == SessionState::Connected {
                if let Some(link) = self.link() {
                    if link.is_connected() {
                        return Ok(link);
                    }
                }
            }
            if state.changed().await.is_err() {
                return Err(ChannelError::Closed);
            }
        }
    }

    /// Terminal: stops any retry in progress, closes the link and emits
    /// `Closed`. The session never reconnects afterwards.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing RabbitMQ session gracefully");
        inner.shutdown.send_replace(true);

        let link = inner.link.write().take();
        if let Some(link) = link {
            if let Err(err) = link.close().await {
                debug!(error = %err, "Link was already gone while closing");
            }
        }
        if let Some(handle) = inner.supervisor.lock().take() {
            handle.abort();
        }
        inner.state.send_replace(SessionState::Disconnected);
        inner.emit(SessionEvent::Closed);
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        debug!(event = ?event, "Session event");
        for listener in self.listeners.lock().iter() {
            listener(&event);
        }
        let _ = self.events.send(event);
    }

    // Returns false when the session was closed while the link was opening.
    fn install(&self, link: Arc<dyn Link>) -> bool {
        let mut slot = self.link.write();
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        *slot = Some(link);
        drop(slot);
        self.state.send_replace(SessionState::Connected);
        true
    }

    async fn recover(&self, reason: String, shutdown: &mut watch::Receiver<bool>) -> Option<Arc<dyn Link>> {
        warn!(reason = %reason, "Connection to RabbitMQ lost");
        self.link.write().take();
        self.state.send_replace(SessionState::Disconnected);
        self.emit(SessionEvent::Disconnected { reason });
        self.state.send_replace(SessionState::Recovering);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Some(max_attempts) = self.recovery.max_attempts {
                if attempt > max_attempts {
                    error!(attempts = max_attempts, "Max reconnection attempts reached. Giving up.");
                    *self.failure.lock() =
                        Some(format!("gave up reconnecting after {} attempts", max_attempts));
                    self.state.send_replace(SessionState::Disconnected);
                    self.emit(SessionEvent::RecoveryFailed {
                        attempts: max_attempts,
                    });
                    return None;
                }
            }

            let delay = self.recovery.delay_for(attempt);
            self.emit(SessionEvent::Recovering { attempt, delay });
            info!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before next reconnect attempt");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(shutdown) => return None,
            }

            let attempt_connect =
                tokio::time::timeout(self.params.connection_timeout(), self.connector.connect(&self.params));
            let result = tokio::select! {
                result = attempt_connect => result,
                _ = shutdown_requested(shutdown) => return None,
            };

            match result {
                Ok(Ok(link)) => {
                    if !self.install(link.clone()) {
                        let _ = link.close().await;
                        return None;
                    }
                    info!(attempt, "Successfully reconnected to RabbitMQ");
                    self.emit(SessionEvent::Recovered {
                        replay_topology: true,
                    });
                    return Some(link);
                }
                Ok(Err(err)) => {
                    error!(attempt, error = %err, "Failed to reconnect to RabbitMQ");
                }
                Err(_) => {
                    error!(attempt, "Reconnect attempt timed out");
                }
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
