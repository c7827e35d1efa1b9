//! Session Facade
//!
//! The public handle UI code uses: connect, send, subscribe, and observe
//! connection state. A [`Session`] is created once for the application and
//! handed to consumers by cloning; every clone drives the same connection
//! and the same subscription registry. Dropping a consumer's clone never
//! closes the connection. Only [`Session::shutdown`] (or dropping the last
//! clone) does.
//!
//! Callbacks live in the registry, which the connection manager owns. A
//! callback that captures a `Session` clone therefore keeps the session
//! alive on its own; capture a [`WeakSession`] instead.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::envelope::{encode, Envelope, OutboundMessage};
use super::error::{SessionError, SessionResult};
use super::manager::{Command, ConnectionManager, ConnectionState, Publishers};
use super::policy::ReconnectPolicy;
use super::registry::{Subscription, SubscriptionRegistry};
use super::stats::{SessionCounters, SessionStats};
use super::timers::HeartbeatScheduler;
use super::transport::{Connector, WsConnector};
use crate::config::SessionConfig;

/// Process-wide real-time session
///
/// Cheap to clone. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    endpoint: String,
    commands: mpsc::UnboundedSender<Command>,
    registry: SubscriptionRegistry,
    state: watch::Receiver<ConnectionState>,
    last_message: watch::Receiver<Option<Envelope>>,
    counters: Arc<SessionCounters>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start a session that connects over WebSocket
    pub fn start(config: &SessionConfig) -> SessionResult<Self> {
        Self::with_connector(config, WsConnector)
    }

    /// Start a session over a custom transport
    ///
    /// Spawns the connection manager task on the current tokio runtime.
    /// The connection stays `IDLE` until [`Session::connect`] is called.
    pub fn with_connector<C: Connector>(config: &SessionConfig, connector: C) -> SessionResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (last_tx, last_rx) = watch::channel(None);
        let registry = SubscriptionRegistry::new();
        let counters = Arc::new(SessionCounters::default());

        let manager = ConnectionManager::new(
            config.endpoint.clone(),
            Arc::new(connector),
            ReconnectPolicy::from(config),
            HeartbeatScheduler::new(Duration::from_millis(config.heartbeat_interval_ms)),
            registry.clone(),
            Publishers {
                state: state_tx,
                last_message: last_tx,
            },
            Arc::clone(&counters),
            commands_rx,
        );
        let task = runtime.spawn(manager.run());

        tracing::info!(endpoint = %config.endpoint, "Session started");

        Ok(Self {
            inner: Arc::new(SessionInner {
                endpoint: config.endpoint.clone(),
                commands,
                registry,
                state: state_rx,
                last_message: last_rx,
                counters,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Handle that does not keep the session alive
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Open the connection if it is not already open or opening.
    ///
    /// Returns immediately; observe the outcome through [`Session::state`],
    /// [`Session::watch_state`] or [`Session::wait_connected`]. Safe to call
    /// speculatively from every consumer.
    pub fn connect(&self) {
        if self.inner.commands.send(Command::Connect).is_err() {
            tracing::warn!("connect() called on a session that has been shut down");
        }
    }

    /// Serialize `payload` and send it as one frame.
    ///
    /// Fire-and-forget: if the connection is not open when the frame reaches
    /// the connection manager it is dropped with a warning.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> SessionResult<()> {
        let frame = encode(payload).map_err(SessionError::Encode)?;
        self.send_raw(frame)
    }

    /// Send a `{type, data}` envelope
    pub fn send_message<T: Serialize>(&self, msg_type: &str, data: T) -> SessionResult<()> {
        self.send(&OutboundMessage::new(msg_type, data))
    }

    /// Send an already-encoded text frame
    pub fn send_raw(&self, frame: String) -> SessionResult<()> {
        self.inner
            .commands
            .send(Command::Send(frame))
            .map_err(|_| SessionError::ShutDown)
    }

    /// Register interest in `msg_type` (or [`super::WILDCARD`]).
    ///
    /// See [`SubscriptionRegistry::subscribe`] for what the callback receives.
    /// Callbacks run on the connection manager task and should return quickly.
    ///
    /// To reply from a callback, capture [`Session::downgrade`] rather than a
    /// clone. A captured clone keeps the connection running after every
    /// other handle is dropped.
    pub fn subscribe<F>(&self, msg_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(msg_type, callback)
    }

    /// Register a callback for every message, receiving the typed envelope
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.registry.subscribe_all(callback)
    }

    pub fn subscriber_count(&self, msg_type: &str) -> usize {
        self.inner.registry.subscriber_count(msg_type)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_open()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that is notified on every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Most recently decoded inbound message, if any
    pub fn last_message(&self) -> Option<Envelope> {
        self.inner.last_message.borrow().clone()
    }

    /// Wait until the connection is open. Returns false on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.inner.state.clone();
        let opened = tokio::time::timeout(timeout, state.wait_for(|s| s.is_open())).await;
        matches!(opened, Ok(Ok(_)))
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.counters.snapshot()
    }

    /// Close the connection without reconnecting.
    ///
    /// When this returns the reconnect timer is cancelled and the heartbeat
    /// stopped. The session stays usable; `connect()` opens a fresh
    /// connection.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.inner.commands.send(Command::Close(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Close the connection, drop every subscription and stop the
    /// connection manager. Further sends fail with [`SessionError::ShutDown`].
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.inner.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }

        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Connection manager task failed");
            }
        }

        tracing::info!(endpoint = %self.inner.endpoint, "Session shut down");
    }
}

/// Non-owning session handle, see [`Session::downgrade`]
#[derive(Clone, Debug)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    /// The session, unless every owning handle is gone
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::error::TransportError;
    use crate::session::transport::Transport;
    use async_trait::async_trait;

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self, _endpoint: &str) -> Result<Transport, TransportError> {
            Err(TransportError::Connect("refused".to_string()))
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            endpoint: "ws://localhost:9000/ws".to_string(),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_new_session_is_idle() {
        let session = Session::with_connector(&config(), Refusing).unwrap();
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(!session.is_connected());
        assert!(session.last_message().is_none());
        assert_eq!(session.endpoint(), "ws://localhost:9000/ws");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let bad = SessionConfig {
            endpoint: "http://localhost".to_string(),
            ..SessionConfig::default()
        };
        let result = Session::with_connector(&bad, Refusing);
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let session = Session::with_connector(&config(), Refusing).unwrap();
        session.shutdown().await;

        let result = session.send_message("gavage", serde_json::json!({"x": 1}));
        assert!(matches!(result, Err(SessionError::ShutDown)));

        // Repeated teardown is harmless
        session.close().await;
        session.shutdown().await;
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let result = Session::with_connector(&config(), Refusing);
        assert!(matches!(result, Err(SessionError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_weak_handle_does_not_keep_session() {
        let session = Session::with_connector(&config(), Refusing).unwrap();
        let weak = session.downgrade();
        assert_eq!(weak.upgrade().unwrap().endpoint(), "ws://localhost:9000/ws");

        session.shutdown().await;
        drop(session);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_registry() {
        let session = Session::with_connector(&config(), Refusing).unwrap();
        let other = session.clone();

        let sub = other.subscribe("gavage", |_| {});
        assert_eq!(session.subscriber_count("gavage"), 1);

        sub.unsubscribe();
        assert_eq!(session.subscriber_count("gavage"), 0);
        session.shutdown().await;
    }
}
