//! Connection Manager
//!
//! Owns the single logical connection and drives every state transition:
//!
//! ```text
//! IDLE -> CONNECTING -> OPEN -> CLOSING -> RECONNECT_WAIT -> CONNECTING
//!                                      \-> FAILED
//! ```
//!
//! The manager runs as one tokio task. The session facade talks to it over
//! a command channel; the transport helper tasks report back over an event
//! channel. Each transport attempt is tagged with a generation number and
//! events from a previous generation are ignored, so at most one transport
//! is ever live and its close is handled once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use super::envelope::{heartbeat_frame, Envelope};
use super::error::TransportError;
use super::policy::ReconnectPolicy;
use super::registry::SubscriptionRegistry;
use super::stats::SessionCounters;
use super::timers::{HeartbeatScheduler, RetryTimer};
use super::transport::{Connector, FrameSink, FrameStream, Transport};

/// How long an explicit close waits for the old transport to flush
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be
    Idle,
    /// A transport open is in flight
    Connecting,
    /// Transport open; sends are delivered
    Open,
    /// Transport being torn down
    Closing,
    /// Waiting out the backoff before retry `attempt`
    ReconnectWait { attempt: u32 },
    /// Retries exhausted; only an explicit `connect()` leaves this state
    Failed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Connecting now or about to retry
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::ReconnectWait { .. }
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "IDLE"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Open => write!(f, "OPEN"),
            ConnectionState::Closing => write!(f, "CLOSING"),
            ConnectionState::ReconnectWait { attempt } => {
                write!(f, "RECONNECT_WAIT(attempt {})", attempt)
            }
            ConnectionState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Requests from the session facade
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Send(String),
    Close(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Reports from transport helper tasks
#[derive(Debug)]
enum TransportEvent {
    Opened {
        generation: u64,
        connection_id: Uuid,
        transport: Transport,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        reason: Option<TransportError>,
    },
}

/// The live underlying handle. Never leaves the manager.
struct Link {
    connection_id: Uuid,
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Channels the manager publishes observable state on
pub(crate) struct Publishers {
    pub state: watch::Sender<ConnectionState>,
    pub last_message: watch::Sender<Option<Envelope>>,
}

pub(crate) struct ConnectionManager {
    endpoint: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,

    state: ConnectionState,
    attempt_count: u32,
    generation: u64,
    link: Option<Link>,
    pending_connect: Option<JoinHandle<()>>,

    retry: RetryTimer,
    heartbeat: HeartbeatScheduler,

    registry: SubscriptionRegistry,
    publishers: Publishers,
    counters: Arc<SessionCounters>,

    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        endpoint: String,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        heartbeat: HeartbeatScheduler,
        registry: SubscriptionRegistry,
        publishers: Publishers,
        counters: Arc<SessionCounters>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            endpoint,
            connector,
            policy,
            state: ConnectionState::Idle,
            attempt_count: 0,
            generation: 0,
            link: None,
            pending_connect: None,
            retry: RetryTimer::new(),
            heartbeat,
            registry,
            publishers,
            counters,
            commands,
            events_tx,
            events_rx,
        }
    }

    /// Event loop. Returns after shutdown or once every facade handle is gone.
    pub(crate) async fn run(mut self) {
        tracing::debug!(endpoint = %self.endpoint, "Connection manager started");

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Connect) => self.connect(),
                    Some(Command::Send(frame)) => self.send(frame),
                    Some(Command::Close(ack)) => {
                        let writer = self.close();
                        drain_writer(writer).await;
                        let _ = ack.send(());
                    }
                    Some(Command::Shutdown(ack)) => {
                        let writer = self.shutdown();
                        drain_writer(writer).await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        let writer = self.shutdown();
                        drain_writer(writer).await;
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                attempt = self.retry.fired() => self.on_retry_timer(attempt),
                () = self.heartbeat.tick() => self.on_heartbeat(),
            }
        }

        tracing::debug!(endpoint = %self.endpoint, "Connection manager stopped");
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened {
                generation,
                connection_id,
                transport,
            } => {
                if generation != self.generation || self.state != ConnectionState::Connecting {
                    tracing::debug!(connection_id = %connection_id, "Discarding stale transport");
                    return;
                }
                self.on_open(connection_id, transport);
            }
            TransportEvent::Frame { generation, text } => {
                if generation != self.generation || !self.state.is_open() {
                    return;
                }
                self.on_message(&text);
            }
            TransportEvent::Closed { generation, reason } => {
                if generation != self.generation
                    || !matches!(
                        self.state,
                        ConnectionState::Connecting | ConnectionState::Open
                    )
                {
                    return;
                }
                self.on_close(reason);
            }
        }
    }

    /// No-op while connecting or open. From `FAILED` the attempt count
    /// starts over; from `RECONNECT_WAIT` the pending retry is taken now.
    fn connect(&mut self) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                tracing::debug!(state = %self.state, "connect() ignored");
                return;
            }
            ConnectionState::Failed => {
                self.attempt_count = 0;
            }
            ConnectionState::ReconnectWait { .. } => {
                self.retry.cancel();
            }
            ConnectionState::Idle | ConnectionState::Closing => {}
        }

        self.open_transport();
    }

    fn open_transport(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let connection_id = Uuid::new_v4();

        self.set_state(ConnectionState::Connecting);
        SessionCounters::incr(&self.counters.connect_attempts);

        tracing::info!(
            endpoint = %self.endpoint,
            attempt = self.attempt_count,
            connection_id = %connection_id,
            "Connecting"
        );

        let connector = Arc::clone(&self.connector);
        let endpoint = self.endpoint.clone();
        let events = self.events_tx.clone();

        self.pending_connect = Some(tokio::spawn(async move {
            let event = match connector.connect(&endpoint).await {
                Ok(transport) => TransportEvent::Opened {
                    generation,
                    connection_id,
                    transport,
                },
                Err(e) => TransportEvent::Closed {
                    generation,
                    reason: Some(e),
                },
            };
            let _ = events.send(event);
        }));
    }

    fn on_open(&mut self, connection_id: Uuid, transport: Transport) {
        self.pending_connect = None;

        let Transport { sink, stream } = transport;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let generation = self.generation;

        let writer = tokio::spawn(write_frames(
            sink,
            outbound_rx,
            self.events_tx.clone(),
            generation,
        ));
        let reader = tokio::spawn(read_frames(stream, self.events_tx.clone(), generation));

        self.link = Some(Link {
            connection_id,
            outbound,
            reader,
            writer,
        });
        self.attempt_count = 0;
        self.set_state(ConnectionState::Open);
        self.heartbeat.start();
        SessionCounters::incr(&self.counters.transports_opened);

        tracing::info!(
            endpoint = %self.endpoint,
            connection_id = %connection_id,
            heartbeat_ms = self.heartbeat.period().as_millis() as u64,
            "Connected"
        );
    }

    fn on_message(&mut self, text: &str) {
        SessionCounters::incr(&self.counters.frames_received);

        match Envelope::decode(text) {
            Ok(envelope) => {
                tracing::trace!(msg_type = %envelope.msg_type, "Received message");
                self.publishers
                    .last_message
                    .send_replace(Some(envelope.clone()));

                let report = self.registry.dispatch(&envelope);
                if report.panicked > 0 {
                    SessionCounters::add(&self.counters.callback_panics, report.panicked as u64);
                }
            }
            Err(e) => {
                SessionCounters::incr(&self.counters.decode_errors);
                tracing::warn!(error = %e, "Dropping undecodable frame");
            }
        }
    }

    fn on_close(&mut self, reason: Option<TransportError>) {
        let was_open = self.state.is_open();
        self.set_state(ConnectionState::Closing);
        self.heartbeat.stop();
        // The transport is already dead; its writer is left to finish on its own
        drop(self.release_transport());

        match reason {
            Some(e) if was_open => tracing::warn!(error = %e, "Connection lost"),
            Some(e) => tracing::warn!(error = %e, "Connection attempt failed"),
            None => tracing::info!("Connection closed by server"),
        }

        if self.policy.should_retry(self.attempt_count) {
            self.attempt_count += 1;
            let delay = self.policy.delay(self.attempt_count);
            self.retry.schedule(delay, self.attempt_count);
            SessionCounters::incr(&self.counters.reconnects_scheduled);

            tracing::info!(
                attempt = self.attempt_count,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            self.set_state(ConnectionState::ReconnectWait {
                attempt: self.attempt_count,
            });
        } else {
            tracing::error!(
                endpoint = %self.endpoint,
                max_attempts = self.policy.max_attempts,
                "Reconnect attempts exhausted, giving up"
            );
            self.set_state(ConnectionState::Failed);
        }
    }

    fn on_retry_timer(&mut self, attempt: u32) {
        if !matches!(self.state, ConnectionState::ReconnectWait { .. }) {
            return;
        }
        tracing::info!(attempt, "Reconnecting");
        self.open_transport();
    }

    fn on_heartbeat(&mut self) {
        let Some(link) = self.link.as_ref().filter(|_| self.state.is_open()) else {
            return;
        };
        if link.outbound.send(heartbeat_frame()).is_ok() {
            SessionCounters::incr(&self.counters.heartbeats_sent);
            tracing::trace!(connection_id = %link.connection_id, "Sent heartbeat");
        }
    }

    /// At-most-once: delivered to the writer when open, otherwise dropped.
    fn send(&mut self, frame: String) {
        let delivered = match self.link.as_ref() {
            Some(link) if self.state.is_open() => link.outbound.send(frame).is_ok(),
            _ => false,
        };

        if delivered {
            SessionCounters::incr(&self.counters.frames_sent);
        } else {
            SessionCounters::incr(&self.counters.sends_dropped);
            tracing::warn!(state = %self.state, "Dropping outbound message, connection is not open");
        }
    }

    /// Caller-initiated teardown. Does not reconnect.
    ///
    /// Returns the writer of the released transport so the caller can wait
    /// for it to flush and close.
    fn close(&mut self) -> Option<JoinHandle<()>> {
        let retry_pending = self.retry.is_pending();
        let heartbeat_running = self.heartbeat.is_running();
        self.retry.cancel();
        self.heartbeat.stop();

        let was_idle = self.state == ConnectionState::Idle;
        if !was_idle {
            self.set_state(ConnectionState::Closing);
        }
        let writer = self.release_transport();
        self.attempt_count = 0;
        self.set_state(ConnectionState::Idle);

        if !was_idle {
            tracing::info!(
                endpoint = %self.endpoint,
                retry_pending,
                heartbeat_running,
                "Connection closed"
            );
        }
        writer
    }

    fn shutdown(&mut self) -> Option<JoinHandle<()>> {
        let writer = self.close();
        self.registry.clear();
        writer
    }

    /// Drop the live transport (if any) and invalidate its in-flight events.
    ///
    /// Returns the transport's writer task, which finishes once queued
    /// frames are flushed and the sink is closed.
    fn release_transport(&mut self) -> Option<JoinHandle<()>> {
        if let Some(connecting) = self.pending_connect.take() {
            connecting.abort();
        }
        self.generation += 1;

        let link = self.link.take()?;
        link.reader.abort();
        // Dropping the sender lets the writer flush and close the sink
        drop(link.outbound);
        tracing::debug!(connection_id = %link.connection_id, "Transport released");
        Some(link.writer)
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
        self.publishers.state.send_replace(next);
    }
}

/// Wait for a released writer to finish closing, aborting it after
/// [`WRITER_DRAIN_TIMEOUT`]
async fn drain_writer(writer: Option<JoinHandle<()>>) {
    let Some(mut writer) = writer else {
        return;
    };
    if time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        tracing::debug!("Transport writer did not close in time, aborting");
        writer.abort();
    }
}

async fn write_frames(
    mut sink: FrameSink,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    generation: u64,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(error = %e, "Transport write failed");
            let _ = events.send(TransportEvent::Closed {
                generation,
                reason: Some(e),
            });
            return;
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "Transport close failed");
    }
}

async fn read_frames(
    mut stream: FrameStream,
    events: mpsc::UnboundedSender<TransportEvent>,
    generation: u64,
) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(text)) => {
                if events
                    .send(TransportEvent::Frame { generation, text })
                    .is_err()
                {
                    return;
                }
            }
            Some(Err(e)) => break Some(e),
            None => break None,
        }
    };

    let _ = events.send(TransportEvent::Closed { generation, reason });
}
