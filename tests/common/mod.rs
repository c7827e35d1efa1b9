//! Shared test utilities: an in-memory connector and session harness.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agrolink::{ConnectionState, Connector, Session, SessionConfig, Transport, TransportError};
use async_trait::async_trait;
use futures_util::{sink, stream};
use tokio::sync::mpsc;

/// What the next connect attempt does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Open a transport and hand the server side to the test
    Accept,
    /// Fail immediately
    Refuse,
    /// Never complete
    Hang,
}

/// Server side of an accepted in-memory transport
pub struct MockPeer {
    to_client: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockPeer {
    /// Deliver a text frame to the client
    pub fn push(&self, text: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(text.to_string()));
        }
    }

    /// Fail the connection with an I/O error
    pub fn fail(&self) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Err(TransportError::Io("connection reset".to_string())));
        }
    }

    /// Close the server side; the client sees end-of-stream
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }

    /// Frames written by the client so far, without waiting
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Next frame written by the client; None once the client closed
    pub async fn next_frame(&mut self) -> Option<String> {
        self.from_client.recv().await
    }
}

struct MockState {
    attempts: AtomicUsize,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    peers: mpsc::UnboundedSender<MockPeer>,
}

/// Connector whose attempts follow a script, then a fallback outcome
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new(
        script: Vec<Outcome>,
        fallback: Outcome,
    ) -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(MockState {
                attempts: AtomicUsize::new(0),
                script: Mutex::new(script.into()),
                fallback,
                peers,
            }),
        };
        (connector, peers_rx)
    }

    /// Queue the outcome of a future attempt
    pub fn push(&self, outcome: Outcome) {
        self.state.script.lock().unwrap().push_back(outcome);
    }

    /// Number of transports requested so far
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Transport, TransportError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.state.fallback);

        match outcome {
            Outcome::Refuse => Err(TransportError::Connect("connection refused".to_string())),
            Outcome::Hang => future::pending().await,
            Outcome::Accept => {
                let (to_client, client_rx) = mpsc::unbounded_channel();
                let (client_tx, from_client) = mpsc::unbounded_channel::<String>();

                let sink = sink::unfold(
                    client_tx,
                    |tx: mpsc::UnboundedSender<String>, frame: String| async move {
                        tx.send(frame).map_err(|_| TransportError::Closed)?;
                        Ok::<_, TransportError>(tx)
                    },
                );
                let stream = stream::unfold(
                    client_rx,
                    |mut rx: mpsc::UnboundedReceiver<Result<String, TransportError>>| async move {
                        rx.recv().await.map(|item| (item, rx))
                    },
                );

                let _ = self.state.peers.send(MockPeer {
                    to_client: Some(to_client),
                    from_client,
                });
                Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
            }
        }
    }
}

/// A session wired to a [`MockConnector`]
pub struct Harness {
    pub session: Session,
    pub connector: MockConnector,
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

impl Harness {
    pub fn new(config: SessionConfig, script: Vec<Outcome>, fallback: Outcome) -> Self {
        let (connector, peers) = MockConnector::new(script, fallback);
        let session = Session::with_connector(&config, connector.clone()).unwrap();
        Self {
            session,
            connector,
            peers,
        }
    }

    /// Session with default timings whose first attempt is accepted and
    /// every later attempt refused
    pub fn accepting_once() -> Self {
        Self::new(test_config(), vec![Outcome::Accept], Outcome::Refuse)
    }

    /// Connect and wait for the accepted transport
    pub async fn open(&mut self) -> MockPeer {
        self.session.connect();
        let peer = self.next_peer().await;
        wait_for_state(&self.session, |s| s.is_open()).await;
        peer
    }

    pub async fn next_peer(&mut self) -> MockPeer {
        tokio::time::timeout(Duration::from_secs(600), self.peers.recv())
            .await
            .expect("no transport was accepted")
            .expect("connector dropped")
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        endpoint: "ws://mock.local/ws".to_string(),
        base_delay_ms: 1000,
        max_delay_ms: 30000,
        max_attempts: 5,
        heartbeat_interval_ms: 30000,
    }
}

/// Wait until the session state satisfies `pred`
pub async fn wait_for_state(
    session: &Session,
    pred: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut states = session.watch_state();
    let state = tokio::time::timeout(Duration::from_secs(600), states.wait_for(pred))
        .await
        .expect("timed out waiting for state")
        .expect("session stopped");
    *state
}

/// Let every ready task run.
///
/// With a paused clock the runtime only advances time once all tasks are
/// idle, so a 1 ms sleep returns after pending work has drained.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
