//! Transport Seam
//!
//! The connection manager never touches sockets directly. It asks a
//! [`Connector`] for a [`Transport`]: a sink of outbound text frames and a
//! stream of inbound ones. [`WsConnector`] is the production implementation
//! over `tokio-tungstenite`; tests plug in an in-memory one.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::future;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::error::TransportError;

/// Outbound half of an open transport
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of an open transport. The stream ends (or yields an error)
/// when the connection closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open, bidirectional text-frame connection
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports to an endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport. Errors are treated as a close of this attempt.
    async fn connect(&self, endpoint: &str) -> Result<Transport, TransportError>;
}

/// WebSocket connector over `tokio-tungstenite`
///
/// Only text frames are surfaced. Binary frames are ignored; ping/pong is
/// answered by tungstenite itself. TLS is whatever the tungstenite build
/// provides.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Transport, TransportError> {
        let (ws_stream, _response) = connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write.with(|text: String| {
            future::ready(Ok::<Message, TransportError>(Message::text(text)))
        });

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(frame = ?frame, "Received close frame");
                    Some(Err(TransportError::Closed))
                }
                Ok(Message::Binary(data)) => {
                    tracing::debug!(len = data.len(), "Ignoring binary frame");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
    }
}
