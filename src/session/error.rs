//! Session error types
//!
//! Defines the errors that can occur while decoding frames, driving the
//! transport, or using the session facade.

use thiserror::Error;

use crate::config::ConfigError;

/// An inbound frame that could not be turned into an envelope
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Frame text was not valid JSON
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame decoded to something other than a JSON object
    #[error("Frame is not a JSON object")]
    NotAnObject,

    /// Object has no string `type` field
    #[error("Frame has no string `type` field")]
    MissingType,

    /// `type` field is the empty string
    #[error("Frame has an empty `type` field")]
    EmptyType,
}

/// Errors raised by the underlying transport
///
/// These are never fatal: the connection manager treats every one of them
/// as an ordinary close of the current attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Opening the connection failed
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Reading or writing an open connection failed
    #[error("Transport I/O error: {0}")]
    Io(String),

    /// The peer closed the connection
    #[error("Connection closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// Errors surfaced to callers of the session facade
#[derive(Error, Debug)]
pub enum SessionError {
    /// The outbound payload could not be serialized
    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// The session has already been shut down
    #[error("Session has been shut down")]
    ShutDown,

    /// Started outside a tokio runtime
    #[error("Session must be started inside a tokio runtime")]
    NoRuntime,

    /// Configuration was rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;
