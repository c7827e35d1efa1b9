//! # Agrolink
//!
//! Real-time session manager for the traceability suite: a single persistent
//! WebSocket connection shared across the whole application, kept alive
//! across consumer churn, recovered with bounded exponential backoff, and
//! fanned out to many independent subscribers keyed by message type.
//!
//! ## Features
//!
//! - **One connection**: every consumer clones the same [`Session`]
//! - **Recovery**: capped exponential backoff up to a maximum attempt count
//! - **Keep-alive**: `{"type":"heartbeat"}` on a fixed period while open
//! - **Fan-out**: exact-type and wildcard subscribers, removable by handle
//! - **Observable state**: `is_connected()`, `watch_state()`, `last_message()`
//!
//! ## Modules
//!
//! - [`session`]: connection manager, subscription registry and facade
//! - [`config`]: TOML and environment configuration

pub mod config;
pub mod session;

pub use session::{
    ConnectionState, Connector, DecodeError, Envelope, ReconnectPolicy, Session, SessionError,
    SessionResult, SessionStats, Subscription, SubscriptionRegistry, Transport, TransportError,
    WeakSession, WsConnector, HEARTBEAT_ACK_TYPE, HEARTBEAT_TYPE, WILDCARD,
};

pub use config::{generate_default_config, Config, ConfigError, LoggingConfig, SessionConfig};
