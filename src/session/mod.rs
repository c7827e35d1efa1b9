//! Real-Time Session
//!
//! One persistent WebSocket connection shared by every consumer in the
//! application, with capped exponential backoff reconnect, a keep-alive
//! heartbeat, and fan-out of inbound messages by type.
//!
//! ## Architecture
//!
//! - **Session**: public facade; cloned into every consumer
//! - **ConnectionManager**: single task that owns the connection state machine
//! - **ReconnectPolicy**: backoff delay per retry attempt
//! - **HeartbeatScheduler**: keep-alive frames while open
//! - **SubscriptionRegistry**: message type → callbacks, plus the `*` wildcard
//! - **Connector**: transport seam (`WsConnector` in production)
//!
//! ## Example
//!
//! ```rust,no_run
//! use agrolink::{Session, SessionConfig, WILDCARD};
//!
//! # async fn run() -> Result<(), agrolink::SessionError> {
//! let session = Session::start(&SessionConfig::new("ws://localhost:8080/ws"))?;
//! session.connect();
//!
//! let gavage = session.subscribe("gavage", |data| println!("gavage: {}", data));
//! let all = session.subscribe(WILDCARD, |envelope| println!("{}", envelope));
//!
//! session.send_message("lot_query", serde_json::json!({"lot": "A7"}))?;
//!
//! gavage.unsubscribe();
//! all.unsubscribe();
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod envelope;
mod error;
mod facade;
mod manager;
mod policy;
mod registry;
mod stats;
mod timers;
mod transport;

pub use envelope::{
    encode, heartbeat_frame, Envelope, OutboundMessage, HEARTBEAT_ACK_TYPE, HEARTBEAT_TYPE,
    WILDCARD,
};
pub use error::{DecodeError, SessionError, SessionResult, TransportError};
pub use facade::{Session, WeakSession};
pub use manager::ConnectionState;
pub use policy::ReconnectPolicy;
pub use registry::{DispatchReport, Subscription, SubscriptionRegistry};
pub use stats::SessionStats;
pub use transport::{Connector, FrameSink, FrameStream, Transport, WsConnector};
