//! Session counters

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by the connection manager task
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    pub connect_attempts: AtomicU64,
    pub transports_opened: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub sends_dropped: AtomicU64,
    pub decode_errors: AtomicU64,
    pub callback_panics: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub reconnects_scheduled: AtomicU64,
}

impl SessionCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            transports_opened: self.transports_opened.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Transport opens requested (initial connect and every retry)
    pub connect_attempts: u64,
    /// Transports that reached `OPEN`
    pub transports_opened: u64,
    /// Caller frames handed to an open transport (heartbeats excluded)
    pub frames_sent: u64,
    /// Inbound text frames, decodable or not
    pub frames_received: u64,
    /// Caller frames dropped because the connection was not open
    pub sends_dropped: u64,
    /// Inbound frames dropped as undecodable
    pub decode_errors: u64,
    /// Subscriber callbacks that panicked
    pub callback_panics: u64,
    pub heartbeats_sent: u64,
    pub reconnects_scheduled: u64,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionStats {{ connects: {}/{}, sent: {}, received: {}, dropped: {}, decode_errors: {}, panics: {}, heartbeats: {}, reconnects: {} }}",
            self.transports_opened,
            self.connect_attempts,
            self.frames_sent,
            self.frames_received,
            self.sends_dropped,
            self.decode_errors,
            self.callback_panics,
            self.heartbeats_sent,
            self.reconnects_scheduled
        )
    }
}
