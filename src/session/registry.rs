//! Subscription Registry
//!
//! Maps a message type to the callbacks interested in it, plus the reserved
//! [`WILDCARD`] key that sees every message. Registrations are identified by
//! token, not by callback identity: registering the same closure twice gives
//! two entries, each removed only through its own [`Subscription`] handle.
//!
//! Exact-type subscribers receive `envelope.data`. Wildcard subscribers
//! receive the whole envelope.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;

use super::envelope::{Envelope, WILDCARD};

/// A registered callback, always invoked with the full envelope
type Callback = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct Entry {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    entries: Mutex<HashMap<String, Vec<Entry>>>,
}

impl RegistryInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Vec<Entry>>> {
        // The lock is never held across a callback, so poisoning can only
        // come from an allocation panic; the map itself is still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, key: &str, id: u64) {
        let mut entries = self.entries();
        if let Some(list) = entries.get_mut(key) {
            list.retain(|entry| entry.id != id);
            // Clean up empty type entries
            if list.is_empty() {
                entries.remove(key);
            }
        }
    }
}

/// Shared registry of message-type subscriptions
///
/// Cheap to clone; all clones see the same registrations.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

/// Outcome of dispatching one envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Callbacks that ran to completion
    pub delivered: usize,
    /// Callbacks that panicked
    pub panicked: usize,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `msg_type`.
    ///
    /// For an exact type the callback receives the envelope's `data`. For
    /// [`WILDCARD`] it receives the envelope itself as a JSON object with
    /// `type`, `data` and `receivedAt`.
    pub fn subscribe<F>(&self, msg_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let callback: Callback = if msg_type == WILDCARD {
            Arc::new(move |envelope: &Envelope| callback(&envelope.to_value()))
        } else {
            Arc::new(move |envelope: &Envelope| callback(&envelope.data))
        };
        self.register(msg_type, callback)
    }

    /// Register a wildcard callback that receives the typed envelope
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.register(WILDCARD, Arc::new(callback))
    }

    fn register(&self, msg_type: &str, callback: Callback) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));

        if msg_type.is_empty() {
            tracing::warn!("Ignoring subscription with an empty message type");
            active.store(false, Ordering::SeqCst);
            return Subscription {
                msg_type: String::new(),
                id: 0,
                active,
                registry: Weak::new(),
            };
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .entries()
            .entry(msg_type.to_string())
            .or_default()
            .push(Entry {
                id,
                active: Arc::clone(&active),
                callback,
            });

        tracing::debug!(msg_type = %msg_type, subscription_id = id, "Subscribed");

        Subscription {
            msg_type: msg_type.to_string(),
            id,
            active,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke every live callback for the envelope's type, then every live
    /// wildcard callback.
    ///
    /// A panicking callback is logged and skipped; the rest still run.
    pub fn dispatch(&self, envelope: &Envelope) -> DispatchReport {
        let targets: Vec<(Arc<AtomicBool>, Callback)> = {
            let entries = self.inner.entries();
            let exact = if envelope.msg_type == WILDCARD {
                None
            } else {
                entries.get(&envelope.msg_type)
            };
            exact
                .into_iter()
                .chain(entries.get(WILDCARD))
                .flatten()
                .map(|entry| (Arc::clone(&entry.active), Arc::clone(&entry.callback)))
                .collect()
        };

        let mut report = DispatchReport::default();
        for (active, callback) in targets {
            // Unsubscribed after the snapshot was taken
            if !active.load(Ordering::SeqCst) {
                continue;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| callback(envelope))) {
                Ok(()) => report.delivered += 1,
                Err(payload) => {
                    report.panicked += 1;
                    tracing::error!(
                        msg_type = %envelope.msg_type,
                        panic = %panic_message(payload.as_ref()),
                        "Subscriber callback panicked"
                    );
                }
            }
        }

        if report.delivered + report.panicked > 0 {
            tracing::trace!(
                msg_type = %envelope.msg_type,
                subscribers = report.delivered + report.panicked,
                "Dispatched message"
            );
        }

        report
    }

    /// Number of live registrations under `msg_type`
    pub fn subscriber_count(&self, msg_type: &str) -> usize {
        self.inner
            .entries()
            .get(msg_type)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Number of distinct keys with at least one registration
    pub fn type_count(&self) -> usize {
        self.inner.entries().len()
    }

    /// Drop every registration. Outstanding handles become no-ops.
    pub fn clear(&self) {
        let drained: Vec<Entry> = self.inner.entries().drain().flat_map(|(_, v)| v).collect();
        for entry in drained {
            entry.active.store(false, Ordering::SeqCst);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to one registration
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
#[must_use = "the subscription can only be removed through this handle"]
pub struct Subscription {
    msg_type: String,
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    /// Remove the registration. Calling it again is a no-op.
    ///
    /// Once this returns, no dispatch that reaches the callback afterwards
    /// invokes it, including one already in progress on the same task. An
    /// invocation running concurrently on another thread may still finish.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            inner.remove(&self.msg_type, self.id);
            tracing::debug!(msg_type = %self.msg_type, subscription_id = self.id, "Unsubscribed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("msg_type", &self.msg_type)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
