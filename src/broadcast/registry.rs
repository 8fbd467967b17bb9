// =============================================================================
// Subscriber Registry — sink → symbol routing table
// =============================================================================
//
// A subscriber is an opaque sink with one symbol filter. Fan-out snapshots the
// matching sinks under the lock, releases it, sends, and only then removes the
// sinks whose send failed. The lock is never held while sending.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::UpdateEvent;

// ---------------------------------------------------------------------------
// Sink capability
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("subscriber connection closed")]
    Closed,
    #[error("subscriber outbound queue full")]
    Lagging,
}

/// Outbound half of one subscriber connection.
pub trait SubscriberSink: Send + Sync {
    /// Queue a text payload. Must not block.
    fn send(&self, payload: &str) -> Result<(), SinkError>;

    /// Ask the connection to close. Best effort.
    fn close(&self);
}

/// Process-unique identity of a subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl SinkId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Subscription {
    symbol: String,
    sink: Arc<dyn SubscriberSink>,
}

/// Counts from one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    subscriptions: Mutex<HashMap<SinkId, Subscription>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `sink` to `symbol`, replacing any earlier subscription it had.
    pub fn register(&self, id: SinkId, sink: Arc<dyn SubscriberSink>, symbol: impl Into<String>) {
        let symbol = symbol.into();
        let previous = self.subscriptions.lock().insert(
            id,
            Subscription {
                symbol: symbol.clone(),
                sink,
            },
        );
        match previous {
            Some(prev) if prev.symbol != symbol => {
                info!(sink = %id, from = %prev.symbol, to = %symbol, "subscriber switched symbol")
            }
            Some(_) => {}
            None => info!(sink = %id, symbol = %symbol, "subscriber registered"),
        }
    }

    /// Remove `id`. Returns whether it was registered.
    pub fn unregister(&self, id: SinkId) -> bool {
        let removed = self.subscriptions.lock().remove(&id).is_some();
        if removed {
            info!(sink = %id, "subscriber unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The symbol `id` is currently subscribed to.
    pub fn symbol_of(&self, id: SinkId) -> Option<String> {
        self.subscriptions.lock().get(&id).map(|s| s.symbol.clone())
    }

    /// Send `event` to every sink subscribed to the event's symbol and drop
    /// the ones that fail.
    pub fn deliver(&self, event: &UpdateEvent) -> DeliveryReport {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(symbol = %event.symbol(), error = %e, "failed to serialise update");
                return DeliveryReport::default();
            }
        };

        let targets: Vec<(SinkId, Arc<dyn SubscriberSink>)> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, sub)| sub.symbol == event.symbol())
            .map(|(id, sub)| (*id, sub.sink.clone()))
            .collect();

        let mut report = DeliveryReport::default();
        let mut failed = Vec::new();
        for (id, sink) in targets {
            match sink.send(&payload) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(sink = %id, error = %e, "send failed — dropping subscriber");
                    sink.close();
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut subs = self.subscriptions.lock();
            for id in &failed {
                subs.remove(id);
            }
            report.dropped = failed.len();
            warn!(
                symbol = %event.symbol(),
                kind = %event.update_type,
                dropped = report.dropped,
                "removed failing subscribers"
            );
        }

        report
    }

    /// Close and forget every subscriber. Used on shutdown.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Subscription> = {
            let mut subs = self.subscriptions.lock();
            subs.drain().map(|(_, sub)| sub).collect()
        };
        for sub in &drained {
            sub.sink.close();
        }
        drained.len()
    }
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------
