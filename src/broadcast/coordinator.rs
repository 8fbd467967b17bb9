// =============================================================================
// Update Coordinator — throttled fan-out of candle updates
// =============================================================================
//
// Live snapshots arrive once per trade, far faster than anyone can render
// them. The coordinator keeps one pending slot per symbol and flushes all of
// them on a fixed delivery tick. Closed candles skip the slots and go out the
// moment they arrive.
//
// The delivery tick is polled ahead of the event queue, so a backlog of
// incoming events can never hold back a flush.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use super::registry::SubscriberRegistry;
use crate::types::UpdateEvent;

pub struct UpdateCoordinator {
    registry: Arc<SubscriberRegistry>,
    pending: BTreeMap<String, UpdateEvent>,
    /// Close time of the last bucket closed per symbol.
    last_closed: HashMap<String, DateTime<Utc>>,
    delivery_interval: Duration,
}

impl UpdateCoordinator {
    pub fn new(registry: Arc<SubscriberRegistry>, delivery_interval: Duration) -> Self {
        Self {
            registry,
            pending: BTreeMap::new(),
            last_closed: HashMap::new(),
            delivery_interval,
        }
    }

    /// Take one event from the aggregator.
    ///
    /// A closed candle is delivered immediately and any pending live snapshot
    /// of that same bucket is discarded. A live snapshot overwrites whatever
    /// was pending for its symbol, unless its bucket has already closed.
    pub fn accept(&mut self, event: UpdateEvent) {
        if event.is_closed() {
            self.last_closed
                .insert(event.candle.symbol.clone(), event.candle.timestamp);
            let stale = self
                .pending
                .get(event.symbol())
                .is_some_and(|p| p.candle.timestamp <= event.candle.timestamp);
            if stale {
                self.pending.remove(event.symbol());
            }
            let report = self.registry.deliver(&event);
            debug!(
                symbol = %event.symbol(),
                delivered = report.delivered,
                dropped = report.dropped,
                "closed candle delivered"
            );
        } else if self
            .last_closed
            .get(event.symbol())
            .is_some_and(|closed_at| event.candle.timestamp <= *closed_at)
        {
            debug!(symbol = %event.symbol(), "live snapshot of a closed bucket dropped");
        } else {
            self.pending.insert(event.candle.symbol.clone(), event);
        }
    }

    /// Deliver every pending live snapshot once and clear the slots. Returns
    /// the number of symbols flushed.
    pub fn flush(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let flushed = pending.len();
        for event in pending.into_values() {
            self.registry.deliver(&event);
        }
        flushed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drive the coordinator until the event channel closes or `shutdown`
    /// flips to `true`. Nothing is sent after shutdown is observed.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<UpdateEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.delivery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.delivery_interval.as_millis() as u64,
            "update coordinator started"
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let flushed = self.flush();
                    if flushed > 0 {
                        debug!(symbols = flushed, "live updates flushed");
                    }
                }

                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => self.accept(event),
                        None => {
                            info!("event channel closed");
                            break;
                        }
                    }
                }
            }
        }

        info!(dropped_pending = self.pending_len(), "update coordinator stopped");
    }
}
