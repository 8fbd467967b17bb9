// =============================================================================
// Shared Application State — handed to every axum handler
// =============================================================================
//
// The pipeline components own their own interior mutability; AppState only
// ties together the pieces the HTTP/WebSocket surface needs.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::broadcast::{SinkId, SubscriberRegistry, SubscriberSink};
use crate::market_data::CandleAggregator;
use crate::persistence::CandleStore;
use crate::runtime_config::RuntimeConfig;
use crate::types::UpdateEvent;

pub struct AppState {
    pub config: RuntimeConfig,
    pub registry: Arc<SubscriberRegistry>,
    pub aggregator: Arc<CandleAggregator>,
    pub store: Arc<dyn CandleStore>,
    /// Same channel the feed writes to; the coordinator is its only reader.
    pub events: mpsc::UnboundedSender<UpdateEvent>,
    /// Instant when the relay was started. Used for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        registry: Arc<SubscriberRegistry>,
        aggregator: Arc<CandleAggregator>,
        store: Arc<dyn CandleStore>,
        events: mpsc::UnboundedSender<UpdateEvent>,
    ) -> Self {
        Self {
            config,
            registry,
            aggregator,
            store,
            events,
            start_time: std::time::Instant::now(),
        }
    }

    /// Point `sink` at `symbol` and queue the symbol's in-progress bucket for
    /// the next delivery tick, so the new subscriber sees a candle without
    /// waiting for the next trade.
    ///
    /// The snapshot goes through the coordinator like any other live update:
    /// it is coalesced with pending updates and dropped if its bucket has
    /// closed in the meantime.
    pub fn subscribe(&self, id: SinkId, sink: Arc<dyn SubscriberSink>, symbol: &str) {
        self.registry.register(id, sink, symbol);

        if let Some(bucket) = self.aggregator.current(symbol) {
            if self.events.send(UpdateEvent::live(bucket.to_candle())).is_err() {
                debug!(sink = %id, symbol, "coordinator gone — snapshot not queued");
            }
        }
    }
}
