// =============================================================================
// Candle Aggregator — folds trade ticks into per-symbol OHLCV buckets
// =============================================================================
//
// Each symbol owns one in-progress bucket. A bucket opens on the first tick
// seen after the previous bucket's close time and stays open for exactly
// `bucket_len`. Boundaries are anchored to that first tick, not to wall-clock
// minutes.
//
// Locking:
//   - The slot map is behind a parking_lot::RwLock and is only write-locked
//     the first time a symbol is seen.
//   - Every slot has its own Mutex, so folds for different symbols never
//     contend with each other.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::types::{Candle, Tick, UpdateEvent};

// ---------------------------------------------------------------------------
// In-progress bucket
// ---------------------------------------------------------------------------

/// Mutable OHLCV accumulator for the current window of one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct InProgressCandle {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open_price: f64,
    pub close_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub volume: f64,
}

impl InProgressCandle {
    /// Open a new bucket seeded entirely from `tick`, including its volume.
    /// `None` when the close time is not representable.
    fn open(tick: &Tick, bucket_len: Duration) -> Option<Self> {
        let close_time = tick.timestamp.checked_add_signed(bucket_len)?;
        Some(Self {
            symbol: tick.symbol.clone(),
            open_time: tick.timestamp,
            close_time,
            open_price: tick.price,
            close_price: tick.price,
            high_price: tick.price,
            low_price: tick.price,
            volume: tick.volume,
        })
    }

    fn apply(&mut self, tick: &Tick) {
        self.close_price = tick.price;
        self.high_price = self.high_price.max(tick.price);
        self.low_price = self.low_price.min(tick.price);
        self.volume += tick.volume;
    }

    /// True when `at` lies strictly after this bucket's close time.
    fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        at > self.close_time
    }

    /// Immutable snapshot stamped with the bucket's close time.
    pub fn to_candle(&self) -> Candle {
        Candle {
            symbol: self.symbol.clone(),
            open: self.open_price,
            close: self.close_price,
            high: self.high_price,
            low: self.low_price,
            volume: self.volume,
            timestamp: self.close_time,
        }
    }
}

// ---------------------------------------------------------------------------
// Fold result
// ---------------------------------------------------------------------------

/// Outcome of folding a single tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Folded {
    /// The previous bucket, if this tick closed it.
    pub closed: Option<Candle>,
    /// Snapshot of the bucket the tick landed in.
    pub live: Candle,
}

impl Folded {
    /// Events in emission order: the close (if any) always precedes the live
    /// snapshot of the new bucket.
    pub fn into_events(self) -> Vec<UpdateEvent> {
        let mut events = Vec::with_capacity(2);
        if let Some(closed) = self.closed {
            events.push(UpdateEvent::closed(closed));
        }
        events.push(UpdateEvent::live(self.live));
        events
    }
}

// ---------------------------------------------------------------------------
// CandleAggregator
// ---------------------------------------------------------------------------

type Slot = Arc<Mutex<Option<InProgressCandle>>>;

pub struct CandleAggregator {
    bucket_len: Duration,
    slots: RwLock<HashMap<String, Slot>>,
}

impl CandleAggregator {
    /// Create an aggregator with pre-allocated slots for `symbols`. Symbols
    /// outside this list still work; their slot is created on first use.
    pub fn new(bucket_len: Duration, symbols: &[String]) -> Self {
        let slots = symbols
            .iter()
            .map(|s| (s.clone(), Arc::new(Mutex::new(None))))
            .collect();
        Self {
            bucket_len,
            slots: RwLock::new(slots),
        }
    }

    pub fn bucket_len(&self) -> Duration {
        self.bucket_len
    }

    fn slot(&self, symbol: &str) -> Slot {
        if let Some(slot) = self.slots.read().get(symbol) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Fold one tick into its symbol's bucket.
    ///
    /// Ticks timestamped before the bucket's open time are folded in as long
    /// as they are not past its close time. A tick past the close time always
    /// finalizes the bucket and opens a new one at the tick's own timestamp,
    /// even if it arrived out of order.
    ///
    /// Returns `None`, leaving the symbol's state untouched, when the tick
    /// would open a bucket whose close time overflows the calendar.
    pub fn fold(&self, tick: &Tick) -> Option<Folded> {
        let slot = self.slot(&tick.symbol);
        let mut current = slot.lock();

        if let Some(bucket) = current.as_mut() {
            if !bucket.is_expired_at(tick.timestamp) {
                bucket.apply(tick);
                return Some(Folded {
                    closed: None,
                    live: bucket.to_candle(),
                });
            }
        }

        let fresh = InProgressCandle::open(tick, self.bucket_len)?;
        let live = fresh.to_candle();
        let closed = current.replace(fresh).map(|prev| prev.to_candle());
        if let Some(c) = &closed {
            debug!(
                symbol = %c.symbol,
                open = c.open,
                close = c.close,
                volume = c.volume,
                "bucket closed"
            );
        }
        Some(Folded { closed, live })
    }

    /// Copy of the in-progress bucket for `symbol`, if one is open.
    pub fn current(&self, symbol: &str) -> Option<InProgressCandle> {
        let slot = self.slots.read().get(symbol).cloned()?;
        let guard = slot.lock();
        guard.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
