// =============================================================================
// Shared types used across the candle relay
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A finalized (or snapshotted) OHLCV candle.
///
/// `timestamp` is the close instant of the bucket the candle describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    #[serde(default)]
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// A single trade observed on the upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// Whether an update describes a bucket that is still open or one that has
/// just been finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Live,
    Closed,
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Candle lifecycle event flowing from the aggregator to subscribers.
///
/// Serialises to the subscriber wire format:
/// ```json
/// { "updateType": "live", "candle": { "symbol": "AAPL", "open": 100.0, ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEvent {
    pub update_type: UpdateType,
    pub candle: Candle,
}

impl UpdateEvent {
    pub fn live(candle: Candle) -> Self {
        Self {
            update_type: UpdateType::Live,
            candle,
        }
    }

    pub fn closed(candle: Candle) -> Self {
        Self {
            update_type: UpdateType::Closed,
            candle,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.candle.symbol
    }

    pub fn is_closed(&self) -> bool {
        self.update_type == UpdateType::Closed
    }
}
