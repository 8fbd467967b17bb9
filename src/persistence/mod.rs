pub mod gateway;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::Candle;

pub use gateway::PersistenceGateway;
pub use sqlite::SqliteCandleStore;

/// Errors surfaced by a [`CandleStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored timestamp {0}ms")]
    InvalidTimestamp(i64),
}

/// Durable storage for closed candles.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Append one closed candle. Not idempotent: saving twice stores twice.
    async fn save(&self, candle: &Candle) -> Result<(), StoreError>;

    /// Delete every candle whose timestamp is strictly before `cutoff`.
    /// Returns the number of rows removed.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// All stored candles, optionally restricted to one symbol, ordered by
    /// timestamp ascending.
    async fn history(&self, symbol: Option<&str>) -> Result<Vec<Candle>, StoreError>;
}
