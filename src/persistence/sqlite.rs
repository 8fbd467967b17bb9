// =============================================================================
// SQLite candle store
// =============================================================================
//
// One row per closed candle. Timestamps are stored as integer milliseconds so
// that range comparisons in SQL are numeric rather than textual.
// =============================================================================

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::{CandleStore, StoreError};
use crate::types::Candle;

type CandleRow = (String, f64, f64, f64, f64, f64, i64);

pub struct SqliteCandleStore {
    pool: SqlitePool,
}

impl SqliteCandleStore {
    /// Open (creating if missing) the database at `url` and make sure the
    /// schema exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // In-memory databases are per-connection, so keep a single one.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url = %url, "candle store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                timestamp_ms INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_candles_timestamp ON candles (timestamp_ms);")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn row_to_candle(row: CandleRow) -> Result<Candle, StoreError> {
    let (symbol, open, high, low, close, volume, ts_ms) = row;
    let timestamp =
        DateTime::<Utc>::from_timestamp_millis(ts_ms).ok_or(StoreError::InvalidTimestamp(ts_ms))?;
    Ok(Candle {
        symbol,
        open,
        close,
        high,
        low,
        volume,
        timestamp,
    })
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn save(&self, candle: &Candle) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO candles (symbol, open, high, low, close, volume, timestamp_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&candle.symbol)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .bind(candle.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!(symbol = %candle.symbol, timestamp = %candle.timestamp, "candle saved");
        Ok(())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM candles WHERE timestamp_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn history(&self, symbol: Option<&str>) -> Result<Vec<Candle>, StoreError> {
        let rows: Vec<CandleRow> = match symbol {
            Some(sym) => {
                sqlx::query_as(
                    r#"
                    SELECT symbol, open, high, low, close, volume, timestamp_ms
                    FROM candles
                    WHERE symbol = ?
                    ORDER BY timestamp_ms ASC, id ASC
                    "#,
                )
                .bind(sym)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT symbol, open, high, low, close, volume, timestamp_ms
                    FROM candles
                    ORDER BY timestamp_ms ASC, id ASC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(row_to_candle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn memory_store() -> SqliteCandleStore {
        SqliteCandleStore::connect("sqlite::memory:").await.unwrap()
    }

    fn candle(symbol: &str, close: f64, ts: DateTime<Utc>) -> Candle {
        Candle {
            symbol: symbol.into(),
            open: close - 1.0,
            close,
            high: close + 1.0,
            low: close - 2.0,
            volume: 12.5,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn save_and_read_back_in_timestamp_order() {
        let store = memory_store().await;
        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        store.save(&candle("AAPL", 3.0, base + Duration::minutes(2))).await.unwrap();
        store.save(&candle("AAPL", 1.0, base)).await.unwrap();
        store.save(&candle("TSLA", 9.0, base + Duration::minutes(1))).await.unwrap();

        let aapl = store.history(Some("AAPL")).await.unwrap();
        assert_eq!(aapl.len(), 2);
        assert_eq!(aapl[0].close, 1.0);
        assert_eq!(aapl[1].close, 3.0);
        assert_eq!(aapl[0].volume, 12.5);
        assert_eq!(aapl[0].timestamp, base);

        let all = store.history(None).await.unwrap();
        let symbols: Vec<_> = all.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAPL", "TSLA", "AAPL"]);
    }

    #[tokio::test]
    async fn prune_removes_exactly_older_rows() {
        let store = memory_store().await;
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let cutoff = now - Duration::minutes(20);

        store.save(&candle("AAPL", 1.0, cutoff - Duration::minutes(5))).await.unwrap();
        store.save(&candle("AAPL", 2.0, cutoff - Duration::milliseconds(1))).await.unwrap();
        store.save(&candle("AAPL", 3.0, cutoff)).await.unwrap();
        store.save(&candle("AAPL", 4.0, now)).await.unwrap();

        let removed = store.prune_older_than(cutoff).await.unwrap();
        assert_eq!(removed, 2);

        let remaining: Vec<f64> = store
            .history(None)
            .await
            .unwrap()
            .iter()
            .map(|c| c.close)
            .collect();
        assert_eq!(remaining, vec![3.0, 4.0]);
    }

    #[tokio::test]
    async fn unknown_symbol_history_is_empty() {
        let store = memory_store().await;
        assert!(store.history(Some("NOPE")).await.unwrap().is_empty());
    }
}
