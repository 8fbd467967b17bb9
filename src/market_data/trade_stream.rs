// =============================================================================
// Trade Stream — upstream feed client and per-message processing
// =============================================================================
//
// Feed messages look like:
//   { "type": "trade", "data": [ { "s": "AAPL", "p": 187.3, "v": 100, "t": 1700000000000 } ] }
//
// Only `trade` messages carry ticks; `ping` and anything else is ignored.
// Undecodable messages and invalid ticks are logged and skipped; the read
// loop keeps going. Each element of `data` is decoded on its own, so one bad
// trade never costs the rest of its batch.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::aggregator::CandleAggregator;
use crate::persistence::PersistenceGateway;
use crate::runtime_config::RuntimeConfig;
use crate::types::{Tick, UpdateEvent};

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeedMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TradeData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: f64,
    #[serde(rename = "v", default)]
    volume: f64,
    #[serde(rename = "t")]
    timestamp_ms: i64,
}

impl TradeData {
    fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).context("malformed trade entry")
    }

    fn into_tick(self) -> Result<Tick> {
        anyhow::ensure!(
            self.price.is_finite() && self.price > 0.0,
            "invalid price {} for {}",
            self.price,
            self.symbol
        );
        anyhow::ensure!(
            self.volume.is_finite() && self.volume >= 0.0,
            "invalid volume {} for {}",
            self.volume,
            self.symbol
        );
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms)
            .with_context(|| format!("timestamp {} out of range", self.timestamp_ms))?;
        Ok(Tick {
            symbol: self.symbol,
            price: self.price,
            volume: self.volume,
            timestamp,
        })
    }
}

/// Decode one feed message. Non-trade messages decode to an empty list.
fn parse_feed_message(text: &str) -> Result<Vec<Result<Tick>>> {
    let msg: FeedMessage = serde_json::from_str(text).context("failed to parse feed JSON")?;
    if msg.kind != "trade" {
        return Ok(Vec::new());
    }
    Ok(msg
        .data
        .into_iter()
        .map(|entry| TradeData::from_value(entry)?.into_tick())
        .collect())
}

/// Subscribe frame sent once per symbol after connecting.
fn subscribe_frame(symbol: &str) -> String {
    serde_json::json!({ "type": "subscribe", "symbol": symbol }).to_string()
}

// ---------------------------------------------------------------------------
// FeedHandler — one feed message → aggregator → coordinator / persistence
// ---------------------------------------------------------------------------

/// Tally for one processed feed message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub ticks: usize,
    pub closed: usize,
    pub rejected: usize,
}

pub struct FeedHandler {
    aggregator: Arc<CandleAggregator>,
    events: mpsc::UnboundedSender<UpdateEvent>,
    persistence: PersistenceGateway,
    retention: Duration,
    prune_interval: Duration,
    last_prune: Option<DateTime<Utc>>,
}

impl FeedHandler {
    pub fn new(
        aggregator: Arc<CandleAggregator>,
        events: mpsc::UnboundedSender<UpdateEvent>,
        persistence: PersistenceGateway,
        retention: Duration,
        prune_interval: Duration,
    ) -> Self {
        Self {
            aggregator,
            events,
            persistence,
            retention,
            prune_interval,
            last_prune: None,
        }
    }

    /// Process one raw feed message received at `now`.
    ///
    /// Every closed candle is queued for persistence and forwarded before the
    /// live snapshot that follows it. Retention pruning is requested at the
    /// end of the cycle, at most once per prune interval.
    pub fn handle_message(&mut self, text: &str, now: DateTime<Utc>) -> CycleStats {
        let mut stats = CycleStats::default();

        match parse_feed_message(text) {
            Ok(ticks) => {
                for tick in ticks {
                    match tick {
                        Ok(tick) => {
                            if self.fold(&tick, &mut stats) {
                                stats.ticks += 1;
                            } else {
                                stats.rejected += 1;
                                warn!(
                                    symbol = %tick.symbol,
                                    timestamp = %tick.timestamp,
                                    "rejected trade tick: bucket close time out of range"
                                );
                            }
                        }
                        Err(e) => {
                            stats.rejected += 1;
                            warn!(error = %e, "rejected trade tick");
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to decode feed message"),
        }

        self.maybe_prune(now);
        stats
    }

    /// Returns `false` when the aggregator refused the tick.
    fn fold(&self, tick: &Tick, stats: &mut CycleStats) -> bool {
        let Some(folded) = self.aggregator.fold(tick) else {
            return false;
        };
        if let Some(closed) = &folded.closed {
            stats.closed += 1;
            self.persistence.save(closed.clone());
        }
        for event in folded.into_events() {
            if self.events.send(event).is_err() {
                debug!(symbol = %tick.symbol, "coordinator gone — update discarded");
            }
        }
        true
    }

    fn maybe_prune(&mut self, now: DateTime<Utc>) {
        let due = self
            .last_prune
            .map_or(true, |last| now - last >= self.prune_interval);
        if due {
            self.persistence.prune_older_than(now - self.retention);
            self.last_prune = Some(now);
        }
    }
}

// ---------------------------------------------------------------------------
// Feed WebSocket
// ---------------------------------------------------------------------------

fn feed_endpoint(config: &RuntimeConfig) -> String {
    if config.api_key.is_empty() {
        config.feed_url.clone()
    } else {
        format!("{}?token={}", config.feed_url, config.api_key)
    }
}

/// Connect once, subscribe to every configured symbol and process messages
/// until the stream ends, errors, or `shutdown` fires.
///
/// Returns `Ok(true)` on shutdown, `Ok(false)` when the upstream closed the
/// stream cleanly, so the caller can decide whether to reconnect.
pub async fn run_trade_stream(
    config: &RuntimeConfig,
    handler: &mut FeedHandler,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool> {
    info!(url = %config.feed_url, symbols = ?config.symbols, "connecting to trade feed");

    let (ws_stream, _response) = connect_async(feed_endpoint(config))
        .await
        .context("failed to connect to trade feed")?;

    info!("trade feed connected");
    let (mut write, mut read) = ws_stream.split();

    for symbol in &config.symbols {
        write
            .send(Message::Text(subscribe_frame(symbol)))
            .await
            .with_context(|| format!("failed to subscribe to {symbol}"))?;
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("trade feed stopping on shutdown");
                    return Ok(true);
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let stats = handler.handle_message(&text, Utc::now());
                        if stats.ticks > 0 || stats.rejected > 0 {
                            debug!(
                                ticks = stats.ticks,
                                closed = stats.closed,
                                rejected = stats.rejected,
                                "feed message processed"
                            );
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!(frame = ?frame, "trade feed sent close frame");
                        return Ok(false);
                    }
                    // Pings are answered by tungstenite; binary and pong
                    // frames carry nothing for us.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "trade feed read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!("trade feed stream ended");
                        return Ok(false);
                    }
                }
            }
        }
    }
}

/// Exponential backoff with a ceiling; resets after a successful session.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: std::time::Duration,
    max: std::time::Duration,
    current: std::time::Duration,
}

impl Backoff {
    pub fn new(base: std::time::Duration, max: std::time::Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay to wait now; the next call returns double (capped).
    pub fn next_delay(&mut self) -> std::time::Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Run the trade feed for the life of the process, reconnecting with
/// exponential backoff whenever the connection drops.
pub async fn run_trade_stream_with_reconnect(
    config: RuntimeConfig,
    mut handler: FeedHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(
        std::time::Duration::from_secs(config.reconnect_base_secs),
        std::time::Duration::from_secs(config.reconnect_max_secs),
    );

    loop {
        let started = tokio::time::Instant::now();
        match run_trade_stream(&config, &mut handler, &mut shutdown).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => error!(error = %e, "trade feed session failed"),
        }

        // A session that stayed up for a while counts as healthy.
        if started.elapsed() >= std::time::Duration::from_secs(config.reconnect_max_secs) {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        warn!(delay_secs = delay.as_secs(), "reconnecting to trade feed");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("trade feed task stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{CandleStore, SqliteCandleStore};
    use crate::types::UpdateType;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn parse_trade_message_ok() {
        let json = r#"{
            "type": "trade",
            "data": [
                { "c": ["1", "12"], "p": 187.25, "s": "AAPL", "t": 1700000000000, "v": 100 },
                { "p": 250.5, "s": "TSLA", "t": 1700000000500, "v": 3 }
            ]
        }"#;
        let ticks: Vec<Tick> = parse_feed_message(json)
            .unwrap()
            .into_iter()
            .map(|t| t.unwrap())
            .collect();

        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].symbol, "AAPL");
        assert!((ticks[0].price - 187.25).abs() < f64::EPSILON);
        assert_eq!(ticks[0].volume, 100.0);
        assert_eq!(ticks[1].timestamp, at_ms(1_700_000_000_500));
    }

    #[test]
    fn non_trade_messages_are_ignored() {
        assert!(parse_feed_message(r#"{"type":"ping"}"#).unwrap().is_empty());
        assert!(parse_feed_message(r#"{"type":"news","data":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn malformed_message_is_an_error() {
        assert!(parse_feed_message("not json").is_err());
        assert!(parse_feed_message(r#"{"data":[]}"#).is_err());
    }

    #[test]
    fn invalid_ticks_are_rejected_individually() {
        let json = r#"{"type":"trade","data":[
            {"p": -1.0, "s": "AAPL", "t": 0, "v": 1},
            {"p": 10.0, "s": "AAPL", "t": 0, "v": -5},
            {"p": 10.0, "s": "AAPL", "t": 0, "v": 5}
        ]}"#;
        let results = parse_feed_message(json).unwrap();
        assert!(results[0].is_err());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[test]
    fn structurally_bad_entry_does_not_drop_its_batch() {
        let json = r#"{"type":"trade","data":[
            {"s": "AAPL", "t": 0, "v": 1},
            {"p": "12.5", "s": "AAPL", "t": 0, "v": 1},
            {"p": 10.0, "s": "AAPL", "t": 1000, "v": 5},
            42
        ]}"#;
        let results = parse_feed_message(json).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results[0].is_err());
        assert!(results[1].is_err());
        assert!(results[3].is_err());
        let tick = results[2].as_ref().unwrap();
        assert_eq!(tick.price, 10.0);
        assert_eq!(tick.timestamp, at_ms(1000));
    }

    #[test]
    fn subscribe_frame_shape() {
        let v: serde_json::Value = serde_json::from_str(&subscribe_frame("NFLX")).unwrap();
        assert_eq!(v["type"], "subscribe");
        assert_eq!(v["symbol"], "NFLX");
    }

    #[test]
    fn feed_endpoint_appends_token() {
        let mut cfg = RuntimeConfig::default();
        assert_eq!(feed_endpoint(&cfg), "wss://ws.finnhub.io");
        cfg.api_key = "abc".into();
        assert_eq!(feed_endpoint(&cfg), "wss://ws.finnhub.io?token=abc");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(5),
        );
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        b.reset();
        assert_eq!(b.next_delay().as_secs(), 1);
    }

    #[tokio::test]
    async fn handler_forwards_events_and_persists_closes() {
        let store = Arc::new(SqliteCandleStore::connect("sqlite::memory:").await.unwrap());
        let (gateway, writer) = PersistenceGateway::spawn(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = Arc::new(CandleAggregator::new(
            Duration::seconds(60),
            &["AAPL".to_string()],
        ));
        let mut handler = FeedHandler::new(
            aggregator,
            tx,
            gateway,
            Duration::minutes(20),
            Duration::seconds(5),
        );

        let now = at_ms(0);
        let msg = r#"{"type":"trade","data":[
            {"s":"AAPL","p":100.0,"v":10,"t":0},
            {"s":"AAPL","p":105.0,"v":5,"t":30000},
            {"s":"AAPL","p":98.0,"v":1,"t":61000}
        ]}"#;
        let stats = handler.handle_message(msg, now);
        assert_eq!(stats, CycleStats { ticks: 3, closed: 1, rejected: 0 });

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        let kinds: Vec<UpdateType> = events.iter().map(|e| e.update_type).collect();
        assert_eq!(
            kinds,
            vec![
                UpdateType::Live,
                UpdateType::Live,
                UpdateType::Closed,
                UpdateType::Live
            ]
        );
        assert_eq!(events[1].candle.volume, 15.0);
        assert_eq!(events[2].candle.close, 105.0);
        assert_eq!(events[2].candle.high, 105.0);
        assert_eq!(events[2].candle.low, 100.0);

        drop(handler);
        writer.await.unwrap();

        let saved = store.history(Some("AAPL")).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].timestamp, at_ms(60_000));
    }

    #[tokio::test]
    async fn far_future_tick_is_rejected_and_feed_keeps_going() {
        let store = Arc::new(SqliteCandleStore::connect("sqlite::memory:").await.unwrap());
        let (gateway, writer) = PersistenceGateway::spawn(store);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = Arc::new(CandleAggregator::new(
            Duration::seconds(60),
            &["AAPL".to_string()],
        ));
        let mut handler = FeedHandler::new(
            aggregator.clone(),
            tx,
            gateway,
            Duration::minutes(20),
            Duration::seconds(5),
        );

        let msg = r#"{"type":"trade","data":[
            {"s":"AAPL","p":1.0,"v":1,"t":8210266876799999},
            {"s":"AAPL","p":2.0,"v":3,"t":0}
        ]}"#;
        let stats = handler.handle_message(msg, at_ms(0));
        assert_eq!(stats, CycleStats { ticks: 1, closed: 0, rejected: 1 });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.candle.close, 2.0);
        assert_eq!(event.candle.volume, 3.0);
        assert!(rx.try_recv().is_err());
        assert_eq!(aggregator.current("AAPL").unwrap().open_time, at_ms(0));

        let stats = handler.handle_message(
            r#"{"type":"trade","data":[{"s":"AAPL","p":4.0,"v":1,"t":1000}]}"#,
            at_ms(1000),
        );
        assert_eq!(stats.ticks, 1);

        drop(handler);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn prune_requests_are_rate_limited() {
        let store = Arc::new(SqliteCandleStore::connect("sqlite::memory:").await.unwrap());
        let (gateway, writer) = PersistenceGateway::spawn(store.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let aggregator = Arc::new(CandleAggregator::new(Duration::seconds(60), &[]));
        let mut handler = FeedHandler::new(
            aggregator,
            tx,
            gateway,
            Duration::minutes(20),
            Duration::seconds(5),
        );

        handler.handle_message(r#"{"type":"ping"}"#, at_ms(0));
        assert_eq!(handler.last_prune, Some(at_ms(0)));
        handler.handle_message(r#"{"type":"ping"}"#, at_ms(4_000));
        assert_eq!(handler.last_prune, Some(at_ms(0)));
        handler.handle_message("garbage", at_ms(5_000));
        assert_eq!(handler.last_prune, Some(at_ms(5_000)));

        drop(handler);
        writer.await.unwrap();
    }
}
