// =============================================================================
// WebSocket Handler — candle update subscribers
// =============================================================================
//
// Clients connect to `/ws` and send the symbol they want as a plain text
// message. From then on they receive `{ "updateType", "candle" }` JSON frames
// for that symbol only. Sending another symbol switches the subscription.
//
// Each connection is split into:
//   - a writer task draining a bounded outbound queue into the socket, and
//   - the reader loop below, which handles subscriptions and closes.
// The registry only ever sees the queue (`WsSink`), never the socket.
// Pings are answered by the WebSocket layer itself.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broadcast::{SinkError, SinkId, SubscriberSink};

// =============================================================================
// Sink
// =============================================================================

/// Registry-facing handle onto one connection's outbound queue.
pub struct WsSink {
    tx: mpsc::Sender<Message>,
}

impl WsSink {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }
}

impl SubscriberSink for WsSink {
    fn send(&self, payload: &str) -> Result<(), SinkError> {
        self.tx
            .try_send(Message::Text(payload.to_string()))
            .map_err(|e| match e {
                TrySendError::Full(_) => SinkError::Lagging,
                TrySendError::Closed(_) => SinkError::Closed,
            })
    }

    fn close(&self) {
        // Queue full or already closed: either way the writer is going away.
        let _ = self.tx.try_send(Message::Close(None));
    }
}

/// Normalise a subscription request. Blank messages are not subscriptions.
fn parse_subscription(text: &str) -> Option<String> {
    let symbol = text.trim();
    if symbol.is_empty() {
        None
    } else {
        Some(symbol.to_uppercase())
    }
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    debug!("subscriber WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let id = SinkId::next();
    info!(sink = %id, "subscriber connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.subscriber_queue);
    let sink: Arc<dyn SubscriberSink> = Arc::new(WsSink::new(tx));

    // ── Writer: queue → socket ──────────────────────────────────────────
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = sender.send(msg).await {
                debug!(sink = %id, error = %e, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // ── Reader: subscriptions and close ─────────────────────────────────
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let Some(symbol) = parse_subscription(&text) else {
                    debug!(sink = %id, "blank subscription message ignored");
                    continue;
                };
                state.subscribe(id, sink.clone(), &symbol);
            }
            Ok(Message::Close(_)) => {
                info!(sink = %id, "Close frame received");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
            Err(e) => {
                warn!(sink = %id, error = %e, "WebSocket receive error — disconnecting");
                break;
            }
        }
    }

    let last_symbol = state.registry.symbol_of(id);
    state.registry.unregister(id);
    drop(sink);
    writer.abort();
    info!(sink = %id, symbol = ?last_symbol, "subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_is_trimmed_and_uppercased() {
        assert_eq!(parse_subscription(" aapl\n").as_deref(), Some("AAPL"));
        assert_eq!(parse_subscription("TSLA").as_deref(), Some("TSLA"));
        assert!(parse_subscription("   ").is_none());
    }

    #[tokio::test]
    async fn ws_sink_reports_lagging_and_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = WsSink::new(tx);

        assert_eq!(sink.send("one"), Ok(()));
        assert_eq!(sink.send("two"), Err(SinkError::Lagging));

        match rx.recv().await {
            Some(Message::Text(t)) => assert_eq!(t, "one"),
            other => panic!("unexpected message: {other:?}"),
        }

        drop(rx);
        assert_eq!(sink.send("three"), Err(SinkError::Closed));
    }

    #[tokio::test]
    async fn ws_sink_close_queues_close_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = WsSink::new(tx);
        sink.close();
        assert!(matches!(rx.recv().await, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn ping_gets_exactly_one_pong_and_text_subscribes() {
        use crate::broadcast::SubscriberRegistry;
        use crate::market_data::CandleAggregator;
        use crate::persistence::SqliteCandleStore;
        use crate::runtime_config::RuntimeConfig;
        use std::time::Duration;
        use tokio_tungstenite::tungstenite::Message as ClientMessage;

        let store = Arc::new(SqliteCandleStore::connect("sqlite::memory:").await.unwrap());
        let registry = Arc::new(SubscriberRegistry::new());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AppState::new(
            RuntimeConfig::default(),
            registry.clone(),
            Arc::new(CandleAggregator::new(chrono::Duration::seconds(60), &[])),
            store,
            events_tx,
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, crate::api::rest::router(state)).await.unwrap();
        });

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        client.send(ClientMessage::Ping(b"hb".to_vec())).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, ClientMessage::Pong(b"hb".to_vec()));
        assert!(
            tokio::time::timeout(Duration::from_millis(200), client.next())
                .await
                .is_err(),
            "no second frame expected after the pong"
        );

        client.send(ClientMessage::Text(" aapl ".into())).await.unwrap();
        let mut registered = false;
        for _ in 0..50 {
            if registry.len() == 1 {
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registered);

        client.close(None).await.unwrap();
        for _ in 0..50 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());
        server.abort();
    }
}
