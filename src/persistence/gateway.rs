// =============================================================================
// Persistence Gateway — non-blocking write path for closed candles
// =============================================================================
//
// The feed loop must never wait on the database. Saves and prunes are queued
// onto a dedicated writer task that applies them in order. Store failures are
// logged and dropped; nothing is retried.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::CandleStore;
use crate::types::Candle;

#[derive(Debug)]
enum PersistCommand {
    Save(Candle),
    Prune(DateTime<Utc>),
}

/// Cheap, cloneable handle onto the persistence writer task.
#[derive(Clone)]
pub struct PersistenceGateway {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistenceGateway {
    /// Spawn the writer task. It runs until every gateway handle is dropped.
    pub fn spawn(store: Arc<dyn CandleStore>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(store, rx));
        (Self { tx }, handle)
    }

    /// Queue a closed candle for durable write.
    pub fn save(&self, candle: Candle) {
        if self.tx.send(PersistCommand::Save(candle)).is_err() {
            warn!("persistence writer stopped — closed candle dropped");
        }
    }

    /// Queue deletion of every candle older than `cutoff`.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) {
        if self.tx.send(PersistCommand::Prune(cutoff)).is_err() {
            warn!("persistence writer stopped — prune skipped");
        }
    }
}

async fn run_writer(store: Arc<dyn CandleStore>, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
    info!("persistence writer started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            PersistCommand::Save(candle) => {
                if let Err(e) = store.save(&candle).await {
                    error!(
                        symbol = %candle.symbol,
                        timestamp = %candle.timestamp,
                        error = %e,
                        "failed to save closed candle"
                    );
                }
            }
            PersistCommand::Prune(cutoff) => match store.prune_older_than(cutoff).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, cutoff = %cutoff, "old candles pruned"),
                Err(e) => error!(cutoff = %cutoff, error = %e, "failed to prune old candles"),
            },
        }
    }

    info!("persistence writer stopped");
}
