//! Reconciliation pipeline
//!
//! Wires the aggregator and the price store together:
//!
//! ```text
//! poller ──batches──▶ fan-out ──▶ chain writer
//!                        └──────▶ store consumer
//! listener ──confirmed prices──▶ store
//! ```
//!
//! Every task watches the same [`ShutdownSignal`].

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregator::FeedAggregator;
use crate::shutdown::ShutdownSignal;
use crate::store::PriceStore;
use crate::types::Price;

pub struct Pipeline {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    /// Spawn every pipeline task; each channel holds `capacity` items
    pub fn spawn(
        aggregator: FeedAggregator,
        store: Arc<PriceStore>,
        shutdown: ShutdownSignal,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let (market_tx, market_rx) = mpsc::channel::<Vec<Price>>(capacity);
        let (writer_tx, writer_rx) = mpsc::channel::<Vec<Price>>(capacity);
        let (store_tx, store_rx) = mpsc::channel::<Vec<Price>>(capacity);
        let (confirmed_tx, confirmed_rx) = mpsc::channel::<Price>(capacity);

        let mut tasks = Vec::with_capacity(6);

        tasks.push(("poller", {
            let aggregator = aggregator.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                aggregator.update_price_from_api(market_tx, shutdown).await;
            })
        }));

        tasks.push((
            "fan-out",
            tokio::spawn(fan_out(market_rx, writer_tx, store_tx, shutdown.clone())),
        ));

        tasks.push(("writer", {
            let aggregator = aggregator.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                aggregator.write_prices_to_chain(writer_rx, shutdown).await;
            })
        }));

        tasks.push(("listener", {
            let aggregator = aggregator.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                aggregator
                    .listen_on_chain_price_update(confirmed_tx, shutdown)
                    .await;
            })
        }));

        tasks.push(("confirmed", {
            let store = store.clone();
            tokio::spawn(async move { store.track_confirmed(confirmed_rx).await })
        }));

        tasks.push(("store", {
            tokio::spawn(async move { store.run(store_rx, shutdown).await })
        }));

        info!(source = aggregator.source_name(), tasks = tasks.len(), "🚀 Pipeline started");
        Self { tasks }
    }

    /// Wait for every task to finish
    pub async fn join(self) {
        for (name, task) in self.tasks {
            match task.await {
                Ok(()) => debug!(task = name, "Task finished"),
                Err(e) => error!(task = name, error = %e, "❌ Task failed"),
            }
        }
        info!("🛑 Pipeline stopped");
    }
}

/// Copy each market batch to the writer and the store.
///
/// The store always gets the batch; a busy writer skips it, the next batch
/// supersedes it.
async fn fan_out(
    mut rx: mpsc::Receiver<Vec<Price>>,
    writer: mpsc::Sender<Vec<Price>>,
    store: mpsc::Sender<Vec<Price>>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let batch = tokio::select! {
            _ = shutdown.cancelled() => return,
            batch = rx.recv() => match batch {
                Some(batch) => batch,
                None => {
                    debug!("Market stream closed");
                    return;
                }
            },
        };

        match writer.try_send(batch.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("⏭️ Chain writer busy, batch skipped"),
            Err(TrySendError::Closed(_)) => debug!("Chain writer gone"),
        }

        if store.send(batch).await.is_err() {
            debug!("Store consumer gone");
            return;
        }
    }
}
