//! In-memory chain doubles
//!
//! Used for dry runs and for exercising the pipeline without a node.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};

use crate::chain::{PriceChanged, PriceChangedSubscription, PriceContract, ReferenceOracle, WriteReceipt};
use crate::error::FeedError;
use crate::types::normalize_symbol;

const EVENT_CAPACITY: usize = 256;

/// Contract double: writes land in a map and are echoed as `PriceChanged` events
pub struct InMemoryPriceContract {
    prices: RwLock<HashMap<String, i64>>,
    writes: RwLock<Vec<(String, i64)>>,
    failing: RwLock<HashSet<String>>,
    events: broadcast::Sender<Result<PriceChanged, FeedError>>,
    subscribe_failures: AtomicUsize,
}

impl Default for InMemoryPriceContract {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPriceContract {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            prices: RwLock::new(HashMap::new()),
            writes: RwLock::new(Vec::new()),
            failing: RwLock::new(HashSet::new()),
            events,
            subscribe_failures: AtomicUsize::new(0),
        }
    }

    /// Seed contract state without emitting an event
    pub async fn seed(&self, symbol: &str, scaled_price: i64) {
        self.prices
            .write()
            .await
            .insert(normalize_symbol(symbol), scaled_price);
    }

    /// Make every write for `symbol` revert
    pub async fn fail_writes_for(&self, symbol: &str) {
        self.failing.write().await.insert(normalize_symbol(symbol));
    }

    /// Make the next `count` subscription attempts fail
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.subscribe_failures.store(count, Ordering::SeqCst);
    }

    /// Publish an arbitrary event to current subscribers
    pub fn emit(&self, event: PriceChanged) {
        self.emit_raw(Ok(event));
    }

    /// Publish a stream item as is, e.g. a log that fails to decode
    pub fn emit_raw(&self, item: Result<PriceChanged, FeedError>) {
        let _ = self.events.send(item);
    }

    /// Number of live event subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Successful writes in submission order
    pub async fn writes(&self) -> Vec<(String, i64)> {
        self.writes.read().await.clone()
    }
}

#[async_trait]
impl PriceContract for InMemoryPriceContract {
    async fn get_price(&self, symbol: &str) -> Result<i64, FeedError> {
        Ok(self
            .prices
            .read()
            .await
            .get(&normalize_symbol(symbol))
            .copied()
            .unwrap_or(0))
    }

    async fn set_price(&self, symbol: &str, scaled_price: i64) -> Result<WriteReceipt, FeedError> {
        let symbol = normalize_symbol(symbol);
        if self.failing.read().await.contains(&symbol) {
            return Err(FeedError::write(&symbol, "execution reverted"));
        }

        self.prices.write().await.insert(symbol.clone(), scaled_price);
        let nonce = {
            let mut writes = self.writes.write().await;
            writes.push((symbol.clone(), scaled_price));
            writes.len()
        };
        info!(symbol = %symbol, price = scaled_price, "📝 Dry-run write recorded");

        self.emit(PriceChanged {
            symbol,
            new_price: scaled_price,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
        });

        Ok(WriteReceipt {
            tx_hash: format!("memory-{}", nonce),
            block_number: Some(nonce as u64),
        })
    }

    async fn watch_price_changed(&self) -> Result<PriceChangedSubscription, FeedError> {
        let pending_failures = self.subscribe_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.subscribe_failures
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(FeedError::Subscription("node refused subscription".to_string()));
        }

        let mut source = self.events.subscribe();
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(item) => {
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "In-memory subscriber lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = tx
                            .send(Err(FeedError::Subscription("event source closed".to_string())))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(PriceChangedSubscription::new(rx, Some(task)))
    }
}

/// Reference oracle double returning fixed prices and counting calls
#[derive(Default)]
pub struct StaticReferenceOracle {
    prices: RwLock<HashMap<String, i64>>,
    calls: AtomicUsize,
}

impl StaticReferenceOracle {
    pub fn new(prices: impl IntoIterator<Item = (String, i64)>) -> Self {
        Self {
            prices: RwLock::new(
                prices
                    .into_iter()
                    .map(|(symbol, price)| (normalize_symbol(&symbol), price))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `latest_price` calls served so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferenceOracle for StaticReferenceOracle {
    async fn latest_price(&self, symbol: &str) -> Result<i64, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prices
            .read()
            .await
            .get(&normalize_symbol(symbol))
            .copied()
            .ok_or_else(|| FeedError::NotFound(symbol.to_string()))
    }
}
