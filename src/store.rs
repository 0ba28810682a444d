//! Shared price cache
//!
//! Last known good price per symbol and currency, read by the HTTP API and
//! written by the pipeline. Created once at startup and shared behind an `Arc`.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info};

use crate::shutdown::ShutdownSignal;
use crate::types::{normalize_symbol, CurrencyType, Price};

#[derive(Debug)]
pub struct PriceStore {
    prices: RwLock<HashMap<String, HashMap<CurrencyType, Decimal>>>,
    /// Flips to true once the first market batch has been applied
    ready: watch::Sender<bool>,
}

impl Default for PriceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceStore {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            prices: RwLock::new(HashMap::new()),
            ready,
        }
    }

    /// Merge a market batch and mark the store ready
    pub async fn apply_batch(&self, batch: &[Price]) {
        {
            let mut prices = self.prices.write().await;
            for price in batch {
                prices
                    .entry(normalize_symbol(&price.symbol))
                    .or_default()
                    .insert(price.currency, price.amount);
            }
        }
        if !self.ready.send_replace(true) {
            info!(count = batch.len(), "🟢 Price store ready");
        }
    }

    pub async fn set(&self, price: Price) {
        self.prices
            .write()
            .await
            .entry(normalize_symbol(&price.symbol))
            .or_default()
            .insert(price.currency, price.amount);
    }

    pub async fn get(&self, symbol: &str, currency: CurrencyType) -> Option<Decimal> {
        self.prices
            .read()
            .await
            .get(&normalize_symbol(symbol))
            .and_then(|by_currency| by_currency.get(&currency))
            .copied()
    }

    /// All entries, sorted by symbol then currency
    pub async fn snapshot(&self) -> Vec<Price> {
        let prices = self.prices.read().await;
        let mut snapshot: Vec<Price> = prices
            .iter()
            .flat_map(|(symbol, by_currency)| {
                by_currency.iter().map(move |(currency, amount)| Price {
                    symbol: symbol.clone(),
                    amount: *amount,
                    currency: *currency,
                })
            })
            .collect();
        snapshot.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.currency.cmp(&b.currency)));
        snapshot
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait up to `timeout` for the first batch; returns readiness
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.subscribe();
        let waited = tokio::time::timeout(timeout, ready.wait_for(|ready| *ready))
            .await
            .map(|changed| changed.is_ok());
        waited.unwrap_or(false)
    }

    /// Consume market batches until shutdown or until the channel closes
    pub async fn run(&self, mut rx: mpsc::Receiver<Vec<Price>>, mut shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("🛑 Price store consumer stopped: shutdown");
                    return;
                }
                batch = rx.recv() => match batch {
                    Some(batch) => {
                        debug!(count = batch.len(), "Applying market batch");
                        self.apply_batch(&batch).await;
                    }
                    None => {
                        info!("🛑 Price store consumer stopped: input closed");
                        return;
                    }
                }
            }
        }
    }

    /// Apply confirmed on-chain prices until the listener closes its channel
    pub async fn track_confirmed(&self, mut rx: mpsc::Receiver<Price>) {
        while let Some(price) = rx.recv().await {
            debug!(price = %price, "Confirmed on-chain price");
            self.set(price).await;
        }
        debug!("Confirmed price stream closed");
    }
}
