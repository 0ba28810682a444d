//! Chain module - blockchain RPC boundary
//!
//! Two capabilities are abstracted here so the feed can run against a live
//! node or the in-memory doubles in [`memory`]:
//! - [`PriceContract`]: the target oracle contract (view, write, event log)
//! - [`ReferenceOracle`]: the independent feed used only for bounds checks

mod chainlink;
mod contract;
pub mod memory;

pub use chainlink::ChainlinkOracle;
pub use contract::{EthersPriceContract, LiveClient};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::types::I256;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::FeedError;
use crate::types::from_scaled;

/// Decoded `PriceChanged(symbol, newPrice, timestamp)` log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceChanged {
    pub symbol: String,
    /// Scaled price (hundredths)
    pub new_price: i64,
    /// Block timestamp in unix seconds
    pub timestamp: u64,
}

impl PriceChanged {
    pub fn price(&self) -> Decimal {
        from_scaled(self.new_price)
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(i64::try_from(self.timestamp).ok()?, 0).single()
    }
}

/// Confirmation details of a submitted write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

/// Live stream of `PriceChanged` events.
///
/// `Err(FeedError::Subscription)` items mean the underlying subscription is
/// broken; `Err(FeedError::Decode)` items affect a single log only. Dropping
/// the subscription stops the forwarding task.
#[derive(Debug)]
pub struct PriceChangedSubscription {
    events: mpsc::Receiver<Result<PriceChanged, FeedError>>,
    task: Option<JoinHandle<()>>,
}

impl PriceChangedSubscription {
    pub fn new(
        events: mpsc::Receiver<Result<PriceChanged, FeedError>>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { events, task }
    }

    /// Next event; `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<Result<PriceChanged, FeedError>> {
        self.events.recv().await
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for PriceChangedSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The on-chain price oracle contract
#[async_trait]
pub trait PriceContract: Send + Sync {
    /// Current scaled price held by the contract (0 if never written)
    async fn get_price(&self, symbol: &str) -> Result<i64, FeedError>;

    /// Submit `set(symbol, price)` and wait for confirmation
    async fn set_price(&self, symbol: &str, scaled_price: i64) -> Result<WriteReceipt, FeedError>;

    /// Subscribe to `PriceChanged` events
    async fn watch_price_changed(&self) -> Result<PriceChangedSubscription, FeedError>;
}

/// Independent price reference consulted only to bound writes
#[async_trait]
pub trait ReferenceOracle: Send + Sync {
    /// Latest whole-unit price for the symbol
    async fn latest_price(&self, symbol: &str) -> Result<i64, FeedError>;
}

pub(crate) fn i256_to_i64(value: I256) -> Option<i64> {
    if value > I256::from(i64::MAX) || value < I256::from(i64::MIN) {
        return None;
    }
    Some(value.low_i64())
}
