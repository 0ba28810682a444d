//! Market module - off-chain price ingestion
//!
//! Polls an external REST price API and emits batches of observations.

mod coingecko;

pub use coingecko::CoinGeckoClient;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::error::FeedError;
use crate::shutdown::ShutdownSignal;
use crate::types::Price;

/// Trait for services that provide price batches from an off-chain source
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Get the source name
    fn name(&self) -> &'static str;

    /// Fetch one batch of observations
    async fn fetch(&self) -> Result<Vec<Price>, FeedError>;

    /// Poll the source until shutdown, sending every successful batch
    async fn update_price_from_api(&self, tx: Sender<Vec<Price>>, shutdown: ShutdownSignal);
}
