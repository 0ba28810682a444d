//! Chainlink aggregator reader used as the reference oracle

use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::providers::Middleware;
use ethers::types::{Address, I256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::chain::{i256_to_i64, ReferenceOracle};
use crate::error::FeedError;
use crate::types::normalize_symbol;

abigen!(
    AggregatorV3Interface,
    r#"[
        function latestRoundData() external view returns (uint80 roundId, int256 answer, uint256 startedAt, uint256 updatedAt, uint80 answeredInRound)
    ]"#
);

/// Largest supported answer precision (10^18 still fits i128)
pub const MAX_FEED_DECIMALS: u32 = 18;

pub struct ChainlinkOracle<M> {
    client: Arc<M>,
    /// Symbol -> aggregator address
    feeds: HashMap<String, Address>,
    /// Decimals of every configured aggregator answer
    decimals: u32,
}

impl<M: Middleware + 'static> ChainlinkOracle<M> {
    pub fn new(client: Arc<M>, feeds: HashMap<String, Address>, decimals: u32) -> Self {
        Self {
            client,
            feeds,
            decimals: decimals.min(MAX_FEED_DECIMALS),
        }
    }

    pub fn has_feed(&self, symbol: &str) -> bool {
        self.feeds.contains_key(&normalize_symbol(symbol))
    }
}

#[async_trait]
impl<M: Middleware + 'static> ReferenceOracle for ChainlinkOracle<M> {
    async fn latest_price(&self, symbol: &str) -> Result<i64, FeedError> {
        let address = self
            .feeds
            .get(&normalize_symbol(symbol))
            .copied()
            .ok_or_else(|| FeedError::NotFound(symbol.to_string()))?;

        let feed = AggregatorV3Interface::new(address, self.client.clone());
        let (_, answer, _, _, _) = feed.latest_round_data().call().await.map_err(|e| {
            FeedError::Transport(format!("failed to fetch reference price for {}: {}", symbol, e))
        })?;

        let price = scale_answer(answer, self.decimals).map_err(|reason| {
            FeedError::Decode(format!("invalid reference answer for {}: {}", symbol, reason))
        })?;
        debug!(symbol = %symbol, price, "🔗 Reference price");
        Ok(price)
    }
}

/// Divide a raw aggregator answer down to whole units
fn scale_answer(answer: I256, decimals: u32) -> Result<i64, String> {
    if answer <= I256::zero() {
        return Err(format!("non-positive answer {}", answer));
    }
    let divisor = I256::from(10i128.pow(decimals.min(MAX_FEED_DECIMALS)));
    i256_to_i64(answer / divisor).ok_or_else(|| format!("answer {} out of range", answer))
}
