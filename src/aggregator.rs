//! Feed Aggregator - one handle over the market source and the on-chain feed

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::feed::PriceFeed;
use crate::market::PriceProvider;
use crate::shutdown::ShutdownSignal;
use crate::types::Price;

#[derive(Clone)]
pub struct FeedAggregator {
    api_feed: Arc<dyn PriceProvider>,
    chain_feed: Arc<dyn PriceFeed>,
}

impl FeedAggregator {
    pub fn new(api_feed: Arc<dyn PriceProvider>, chain_feed: Arc<dyn PriceFeed>) -> Self {
        Self { api_feed, chain_feed }
    }

    pub fn source_name(&self) -> &'static str {
        self.api_feed.name()
    }

    pub async fn update_price_from_api(&self, tx: Sender<Vec<Price>>, shutdown: ShutdownSignal) {
        self.api_feed.update_price_from_api(tx, shutdown).await
    }

    pub async fn listen_on_chain_price_update(&self, tx: Sender<Price>, shutdown: ShutdownSignal) {
        self.chain_feed.listen_on_chain_price_update(tx, shutdown).await
    }

    pub async fn write_prices_to_chain(&self, rx: Receiver<Vec<Price>>, shutdown: ShutdownSignal) {
        self.chain_feed.write_prices_to_chain(rx, shutdown).await
    }

    pub async fn on_chain_prices(&self) -> HashMap<String, Decimal> {
        self.chain_feed.on_chain_prices().await
    }
}
