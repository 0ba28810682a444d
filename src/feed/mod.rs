//! On-chain feed
//!
//! Owns the last known on-chain price per symbol, validates candidate prices
//! against the reference oracle and the contract, writes accepted ones and
//! follows `PriceChanged` events.
//!
//! Two locks are kept apart: the on-chain price map and the bounds cache.
//! Neither is held across a chain call.

mod bounds;
mod listener;
pub mod validation;

pub use bounds::BoundsCache;
pub use validation::{decide, Decision};

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::chain::{PriceChanged, PriceContract, ReferenceOracle, WriteReceipt};
use crate::config::AppConfig;
use crate::error::FeedError;
use crate::shutdown::ShutdownSignal;
use crate::types::{from_scaled, normalize_symbol, to_scaled, Bounds, CurrencyType, Price, PRICE_SCALE};

/// Chain-side half of the aggregator
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Snapshot of the last known on-chain prices
    async fn on_chain_prices(&self) -> HashMap<String, Decimal>;

    /// Follow `PriceChanged` events and forward each confirmed price.
    /// Returns on shutdown or when `tx`'s receiver is gone; `tx` is dropped on return.
    async fn listen_on_chain_price_update(&self, tx: mpsc::Sender<Price>, shutdown: ShutdownSignal);

    /// Validate and write every batch received on `rx` until shutdown or until `rx` closes
    async fn write_prices_to_chain(&self, rx: mpsc::Receiver<Vec<Price>>, shutdown: ShutdownSignal);
}

/// Tolerances of the write validation
#[derive(Debug, Clone, Copy)]
pub struct FeedSettings {
    pub reference_tolerance_bps: u32,
    pub contract_tolerance_bps: u32,
    pub bounds_ttl: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            reference_tolerance_bps: 2000,
            contract_tolerance_bps: 200,
            bounds_ttl: Duration::from_secs(120),
        }
    }
}

impl From<&AppConfig> for FeedSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            reference_tolerance_bps: config.validation.reference_tolerance_bps,
            contract_tolerance_bps: config.validation.contract_tolerance_bps,
            bounds_ttl: config.bounds_ttl(),
        }
    }
}

/// Per-symbol outcome of one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Confirmed writes
    pub written: Vec<String>,
    /// Suppressed or rejected by validation
    pub skipped: Vec<String>,
    /// Validation could not run (reference or conversion failure)
    pub errored: Vec<String>,
    /// Accepted but the write failed
    pub failed: Vec<String>,
}

pub struct OnChainFeed {
    contract: Arc<dyn PriceContract>,
    reference: Arc<dyn ReferenceOracle>,
    on_chain_prices: RwLock<HashMap<String, Decimal>>,
    bounds: BoundsCache,
    settings: FeedSettings,
    base_currency: CurrencyType,
}

impl OnChainFeed {
    pub fn new(
        contract: Arc<dyn PriceContract>,
        reference: Arc<dyn ReferenceOracle>,
        settings: FeedSettings,
    ) -> Self {
        Self {
            contract,
            reference,
            on_chain_prices: RwLock::new(HashMap::new()),
            bounds: BoundsCache::new(settings.bounds_ttl),
            settings,
            base_currency: CurrencyType::Usd,
        }
    }

    /// Seed the on-chain price map from the contract.
    ///
    /// Symbols the contract has never written (price 0) are left absent.
    /// Returns the number of symbols loaded.
    pub async fn sync_from_chain(&self, symbols: &[String]) -> usize {
        let mut loaded = 0;
        for symbol in symbols.iter().map(|s| normalize_symbol(s)) {
            match self.contract.get_price(&symbol).await {
                Ok(scaled) if scaled > 0 => {
                    let price = from_scaled(scaled);
                    self.on_chain_prices
                        .write()
                        .await
                        .insert(symbol.clone(), price);
                    info!(symbol = %symbol, price = %price, "⛓️ Loaded on-chain price");
                    loaded += 1;
                }
                Ok(_) => debug!(symbol = %symbol, "No on-chain price yet"),
                Err(e) => warn!(symbol = %symbol, error = %e, "⚠️ Failed to read on-chain price"),
            }
        }
        loaded
    }

    pub async fn on_chain_price(&self, symbol: &str) -> Option<Decimal> {
        self.on_chain_prices
            .read()
            .await
            .get(&normalize_symbol(symbol))
            .copied()
    }

    /// Reference bounds for `symbol`, from cache when fresh
    pub async fn reference_bounds(&self, symbol: &str) -> Result<Bounds, FeedError> {
        if let Some(bounds) = self.bounds.get_fresh(symbol).await {
            return Ok(bounds);
        }

        let reference = self.reference.latest_price(symbol).await?;
        let bounds = Bounds::around(
            reference.saturating_mul(PRICE_SCALE),
            self.settings.reference_tolerance_bps,
        );
        self.bounds.insert(symbol, bounds).await;
        debug!(symbol = %symbol, reference, bounds = %bounds, "Reference bounds refreshed");
        Ok(bounds)
    }

    /// Decide whether the scaled `new_price` should be written for `symbol`
    pub async fn validate_price(&self, symbol: &str, new_price: i64) -> Result<Decision, FeedError> {
        let symbol = normalize_symbol(symbol);
        let reference = self.reference_bounds(&symbol).await?;
        let contract_price = match self.on_chain_price(&symbol).await {
            Some(price) => to_scaled(price)?,
            None => 0,
        };
        Ok(decide(
            new_price,
            contract_price,
            reference,
            self.settings.contract_tolerance_bps,
        ))
    }

    /// Submit one write and record the price once it is confirmed
    pub async fn write_to_chain(&self, symbol: &str, price: Decimal) -> Result<WriteReceipt, FeedError> {
        let symbol = normalize_symbol(symbol);
        let scaled = to_scaled(price)?;
        let receipt = self.contract.set_price(&symbol, scaled).await?;
        self.on_chain_prices
            .write()
            .await
            .insert(symbol, from_scaled(scaled));
        Ok(receipt)
    }

    /// Validate and write one batch.
    ///
    /// Only base-currency entries are considered; duplicates keep the last
    /// entry. Symbols are handled in lexical order and writes are sequential.
    pub async fn process_batch(&self, batch: &[Price]) -> BatchReport {
        let candidates: BTreeMap<String, Decimal> = batch
            .iter()
            .filter(|price| price.currency == self.base_currency)
            .map(|price| (normalize_symbol(&price.symbol), price.amount))
            .collect();

        let mut report = BatchReport::default();
        let mut accepted = Vec::with_capacity(candidates.len());

        for (symbol, amount) in candidates {
            let new_price = match to_scaled(amount) {
                Ok(scaled) => scaled,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "⚠️ Unusable price");
                    report.errored.push(symbol);
                    continue;
                }
            };

            match self.validate_price(&symbol, new_price).await {
                Ok(Decision::Accept) => {
                    info!(symbol = %symbol, price = %amount, "✅ Price validated");
                    accepted.push((symbol, amount));
                }
                Ok(decision) => {
                    info!(symbol = %symbol, price = %amount, decision = ?decision, "⛔ Price not written");
                    report.skipped.push(symbol);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "⚠️ Validation failed");
                    report.errored.push(symbol);
                }
            }
        }

        for (symbol, amount) in accepted {
            match self.write_to_chain(&symbol, amount).await {
                Ok(receipt) => {
                    info!(
                        symbol = %symbol,
                        price = %amount,
                        tx_hash = %receipt.tx_hash,
                        block = ?receipt.block_number,
                        "📝 Price written on-chain"
                    );
                    report.written.push(symbol);
                }
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "❌ Failed to write price");
                    report.failed.push(symbol);
                }
            }
        }

        report
    }

    /// Apply a confirmed event to the price map
    pub(crate) async fn apply_event(&self, event: &PriceChanged) -> Price {
        let price = Price::new(event.symbol.as_str(), event.price(), self.base_currency);
        self.on_chain_prices
            .write()
            .await
            .insert(price.symbol.clone(), price.amount);
        info!(
            symbol = %price.symbol,
            price = %price.amount,
            timestamp = event.timestamp,
            "🔥 PriceChanged event"
        );
        price
    }
}

#[async_trait]
impl PriceFeed for OnChainFeed {
    async fn on_chain_prices(&self) -> HashMap<String, Decimal> {
        self.on_chain_prices.read().await.clone()
    }

    async fn listen_on_chain_price_update(&self, tx: mpsc::Sender<Price>, shutdown: ShutdownSignal) {
        self.run_listener(tx, shutdown).await;
    }

    async fn write_prices_to_chain(&self, mut rx: mpsc::Receiver<Vec<Price>>, mut shutdown: ShutdownSignal) {
        info!("✍️ Chain writer started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("🛑 Chain writer stopped: shutdown");
                    return;
                }
                batch = rx.recv() => match batch {
                    Some(batch) => {
                        debug!(count = batch.len(), "Received price batch");
                        let report = self.process_batch(&batch).await;
                        debug!(
                            written = report.written.len(),
                            skipped = report.skipped.len(),
                            errored = report.errored.len(),
                            failed = report.failed.len(),
                            "Batch processed"
                        );
                    }
                    None => {
                        info!("🛑 Chain writer stopped: input closed");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::PriceChangedSubscription;
    use crate::shutdown;
    use mockall::mock;
    use rust_decimal_macros::dec;

    mock! {
        pub Contract {}

        #[async_trait]
        impl PriceContract for Contract {
            async fn get_price(&self, symbol: &str) -> Result<i64, FeedError>;
            async fn set_price(&self, symbol: &str, scaled_price: i64) -> Result<WriteReceipt, FeedError>;
            async fn watch_price_changed(&self) -> Result<PriceChangedSubscription, FeedError>;
        }
    }

    mock! {
        pub Reference {}

        #[async_trait]
        impl ReferenceOracle for Reference {
            async fn latest_price(&self, symbol: &str) -> Result<i64, FeedError>;
        }
    }

    fn receipt() -> WriteReceipt {
        WriteReceipt {
            tx_hash: "0xabc".to_string(),
            block_number: Some(1),
        }
    }

    fn feed(contract: MockContract, reference: MockReference) -> OnChainFeed {
        OnChainFeed::new(Arc::new(contract), Arc::new(reference), FeedSettings::default())
    }

    async fn seed(feed: &OnChainFeed, symbol: &str, price: Decimal) {
        feed.on_chain_prices
            .write()
            .await
            .insert(symbol.to_string(), price);
    }

    #[tokio::test]
    async fn test_first_write_checks_reference_only() {
        let mut reference = MockReference::new();
        reference
            .expect_latest_price()
            .withf(|symbol| symbol == "bitcoin")
            .times(1)
            .returning(|_| Ok(30_000));
        let feed = feed(MockContract::new(), reference);

        assert_eq!(feed.validate_price("bitcoin", 2_500_000).await.unwrap(), Decision::Accept);
        // Served from the bounds cache
        assert!(matches!(
            feed.validate_price("bitcoin", 1_000_000).await.unwrap(),
            Decision::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_validation_against_prior_on_chain_price() {
        let mut reference = MockReference::new();
        reference.expect_latest_price().times(1).returning(|_| Ok(30_400));
        let feed = feed(MockContract::new(), reference);
        seed(&feed, "bitcoin", dec!(30000)).await;

        assert!(matches!(
            feed.validate_price("bitcoin", 3_050_000).await.unwrap(),
            Decision::Suppressed { .. }
        ));
        assert_eq!(feed.validate_price("bitcoin", 3_300_000).await.unwrap(), Decision::Accept);
        assert!(matches!(
            feed.validate_price("bitcoin", 4_000_000).await.unwrap(),
            Decision::Rejected { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounds_refresh_after_ttl() {
        let mut reference = MockReference::new();
        let mut calls = 0;
        reference.expect_latest_price().times(2).returning(move |_| {
            calls += 1;
            Ok(if calls == 1 { 30_000 } else { 32_000 })
        });
        let feed = feed(MockContract::new(), reference);

        assert!(!feed.validate_price("bitcoin", 3_700_000).await.unwrap().should_write());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!feed.validate_price("bitcoin", 3_700_000).await.unwrap().should_write());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(feed.validate_price("bitcoin", 3_700_000).await.unwrap().should_write());
    }

    #[tokio::test]
    async fn test_reference_failure_is_an_error() {
        let mut reference = MockReference::new();
        reference
            .expect_latest_price()
            .returning(|symbol| Err(FeedError::NotFound(symbol.to_string())));
        let feed = feed(MockContract::new(), reference);

        assert!(matches!(
            feed.validate_price("dogecoin", 100).await,
            Err(FeedError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_write_updates_state_only_on_success() {
        let mut contract = MockContract::new();
        contract
            .expect_set_price()
            .withf(|symbol, price| symbol == "bitcoin" && *price == 3_100_000)
            .times(1)
            .returning(|_, _| Ok(receipt()));
        contract
            .expect_set_price()
            .withf(|symbol, _| symbol == "ethereum")
            .times(1)
            .returning(|symbol, _| Err(FeedError::write(symbol, "execution reverted")));
        let feed = feed(contract, MockReference::new());
        seed(&feed, "ethereum", dec!(1850)).await;

        let written = feed.write_to_chain("bitcoin", dec!(31000)).await.unwrap();
        assert_eq!(written.tx_hash, "0xabc");
        assert_eq!(feed.on_chain_price("bitcoin").await, Some(dec!(31000)));

        assert!(feed.write_to_chain("ethereum", dec!(2000)).await.is_err());
        assert_eq!(feed.on_chain_price("ethereum").await, Some(dec!(1850)));
    }

    #[tokio::test]
    async fn test_batch_failure_does_not_block_other_symbols() {
        let mut contract = MockContract::new();
        contract
            .expect_set_price()
            .withf(|symbol, _| symbol == "bitcoin")
            .returning(|symbol, _| Err(FeedError::write(symbol, "nonce too low")));
        contract
            .expect_set_price()
            .withf(|symbol, price| symbol == "ethereum" && *price == 190_000)
            .times(1)
            .returning(|_, _| Ok(receipt()));

        let mut reference = MockReference::new();
        reference.expect_latest_price().returning(|symbol| match symbol {
            "bitcoin" => Ok(31_000),
            "ethereum" => Ok(1_900),
            other => Err(FeedError::NotFound(other.to_string())),
        });
        let feed = feed(contract, reference);

        let batch = vec![
            Price::usd("bitcoin", dec!(31000)),
            Price::usd("ethereum", dec!(1900)),
            Price::usd("dogecoin", dec!(0.08)),
            Price::new("bitcoin", dec!(28000), CurrencyType::Eur),
        ];
        let report = feed.process_batch(&batch).await;

        assert_eq!(report.written, vec!["ethereum".to_string()]);
        assert_eq!(report.failed, vec!["bitcoin".to_string()]);
        assert_eq!(report.errored, vec!["dogecoin".to_string()]);
        assert_eq!(feed.on_chain_price("bitcoin").await, None);
        assert_eq!(feed.on_chain_price("ethereum").await, Some(dec!(1900)));
    }

    #[tokio::test]
    async fn test_duplicate_symbols_keep_last_entry() {
        let mut contract = MockContract::new();
        contract
            .expect_set_price()
            .withf(|symbol, price| symbol == "bitcoin" && *price == 3_150_000)
            .times(1)
            .returning(|_, _| Ok(receipt()));
        let mut reference = MockReference::new();
        reference.expect_latest_price().returning(|_| Ok(31_000));
        let feed = feed(contract, reference);

        let report = feed
            .process_batch(&[
                Price::usd("bitcoin", dec!(31000)),
                Price::usd("BITCOIN", dec!(31500)),
            ])
            .await;
        assert_eq!(report.written, vec!["bitcoin".to_string()]);
    }

    #[tokio::test]
    async fn test_end_to_end_write() {
        let mut contract = MockContract::new();
        contract
            .expect_set_price()
            .withf(|symbol, price| symbol == "bitcoin" && *price == 3_100_000)
            .times(1)
            .returning(|_, _| Ok(receipt()));
        let mut reference = MockReference::new();
        reference.expect_latest_price().times(1).returning(|_| Ok(31_000));
        let feed = feed(contract, reference);
        seed(&feed, "bitcoin", dec!(30000)).await;

        let report = feed.process_batch(&[Price::usd("bitcoin", dec!(31000))]).await;
        assert_eq!(report.written, vec!["bitcoin".to_string()]);
        assert_eq!(feed.on_chain_prices().await.get("bitcoin"), Some(&dec!(31000)));
    }

    #[tokio::test]
    async fn test_sync_from_chain_skips_unwritten_symbols() {
        let mut contract = MockContract::new();
        contract.expect_get_price().returning(|symbol| match symbol {
            "bitcoin" => Ok(3_000_050),
            "ethereum" => Ok(0),
            _ => Err(FeedError::Transport("connection refused".to_string())),
        });
        let feed = feed(contract, MockReference::new());

        let symbols = vec!["Bitcoin".to_string(), "ethereum".to_string(), "solana".to_string()];
        assert_eq!(feed.sync_from_chain(&symbols).await, 1);
        let prices = feed.on_chain_prices().await;
        assert_eq!(prices.len(), 1);
        assert_eq!(prices.get("bitcoin"), Some(&dec!(30000.50)));
    }

    #[tokio::test]
    async fn test_writer_stops_on_shutdown_and_on_closed_input() {
        let feed = Arc::new(feed(MockContract::new(), MockReference::new()));

        let (trigger, signal) = shutdown::channel();
        let (_tx, rx) = mpsc::channel(1);
        let writer = tokio::spawn({
            let feed = feed.clone();
            async move { feed.write_prices_to_chain(rx, signal).await }
        });
        trigger.trigger();
        writer.await.unwrap();

        let (_trigger, signal) = shutdown::channel();
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        feed.write_prices_to_chain(rx, signal).await;
    }
}
