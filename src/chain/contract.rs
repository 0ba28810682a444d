//! Live binding of the price oracle contract
//!
//! Submits `set` transactions through a signing middleware and follows
//! `PriceChanged` logs through a polling filter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, I256, U256, U64};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::chain::{
    i256_to_i64, PriceChanged, PriceChangedSubscription, PriceContract, WriteReceipt,
};
use crate::config::{parse_address, ChainConfig};
use crate::error::FeedError;

abigen!(
    PriceFeedContract,
    r#"[
        event PriceChanged(string symbol, int256 newPrice, uint256 timestamp)
        function set(string symbol, int256 price) external returns (bool)
        function get(string symbol) external view returns (int256)
    ]"#
);

/// Signing client used for live writes
pub type LiveClient = SignerMiddleware<Provider<Http>, LocalWallet>;

const EVENT_BUFFER: usize = 64;

pub struct EthersPriceContract<M> {
    contract: PriceFeedContract<M>,
}

impl EthersPriceContract<LiveClient> {
    /// Dial the node, derive the signer for its chain id and bind the contract
    pub async fn connect(config: &ChainConfig) -> Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .with_context(|| format!("Invalid chain.rpc_url '{}'", config.rpc_url))?;
        let chain_id = provider
            .get_chainid()
            .await
            .context("Failed to read chain id from node")?;

        let wallet: LocalWallet = config
            .private_key
            .parse()
            .context("Invalid chain.private_key")?;
        let signer = wallet.with_chain_id(chain_id.as_u64());
        info!(
            chain_id = %chain_id,
            signer = %format!("{:#x}", signer.address()),
            "🔑 Signing credential loaded"
        );

        let client = Arc::new(SignerMiddleware::new(provider, signer));
        let address = parse_address("chain.contract_address", &config.contract_address)?;
        Ok(Self::new(address, client))
    }
}

impl<M: Middleware + 'static> EthersPriceContract<M> {
    pub fn new(address: Address, client: Arc<M>) -> Self {
        Self {
            contract: PriceFeedContract::new(address, client),
        }
    }

    /// Underlying middleware, shared with read-only bindings
    pub fn client(&self) -> Arc<M> {
        self.contract.client()
    }
}

impl TryFrom<PriceChangedFilter> for PriceChanged {
    type Error = FeedError;

    fn try_from(log: PriceChangedFilter) -> Result<Self, Self::Error> {
        let new_price = i256_to_i64(log.new_price).ok_or_else(|| {
            FeedError::Decode(format!("price for {} out of range: {}", log.symbol, log.new_price))
        })?;
        if log.timestamp > U256::from(u64::MAX) {
            return Err(FeedError::Decode(format!(
                "timestamp for {} out of range: {}",
                log.symbol, log.timestamp
            )));
        }
        Ok(PriceChanged {
            symbol: log.symbol,
            new_price,
            timestamp: log.timestamp.low_u64(),
        })
    }
}

#[async_trait]
impl<M: Middleware + 'static> PriceContract for EthersPriceContract<M> {
    async fn get_price(&self, symbol: &str) -> Result<i64, FeedError> {
        let raw = self
            .contract
            .get(symbol.to_string())
            .call()
            .await
            .map_err(|e| FeedError::Transport(format!("get({}) failed: {}", symbol, e)))?;
        i256_to_i64(raw)
            .ok_or_else(|| FeedError::Decode(format!("on-chain price for {} out of range", symbol)))
    }

    async fn set_price(&self, symbol: &str, scaled_price: i64) -> Result<WriteReceipt, FeedError> {
        let call = self
            .contract
            .set(symbol.to_string(), I256::from(scaled_price));
        let pending = call
            .send()
            .await
            .map_err(|e| FeedError::write(symbol, format!("submission failed: {}", e)))?;
        let tx_hash = pending.tx_hash();
        debug!(symbol = %symbol, tx_hash = %format!("{:#x}", tx_hash), "Transaction submitted");

        let receipt = pending
            .await
            .map_err(|e| FeedError::write(symbol, format!("confirmation failed: {}", e)))?
            .ok_or_else(|| FeedError::write(symbol, "transaction dropped before confirmation"))?;

        if receipt.status == Some(U64::zero()) {
            return Err(FeedError::write(
                symbol,
                format!("transaction {:#x} reverted", tx_hash),
            ));
        }

        Ok(WriteReceipt {
            tx_hash: format!("{:#x}", tx_hash),
            block_number: receipt.block_number.map(|b| b.as_u64()),
        })
    }

    async fn watch_price_changed(&self) -> Result<PriceChangedSubscription, FeedError> {
        let contract = self.contract.clone();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let event = contract.price_changed_filter();
            let mut stream = match event.stream().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(FeedError::Subscription(e.to_string())));
                    return;
                }
            };

            while let Some(item) = stream.next().await {
                let decoded = match item {
                    Ok(log) => PriceChanged::try_from(log),
                    Err(e) => {
                        warn!(error = %e, "Failed to decode PriceChanged log");
                        Err(FeedError::Decode(e.to_string()))
                    }
                };
                if tx.send(decoded).await.is_err() {
                    return;
                }
            }

            let _ = tx
                .send(Err(FeedError::Subscription("event stream ended".to_string())))
                .await;
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(PriceChangedSubscription::new(rx, Some(task))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FeedError::Subscription(
                "subscription task exited before it was established".to_string(),
            )),
        }
    }
}
