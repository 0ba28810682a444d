use anyhow::{Context, Result};
use ethers::providers::{Http, Provider};
use std::sync::Arc;
use tokio::signal;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pricebridge::aggregator::FeedAggregator;
use pricebridge::chain::memory::InMemoryPriceContract;
use pricebridge::chain::{ChainlinkOracle, EthersPriceContract, PriceContract, ReferenceOracle};
use pricebridge::config::AppConfig;
use pricebridge::feed::{FeedSettings, OnChainFeed};
use pricebridge::market::CoinGeckoClient;
use pricebridge::pipeline::Pipeline;
use pricebridge::shutdown::{self, ShutdownSignal};
use pricebridge::store::PriceStore;

type ApiTask = JoinHandle<Result<()>>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("🌉 PriceBridge v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load()?;
    config.validate().context("Invalid configuration")?;
    info!(config = %config, "⚙️ Configuration loaded");

    let (contract, reference) = connect_chain(&config).await?;
    let feed = Arc::new(OnChainFeed::new(contract, reference, FeedSettings::from(&config)));
    let loaded = feed.sync_from_chain(&config.token_list()).await;
    info!(loaded, "⛓️ On-chain prices synchronized");

    let market = Arc::new(CoinGeckoClient::new(&config)?);
    let aggregator = FeedAggregator::new(market, feed);
    let store = Arc::new(PriceStore::new());
    let (trigger, shutdown_signal) = shutdown::channel();

    let pipeline = Pipeline::spawn(
        aggregator,
        store.clone(),
        shutdown_signal.clone(),
        config.chain.channel_capacity,
    );
    let mut api = start_api(&config, store, shutdown_signal);

    info!("PriceBridge running. Press Ctrl+C to shutdown.");
    let api_finished = tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("🛑 Shutdown requested");
            false
        }
        exit = wait_for_api(&mut api) => {
            report_api_exit(exit);
            true
        }
    };

    trigger.trigger();
    pipeline.join().await;
    if !api_finished {
        if let Some(task) = api {
            report_api_exit(task.await);
        }
    }

    info!("👋 PriceBridge stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,pricebridge=debug".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Build the contract and reference oracle for live or dry-run mode
async fn connect_chain(
    config: &AppConfig,
) -> Result<(Arc<dyn PriceContract>, Arc<dyn ReferenceOracle>)> {
    let feeds = config.reference_feeds()?;

    if config.chain.dry_run {
        warn!("🧪 Dry run: writes are recorded in memory, nothing is submitted");
        let provider = Provider::<Http>::try_from(config.chain.rpc_url.as_str())
            .with_context(|| format!("Invalid chain.rpc_url '{}'", config.chain.rpc_url))?;
        let contract: Arc<dyn PriceContract> = Arc::new(InMemoryPriceContract::new());
        let reference: Arc<dyn ReferenceOracle> = Arc::new(ChainlinkOracle::new(
            Arc::new(provider),
            feeds,
            config.reference.decimals,
        ));
        return Ok((contract, reference));
    }

    let live = EthersPriceContract::connect(&config.chain).await?;
    let reference: Arc<dyn ReferenceOracle> = Arc::new(ChainlinkOracle::new(
        live.client(),
        feeds,
        config.reference.decimals,
    ));
    let contract: Arc<dyn PriceContract> = Arc::new(live);
    Ok((contract, reference))
}

#[cfg(feature = "api")]
fn start_api(config: &AppConfig, store: Arc<PriceStore>, signal: ShutdownSignal) -> Option<ApiTask> {
    use pricebridge::api::{self, ApiState};

    let state = Arc::new(ApiState::new(store, &config.api));
    let bind_addr = config.api.bind_addr.clone();
    Some(tokio::spawn(async move { api::serve(&bind_addr, state, signal).await }))
}

#[cfg(not(feature = "api"))]
fn start_api(_config: &AppConfig, _store: Arc<PriceStore>, _signal: ShutdownSignal) -> Option<ApiTask> {
    None
}

async fn wait_for_api(api: &mut Option<ApiTask>) -> Result<Result<()>, JoinError> {
    match api {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

fn report_api_exit(exit: Result<Result<()>, JoinError>) {
    match exit {
        Ok(Ok(())) => info!("Price API finished"),
        Ok(Err(e)) => error!(error = %e, "❌ Price API failed"),
        Err(e) => error!(error = %e, "❌ Price API task panicked"),
    }
}
