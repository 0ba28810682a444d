//! Configuration management for PriceBridge
//!
//! Loads defaults, optional config files and environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use ethers::types::Address;
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::types::{normalize_symbol, CurrencyType};

/// Sepolia Chainlink aggregators used when no feeds are configured
const DEFAULT_REFERENCE_FEEDS: [(&str, &str); 2] = [
    ("bitcoin", "0xA39434A63A52E749F02807ae27335515BA4b07F7"),
    ("ethereum", "0xD4a33860578De61DBAbDc8BFdb98FD742fA7028e"),
];

const MIN_BOUNDS_TTL_SECS: u64 = 120;
const MAX_BOUNDS_TTL_SECS: u64 = 300;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub market: MarketConfig,
    pub chain: ChainConfig,
    pub validation: ValidationConfig,
    pub reference: ReferenceConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    /// Simple-price endpoint of the market API
    pub url: String,
    /// Comma-separated token ids (e.g. "bitcoin,ethereum")
    pub tokens: String,
    /// Quote currencies requested from the market API
    pub currencies: Vec<String>,
    /// Decimal digits requested from the market API
    pub precision: String,
    /// Fixed delay between polls, dictated by the upstream rate limit
    pub poll_interval_secs: u64,
    /// HTTP request timeout
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint of the chain node
    pub rpc_url: String,
    /// Address of the price oracle contract
    pub contract_address: String,
    /// Hex-encoded signing key (64 hex chars, optional 0x prefix)
    pub private_key: String,
    /// Record writes in memory instead of submitting transactions
    pub dry_run: bool,
    /// Buffer size of every pipeline channel
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Allowed deviation from the reference oracle (2000 = 20%)
    pub reference_tolerance_bps: u32,
    /// Deviation from the on-chain price below which writes are suppressed (200 = 2%)
    pub contract_tolerance_bps: u32,
    /// Lifetime of a cached reference bounds entry
    pub bounds_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceConfig {
    /// Decimals of the reference aggregator answers
    pub decimals: u32,
    /// Symbol -> aggregator address
    pub feeds: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// Symbols accepted by manual price overrides
    pub allowed_symbols: Vec<String>,
    /// Currencies accepted by manual price overrides
    pub allowed_currencies: Vec<String>,
    /// How long GET /prices waits for the first batch
    pub ready_timeout_ms: u64,
    /// Lifetime of the serialized /prices response
    pub response_cache_ms: u64,
}

impl AppConfig {
    /// Load configuration from defaults, files and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();
        Self::load_from(Self::environment())
    }

    /// Environment overrides, spelled `PRICEBRIDGE_<SECTION>__<KEY>`
    fn environment() -> Environment {
        Environment::with_prefix("PRICEBRIDGE")
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("market.currencies")
            .with_list_parse_key("api.allowed_symbols")
            .with_list_parse_key("api.allowed_currencies")
            .try_parsing(true)
    }

    fn load_from(environment: Environment) -> Result<Self> {
        let default_feeds: HashMap<String, String> = DEFAULT_REFERENCE_FEEDS
            .iter()
            .map(|(symbol, address)| (symbol.to_string(), address.to_string()))
            .collect();

        let config = Config::builder()
            // Market defaults
            .set_default("market.url", "https://api.coingecko.com/api/v3/simple/price")?
            .set_default("market.tokens", "bitcoin,ethereum")?
            .set_default("market.currencies", vec!["usd", "eur"])?
            .set_default("market.precision", "6")?
            .set_default("market.poll_interval_secs", 61)?
            .set_default("market.request_timeout_secs", 10)?
            // Chain defaults
            .set_default("chain.rpc_url", "")?
            .set_default("chain.contract_address", "")?
            .set_default("chain.private_key", "")?
            .set_default("chain.dry_run", false)?
            .set_default("chain.channel_capacity", 100)?
            // Validation defaults
            .set_default("validation.reference_tolerance_bps", 2000)?
            .set_default("validation.contract_tolerance_bps", 200)?
            .set_default("validation.bounds_ttl_secs", MIN_BOUNDS_TTL_SECS)?
            // Reference oracle defaults
            .set_default("reference.decimals", 8)?
            .set_default("reference.feeds", default_feeds)?
            // API defaults
            .set_default("api.bind_addr", "0.0.0.0:8080")?
            .set_default("api.allowed_symbols", vec!["bitcoin", "ethereum"])?
            .set_default("api.allowed_currencies", vec!["USD", "EUR"])?
            .set_default("api.ready_timeout_ms", 3000)?
            .set_default("api.response_cache_ms", 2000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (PRICEBRIDGE_*)
            .add_source(environment)
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Check that every value is well-formed before anything is constructed from it
    pub fn validate(&self) -> Result<()> {
        validate_url("market.url", &self.market.url)?;
        validate_url("chain.rpc_url", &self.chain.rpc_url)?;

        parse_address("chain.contract_address", &self.chain.contract_address)?;

        if !(self.chain.dry_run && self.chain.private_key.is_empty()) {
            validate_private_key(&self.chain.private_key)?;
        }

        let tokens = self.token_list();
        if tokens.is_empty() {
            bail!("market.tokens: no tokens specified");
        }
        if self.market.tokens.split(',').any(|t| t.trim().is_empty()) {
            bail!("market.tokens: empty token in list");
        }

        if self.market.precision.is_empty()
            || !self.market.precision.chars().all(|c| c.is_ascii_digit())
        {
            bail!("market.precision must be numeric, got '{}'", self.market.precision);
        }

        if self.currencies()?.is_empty() {
            bail!("market.currencies: at least one currency is required");
        }

        if self.market.poll_interval_secs == 0 {
            bail!("market.poll_interval_secs must be positive");
        }

        if self.chain.channel_capacity == 0 {
            bail!("chain.channel_capacity must be positive");
        }

        for (name, bps) in [
            ("validation.reference_tolerance_bps", self.validation.reference_tolerance_bps),
            ("validation.contract_tolerance_bps", self.validation.contract_tolerance_bps),
        ] {
            if bps == 0 || bps >= 10_000 {
                bail!("{} must be between 1 and 9999, got {}", name, bps);
            }
        }

        if !(MIN_BOUNDS_TTL_SECS..=MAX_BOUNDS_TTL_SECS).contains(&self.validation.bounds_ttl_secs) {
            bail!(
                "validation.bounds_ttl_secs must be between {} and {}, got {}",
                MIN_BOUNDS_TTL_SECS,
                MAX_BOUNDS_TTL_SECS,
                self.validation.bounds_ttl_secs
            );
        }

        if self.reference.decimals > 18 {
            bail!("reference.decimals must be at most 18, got {}", self.reference.decimals);
        }
        self.reference_feeds()?;

        for currency in &self.api.allowed_currencies {
            if CurrencyType::from_str(currency).is_none() {
                bail!("api.allowed_currencies: unknown currency '{}'", currency);
            }
        }

        Ok(())
    }

    /// Token ids as a list
    pub fn token_list(&self) -> Vec<String> {
        self.market
            .tokens
            .split(',')
            .map(normalize_symbol)
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Parsed market currencies
    pub fn currencies(&self) -> Result<Vec<CurrencyType>> {
        self.market
            .currencies
            .iter()
            .map(|c| {
                CurrencyType::from_str(c)
                    .with_context(|| format!("market.currencies: unknown currency '{}'", c))
            })
            .collect()
    }

    /// Parsed reference feed addresses keyed by canonical symbol
    pub fn reference_feeds(&self) -> Result<HashMap<String, Address>> {
        self.reference
            .feeds
            .iter()
            .map(|(symbol, address)| {
                let name = format!("reference.feeds.{}", symbol);
                Ok((normalize_symbol(symbol), parse_address(&name, address)?))
            })
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.market.poll_interval_secs)
    }

    pub fn bounds_ttl(&self) -> Duration {
        Duration::from_secs(self.validation.bounds_ttl_secs)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "tokens={} currencies={:?} poll={}s contract={} dry_run={} ref_tol={}bps contract_tol={}bps ttl={}s",
            self.market.tokens,
            self.market.currencies,
            self.market.poll_interval_secs,
            self.chain.contract_address,
            self.chain.dry_run,
            self.validation.reference_tolerance_bps,
            self.validation.contract_tolerance_bps,
            self.validation.bounds_ttl_secs
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

fn validate_url(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{} is required", name);
    }
    let url = Url::parse(value).with_context(|| format!("invalid {}: {}", name, value))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("{} must be an http(s) URL, got {}", name, value);
    }
    Ok(())
}

pub(crate) fn parse_address(name: &str, value: &str) -> Result<Address> {
    let hex_part = value.strip_prefix("0x").unwrap_or(value);
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid {}: {}", name, value);
    }
    value
        .parse::<Address>()
        .with_context(|| format!("invalid {}: {}", name, value))
}

fn validate_private_key(key: &str) -> Result<()> {
    let hex_part = key.strip_prefix("0x").unwrap_or(key);
    if hex_part.len() != 64 || hex::decode(hex_part).is_err() {
        bail!("chain.private_key must be 64 hex characters");
    }
    Ok(())
}
