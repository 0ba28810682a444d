//! CoinGecko simple-price REST client
//!
//! Polls `/simple/price` at a fixed interval. The interval is a hard floor
//! set by the upstream rate limit; errors never shorten or stretch it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::FeedError;
use crate::market::PriceProvider;
use crate::shutdown::ShutdownSignal;
use crate::types::{normalize_symbol, CurrencyType, Price};

/// Response shape: symbol -> currency code -> amount
type SimplePriceResponse = HashMap<String, HashMap<String, serde_json::Value>>;

pub struct CoinGeckoClient {
    client: Client,
    url: String,
    tokens: String,
    currencies: Vec<CurrencyType>,
    precision: String,
    poll_interval: Duration,
    /// Last USD amount per symbol, kept for callers that only need USD
    usd_prices: RwLock<HashMap<String, Decimal>>,
}

impl CoinGeckoClient {
    /// Create a client from the application config
    pub fn new(config: &AppConfig) -> Result<Self> {
        Self::with_settings(
            &config.market.url,
            &config.market.tokens,
            config.currencies()?,
            &config.market.precision,
            config.poll_interval(),
            Duration::from_secs(config.market.request_timeout_secs),
        )
    }

    pub fn with_settings(
        url: &str,
        tokens: &str,
        currencies: Vec<CurrencyType>,
        precision: &str,
        poll_interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.to_string(),
            tokens: tokens.to_string(),
            currencies,
            precision: precision.to_string(),
            poll_interval,
            usd_prices: RwLock::new(HashMap::new()),
        })
    }

    fn query(&self) -> [(&'static str, String); 3] {
        let vs_currencies = self
            .currencies
            .iter()
            .map(|c| c.api_code())
            .collect::<Vec<_>>()
            .join(",");
        [
            ("ids", self.tokens.clone()),
            ("vs_currencies", vs_currencies),
            ("precision", self.precision.clone()),
        ]
    }

    /// Snapshot of the USD-only cache
    pub async fn usd_prices(&self) -> HashMap<String, Decimal> {
        self.usd_prices.read().await.clone()
    }

    async fn get_prices(&self) -> Result<Vec<Price>, FeedError> {
        let response = self
            .client
            .get(&self.url)
            .query(&self.query())
            .send()
            .await
            .map_err(|e| FeedError::Transport(format!("failed to fetch prices: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Transport(format!(
                "market API returned non-success status: {}",
                status
            )));
        }

        let body = response.text().await?;
        let prices = parse_simple_prices(&body)?;

        let mut usd = self.usd_prices.write().await;
        for price in prices.iter().filter(|p| p.currency == CurrencyType::Usd) {
            usd.insert(price.symbol.clone(), price.amount);
        }

        Ok(prices)
    }
}

#[async_trait]
impl PriceProvider for CoinGeckoClient {
    fn name(&self) -> &'static str {
        "CoinGecko"
    }

    async fn fetch(&self) -> Result<Vec<Price>, FeedError> {
        self.get_prices().await
    }

    async fn update_price_from_api(&self, tx: Sender<Vec<Price>>, mut shutdown: ShutdownSignal) {
        info!(source = self.name(), "📡 Starting market price update service");

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.fetch() => result,
            };

            match result {
                Ok(batch) => {
                    info!(source = self.name(), count = batch.len(), "✅ Fetched market prices");
                    if tx.send(batch).await.is_err() {
                        warn!(source = self.name(), "Price batch receiver dropped, stopping poller");
                        return;
                    }
                }
                Err(e) => {
                    error!(source = self.name(), error = %e, "❌ Error fetching prices");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(source = self.name(), "🛑 Market price update service stopped");
    }
}

/// Decode a simple-price body into flattened observations, sorted by symbol then currency.
///
/// Currency codes this service does not model are skipped.
pub(crate) fn parse_simple_prices(body: &str) -> Result<Vec<Price>, FeedError> {
    let raw: SimplePriceResponse = serde_json::from_str(body)
        .map_err(|e| FeedError::Decode(format!("failed to decode response: {}", e)))?;

    let mut prices = Vec::new();
    for (symbol, currencies) in raw {
        for (code, value) in currencies {
            let Some(currency) = CurrencyType::from_str(&code) else {
                debug!(symbol = %symbol, code = %code, "Skipping unsupported currency");
                continue;
            };
            let amount = parse_amount(&value).ok_or_else(|| {
                FeedError::Decode(format!("non-numeric {} amount for {}: {}", code, symbol, value))
            })?;
            prices.push(Price {
                symbol: normalize_symbol(&symbol),
                amount,
                currency,
            });
        }
    }

    prices.sort_by(|a, b| (&a.symbol, a.currency).cmp(&(&b.symbol, b.currency)));
    Ok(prices)
}

fn parse_amount(value: &serde_json::Value) -> Option<Decimal> {
    let serde_json::Value::Number(number) = value else {
        return None;
    };
    let number = number.to_string();
    Decimal::from_str(&number)
        .or_else(|_| Decimal::from_scientific(&number))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_multi_currency_response() {
        let body = r#"{
            "bitcoin": {"usd": 31000.5, "eur": 28500},
            "ethereum": {"usd": 1850.123456, "eur": 1700.1}
        }"#;
        let prices = parse_simple_prices(body).unwrap();

        assert_eq!(prices.len(), 4);
        assert_eq!(prices[0], Price::new("bitcoin", dec!(31000.5), CurrencyType::Usd));
        assert_eq!(prices[1], Price::new("bitcoin", dec!(28500), CurrencyType::Eur));
        assert_eq!(prices[2], Price::new("ethereum", dec!(1850.123456), CurrencyType::Usd));
        assert_eq!(prices[3], Price::new("ethereum", dec!(1700.1), CurrencyType::Eur));
    }

    #[test]
    fn test_parse_skips_unknown_currencies() {
        let body = r#"{"bitcoin": {"usd": 31000, "jpy": 4500000, "last_updated_at": 1700000000}}"#;
        let prices = parse_simple_prices(body).unwrap();
        assert_eq!(prices, vec![Price::usd("bitcoin", dec!(31000))]);
    }

    #[test]
    fn test_parse_rejects_malformed_body() {
        assert!(matches!(
            parse_simple_prices("<html>rate limited</html>"),
            Err(FeedError::Decode(_))
        ));
        assert!(matches!(
            parse_simple_prices(r#"{"bitcoin": {"usd": "n/a"}}"#),
            Err(FeedError::Decode(_))
        ));
    }

    #[test]
    fn test_query_parameters() {
        let client = CoinGeckoClient::with_settings(
            "http://localhost/simple/price",
            "bitcoin,ethereum",
            vec![CurrencyType::Usd, CurrencyType::Eur],
            "6",
            Duration::from_secs(61),
            Duration::from_secs(10),
        )
        .unwrap();

        let query = client.query();
        assert_eq!(query[0], ("ids", "bitcoin,ethereum".to_string()));
        assert_eq!(query[1], ("vs_currencies", "usd,eur".to_string()));
        assert_eq!(query[2], ("precision", "6".to_string()));
    }

    #[cfg(feature = "api")]
    mod http {
        use super::*;
        use axum::extract::Query;
        use axum::http::StatusCode;
        use axum::routing::get;
        use axum::Router;

        async fn serve(router: Router) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });
            format!("http://{}/simple/price", addr)
        }

        fn client(url: &str, poll_interval: Duration) -> CoinGeckoClient {
            CoinGeckoClient::with_settings(
                url,
                "bitcoin",
                vec![CurrencyType::Usd, CurrencyType::Eur],
                "6",
                poll_interval,
                Duration::from_secs(5),
            )
            .unwrap()
        }

        #[tokio::test]
        async fn test_fetch_sends_query_and_caches_usd() {
            let router = Router::new().route(
                "/simple/price",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("ids").map(String::as_str), Some("bitcoin"));
                    assert_eq!(q.get("vs_currencies").map(String::as_str), Some("usd,eur"));
                    assert_eq!(q.get("precision").map(String::as_str), Some("6"));
                    r#"{"bitcoin": {"usd": 31000, "eur": 28500}}"#
                }),
            );
            let url = serve(router).await;
            let client = client(&url, Duration::from_secs(61));

            let prices = client.fetch().await.unwrap();
            assert_eq!(prices.len(), 2);
            assert_eq!(client.usd_prices().await.get("bitcoin"), Some(&dec!(31000)));
        }

        #[tokio::test]
        async fn test_fetch_maps_error_status_to_transport() {
            let router = Router::new().route(
                "/simple/price",
                get(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
            );
            let url = serve(router).await;
            let client = client(&url, Duration::from_secs(61));

            assert!(matches!(client.fetch().await, Err(FeedError::Transport(_))));
            assert!(client.usd_prices().await.is_empty());
        }

        #[tokio::test]
        async fn test_poller_keeps_running_after_errors() {
            use std::sync::atomic::{AtomicUsize, Ordering};
            use std::sync::Arc;

            let hits = Arc::new(AtomicUsize::new(0));
            let counter = hits.clone();
            let router = Router::new().route(
                "/simple/price",
                get(move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string())
                        } else {
                            (StatusCode::OK, r#"{"bitcoin": {"usd": 31000}}"#.to_string())
                        }
                    }
                }),
            );
            let url = serve(router).await;
            let client = Arc::new(client(&url, Duration::from_millis(20)));

            let (trigger, signal) = crate::shutdown::channel();
            let (tx, mut rx) = tokio::sync::mpsc::channel(8);
            let poller = {
                let client = client.clone();
                tokio::spawn(async move { client.update_price_from_api(tx, signal).await })
            };

            let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(batch, vec![Price::usd("bitcoin", dec!(31000))]);
            assert!(hits.load(Ordering::SeqCst) >= 2);

            trigger.trigger();
            tokio::time::timeout(Duration::from_secs(5), poller)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
