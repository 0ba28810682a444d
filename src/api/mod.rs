//! Price HTTP API
//!
//! Serves the shared price cache to external clients and accepts manual
//! overrides for allow-listed symbols and currencies.

pub mod types;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::shutdown::ShutdownSignal;
use crate::store::PriceStore;
use crate::types::{normalize_symbol, CurrencyType, Price};
use types::SetPriceRequest;

struct CachedPrices {
    built_at: Instant,
    prices: Vec<Price>,
}

pub struct ApiState {
    store: Arc<PriceStore>,
    allowed_symbols: HashSet<String>,
    allowed_currencies: Vec<CurrencyType>,
    ready_timeout: Duration,
    cache_ttl: Duration,
    cache: RwLock<Option<CachedPrices>>,
}

impl ApiState {
    pub fn new(store: Arc<PriceStore>, config: &ApiConfig) -> Self {
        Self {
            store,
            allowed_symbols: config
                .allowed_symbols
                .iter()
                .map(|s| normalize_symbol(s))
                .collect(),
            allowed_currencies: config
                .allowed_currencies
                .iter()
                .filter_map(|c| CurrencyType::from_str(c))
                .collect(),
            ready_timeout: Duration::from_millis(config.ready_timeout_ms),
            cache_ttl: Duration::from_millis(config.response_cache_ms),
            cache: RwLock::new(None),
        }
    }

    async fn cached_snapshot(&self) -> Vec<Price> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.built_at.elapsed() < self.cache_ttl {
                return cached.prices.clone();
            }
        }

        let prices = self.store.snapshot().await;
        *self.cache.write().await = Some(CachedPrices {
            built_at: Instant::now(),
            prices: prices.clone(),
        });
        prices
    }

    async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }

    fn allowed_currency(&self, code: &str) -> Option<CurrencyType> {
        self.allowed_currencies
            .iter()
            .copied()
            .find(|currency| currency.to_string() == code)
    }
}

/// Create the API router
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/prices", get(get_prices))
        .route("/set-price", post(set_price))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
}

/// GET /prices - Current prices, once the first batch has landed
async fn get_prices(State(state): State<Arc<ApiState>>) -> Response {
    if !state.store.wait_ready(state.ready_timeout).await {
        return (StatusCode::SERVICE_UNAVAILABLE, "prices not ready").into_response();
    }
    Json(state.cached_snapshot().await).into_response()
}

/// POST /set-price - Manual override
async fn set_price(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let request: SetPriceRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Rejected set-price body");
            return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
        }
    };

    if !request.is_complete() {
        return (StatusCode::BAD_REQUEST, "Invalid price data").into_response();
    }

    let Some(currency) = state.allowed_currency(&request.currency) else {
        return (StatusCode::BAD_REQUEST, "Invalid currency type").into_response();
    };

    let symbol = normalize_symbol(&request.symbol);
    if !state.allowed_symbols.contains(&symbol) {
        warn!(symbol = %symbol, "⚠️ Manual price for unknown symbol");
        return (StatusCode::NOT_FOUND, "Unknown symbol").into_response();
    }

    let price = Price::new(symbol, request.amount, currency);
    info!(price = %price, "🔧 Manually set price");
    state.store.set(price).await;
    state.invalidate_cache().await;

    StatusCode::OK.into_response()
}

/// Serve the API until shutdown
pub async fn serve(bind_addr: &str, state: Arc<ApiState>, mut shutdown: ShutdownSignal) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind price API on {}", bind_addr))?;
    info!("🖥️ Price API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Price API server failed")?;

    info!("🛑 Price API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    fn config(ready_timeout_ms: u64, response_cache_ms: u64) -> ApiConfig {
        ApiConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            allowed_symbols: vec!["bitcoin".to_string(), "ethereum".to_string()],
            allowed_currencies: vec!["USD".to_string(), "EUR".to_string()],
            ready_timeout_ms,
            response_cache_ms,
        }
    }

    fn app(store: Arc<PriceStore>, response_cache_ms: u64) -> Router {
        create_router(Arc::new(ApiState::new(store, &config(50, response_cache_ms))))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get_prices_request() -> Request<Body> {
        Request::get("/prices").body(Body::empty()).unwrap()
    }

    fn set_price_request(body: &str) -> Request<Body> {
        Request::post("/set-price")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_prices_not_ready() {
        let response = app(Arc::new(PriceStore::new()), 0)
            .oneshot(get_prices_request())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, "prices not ready");
    }

    #[tokio::test]
    async fn test_prices_sorted_snapshot() {
        let store = Arc::new(PriceStore::new());
        store
            .apply_batch(&[
                Price::usd("ethereum", dec!(1850)),
                Price::usd("bitcoin", dec!(31000.5)),
            ])
            .await;

        let response = app(store, 0).oneshot(get_prices_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"symbol": "bitcoin", "amount": 31000.5, "type": "USD"},
                {"symbol": "ethereum", "amount": 1850.0, "type": "USD"},
            ])
        );
    }

    #[tokio::test]
    async fn test_set_price_validation() {
        let store = Arc::new(PriceStore::new());
        let app = app(store.clone(), 0);

        let cases = [
            ("not json", StatusCode::BAD_REQUEST, "Invalid request body"),
            (r#"{"symbol":"","amount":1,"type":"USD"}"#, StatusCode::BAD_REQUEST, "Invalid price data"),
            (r#"{"symbol":"bitcoin","amount":0,"type":"USD"}"#, StatusCode::BAD_REQUEST, "Invalid price data"),
            (r#"{"symbol":"bitcoin","amount":1}"#, StatusCode::BAD_REQUEST, "Invalid price data"),
            (r#"{"symbol":"bitcoin","amount":1,"type":"GBP"}"#, StatusCode::BAD_REQUEST, "Invalid currency type"),
            (r#"{"symbol":"dogecoin","amount":1,"type":"USD"}"#, StatusCode::NOT_FOUND, "Unknown symbol"),
        ];
        for (body, status, message) in cases {
            let response = app.clone().oneshot(set_price_request(body)).await.unwrap();
            assert_eq!(response.status(), status, "body: {}", body);
            assert_eq!(body_text(response).await, message);
        }
        assert!(store.snapshot().await.is_empty());

        let response = app
            .oneshot(set_price_request(r#"{"symbol":"Bitcoin","amount":29000.25,"type":"EUR"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.get("bitcoin", CurrencyType::Eur).await, Some(dec!(29000.25)));
    }

    #[tokio::test]
    async fn test_manual_set_invalidates_response_cache() {
        let store = Arc::new(PriceStore::new());
        store.apply_batch(&[Price::usd("bitcoin", dec!(31000))]).await;
        let app = app(store.clone(), 60_000);

        let first = body_text(app.clone().oneshot(get_prices_request()).await.unwrap()).await;
        assert!(first.contains("31000"));

        // Direct store writes are hidden by the cache
        store.set(Price::usd("bitcoin", dec!(32000))).await;
        let cached = body_text(app.clone().oneshot(get_prices_request()).await.unwrap()).await;
        assert_eq!(cached, first);

        let response = app
            .clone()
            .oneshot(set_price_request(r#"{"symbol":"bitcoin","amount":33000,"type":"USD"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let fresh = body_text(app.oneshot(get_prices_request()).await.unwrap()).await;
        assert!(fresh.contains("33000"));
    }
}
