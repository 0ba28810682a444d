//! PriceBridge Library
//!
//! Bridges an off-chain market price API and an on-chain price oracle
//! contract. Market prices are validated against the last on-chain value and
//! an independent reference oracle before they are written, and every price
//! is republished through an in-memory store.

pub mod aggregator;
pub mod chain;
pub mod config;
pub mod error;
pub mod feed;
pub mod market;
pub mod pipeline;
pub mod shutdown;
pub mod store;
pub mod types;

#[cfg(feature = "api")]
pub mod api;
