//! Error taxonomy for the price pipeline
//!
//! A validation rejection is not an error; see [`crate::feed::Decision`].

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// HTTP or RPC failure (connection, timeout, non-success status)
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body or contract return value could not be interpreted
    #[error("decode error: {0}")]
    Decode(String),

    /// No reference feed is configured for the symbol
    #[error("no reference price feed configured for {0}")]
    NotFound(String),

    /// Transaction submission or confirmation failed
    #[error("failed to write {symbol} price: {reason}")]
    Write { symbol: String, reason: String },

    /// Event subscription could not be established or broke
    #[error("subscription error: {0}")]
    Subscription(String),
}

impl FeedError {
    pub fn write(symbol: &str, reason: impl ToString) -> Self {
        FeedError::Write {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FeedError::Decode(e.to_string())
        } else {
            FeedError::Transport(e.to_string())
        }
    }
}
