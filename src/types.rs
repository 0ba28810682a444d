//! Core types used throughout PriceBridge
//!
//! Defines price observations, currency tags and the fixed-point helpers
//! shared by the market client, the on-chain feed and the price store.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FeedError;

/// Number of decimal digits the target contract keeps (prices are stored in hundredths).
pub const PRICE_SCALE_DIGITS: u32 = 2;

/// Multiplier between a decimal price and its on-chain representation.
pub const PRICE_SCALE: i64 = 100;

/// Supported quote currencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CurrencyType {
    Usd,
    Eur,
}

impl Default for CurrencyType {
    fn default() -> Self {
        CurrencyType::Usd
    }
}

impl CurrencyType {
    /// Lowercase code as used by the market API (`vs_currencies`)
    pub fn api_code(&self) -> &'static str {
        match self {
            CurrencyType::Usd => "usd",
            CurrencyType::Eur => "eur",
        }
    }

    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "USD" => Some(CurrencyType::Usd),
            "EUR" => Some(CurrencyType::Eur),
            _ => None,
        }
    }
}

impl fmt::Display for CurrencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurrencyType::Usd => write!(f, "USD"),
            CurrencyType::Eur => write!(f, "EUR"),
        }
    }
}

/// A single price observation for one symbol in one currency.
///
/// Carries no timestamp; whoever holds it tracks staleness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub currency: CurrencyType,
}

impl Price {
    pub fn new(symbol: impl Into<String>, amount: Decimal, currency: CurrencyType) -> Self {
        Self {
            symbol: normalize_symbol(&symbol.into()),
            amount,
            currency,
        }
    }

    /// USD observation, the unit the on-chain contract is denominated in
    pub fn usd(symbol: impl Into<String>, amount: Decimal) -> Self {
        Self::new(symbol, amount, CurrencyType::Usd)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.symbol, self.amount, self.currency)
    }
}

/// Canonical symbol form: trimmed, lowercase
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_lowercase()
}

/// Convert a decimal price into the contract's fixed-point integer (truncating).
pub fn to_scaled(amount: Decimal) -> Result<i64, FeedError> {
    (amount * Decimal::from(PRICE_SCALE))
        .trunc()
        .to_i64()
        .ok_or_else(|| FeedError::Decode(format!("price {} does not fit a scaled i64", amount)))
}

/// Convert a contract fixed-point integer back into a decimal price (exact).
pub fn from_scaled(scaled: i64) -> Decimal {
    Decimal::new(scaled, PRICE_SCALE_DIGITS)
}

/// Inclusive integer range used as an acceptance test for scaled prices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub lower: i64,
    pub upper: i64,
}

impl Bounds {
    /// Bounds of `center ± tolerance_bps / 10_000`, truncated toward zero.
    pub fn around(center: i64, tolerance_bps: u32) -> Self {
        let center = center as i128;
        let bps = tolerance_bps as i128;
        let lower = center * (10_000 - bps) / 10_000;
        let upper = center * (10_000 + bps) / 10_000;
        Self {
            lower: clamp_i64(lower),
            upper: clamp_i64(upper),
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

fn clamp_i64(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
