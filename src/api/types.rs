//! Request types of the price API

use rust_decimal::Decimal;
use serde::Deserialize;

/// POST /set-price body; missing fields fall back to empty values
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetPriceRequest {
    #[serde(default)]
    pub symbol: String,
    #[serde(default, with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(default, rename = "type")]
    pub currency: String,
}

impl SetPriceRequest {
    /// Symbol and currency present, amount strictly positive
    pub fn is_complete(&self) -> bool {
        !self.symbol.trim().is_empty() && !self.currency.is_empty() && self.amount > Decimal::ZERO
    }
}
