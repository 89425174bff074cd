use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::assets;
use crate::services::quote_cache::canonical_symbol;

pub const MAX_SYMBOL_LEN: usize = 100;
pub const MAX_TICKER_LEN: usize = 10;
pub const MAX_QUANTITY: f64 = 1_000_000_000.0;
pub const MAX_BUY_PRICE: f64 = 100_000_000.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Body of POST /api/assets
#[derive(Debug, Clone, Deserialize)]
pub struct AssetCreate {
    pub symbol: String, // CoinGecko id, e.g. "bitcoin"
    pub ticker: String, // e.g. "BTC"
    pub quantity: f64,
    pub buy_price: f64,
}

/// Validated, normalized asset ready to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct NewAsset {
    pub symbol: String,
    pub ticker: String,
    pub quantity: f64,
    pub buy_price: f64,
}

/// Body of PUT /api/assets/{id}; absent fields are left untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssetUpdate {
    pub quantity: Option<f64>,
    pub buy_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetResponse {
    pub id: i32,
    pub user_id: String,
    pub symbol: String,
    pub ticker: String,
    pub quantity: f64,
    pub buy_price: f64,
    pub created_at: DateTime<Utc>,
}

impl From<assets::Model> for AssetResponse {
    fn from(model: assets::Model) -> Self {
        Self {
            id: model.id,
            user_id: model.user_id,
            symbol: model.symbol,
            ticker: model.ticker,
            quantity: model.quantity,
            buy_price: model.buy_price,
            created_at: model.created_at,
        }
    }
}

impl AssetCreate {
    pub fn validate(self) -> Result<NewAsset, ValidationError> {
        let symbol = canonical_symbol(&self.symbol);
        let ticker = self.ticker.trim().to_uppercase();

        check_len("symbol", &symbol, MAX_SYMBOL_LEN)?;
        check_len("ticker", &ticker, MAX_TICKER_LEN)?;
        check_range("quantity", self.quantity, MAX_QUANTITY)?;
        check_range("buy_price", self.buy_price, MAX_BUY_PRICE)?;

        Ok(NewAsset {
            symbol,
            ticker,
            quantity: self.quantity,
            buy_price: self.buy_price,
        })
    }
}

impl AssetUpdate {
    pub fn validate(self) -> Result<Self, ValidationError> {
        if let Some(quantity) = self.quantity {
            check_range("quantity", quantity, MAX_QUANTITY)?;
        }
        if let Some(buy_price) = self.buy_price {
            check_range("buy_price", buy_price, MAX_BUY_PRICE)?;
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.quantity.is_none() && self.buy_price.is_none()
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len == 0 || len > max {
        return Err(ValidationError(format!(
            "{} must be between 1 and {} characters",
            field, max
        )));
    }
    Ok(())
}

fn check_range(field: &str, value: f64, max: f64) -> Result<(), ValidationError> {
    // Written so that NaN fails too
    if !(value > 0.0 && value <= max) {
        return Err(ValidationError(format!(
            "{} must be greater than 0 and at most {}",
            field, max
        )));
    }
    Ok(())
}
