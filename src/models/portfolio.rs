use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Asset row with live valuation attached.
///
/// Price-derived fields are `None` when `quote_unavailable` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedAsset {
    pub id: i32,
    pub user_id: String,
    pub symbol: String,
    pub ticker: String,
    pub quantity: f64,
    pub buy_price: f64,
    pub created_at: DateTime<Utc>,
    pub current_price: Option<f64>,
    pub total_value: Option<f64>,
    pub profit_loss: Option<f64>,
    pub profit_loss_percent: Option<f64>,
    pub stale: bool,
    pub quote_unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetAllocation {
    pub symbol: String,
    pub ticker: String,
    pub value: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_value: f64,
    pub total_invested: f64,
    pub total_pl: f64,
    pub total_pl_percent: f64,
    pub asset_count: usize,
    /// Descending by value, ties by symbol
    pub allocations: Vec<AssetAllocation>,
    /// At least one price was a stale fallback
    pub stale: bool,
    /// Symbols valued at 0 because no price could be resolved
    pub unavailable_symbols: Vec<String>,
}

impl DashboardStats {
    pub fn empty() -> Self {
        Self {
            total_value: 0.0,
            total_invested: 0.0,
            total_pl: 0.0,
            total_pl_percent: 0.0,
            asset_count: 0,
            allocations: Vec::new(),
            stale: false,
            unavailable_symbols: Vec::new(),
        }
    }
}
