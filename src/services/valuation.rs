//! Portfolio valuation
//!
//! Pure functions over asset rows and a (possibly partial) quote mapping.
//! An asset whose quote could not be resolved is flagged rather than
//! failing the whole computation.

use std::collections::{BTreeSet, HashMap};

use crate::entities::assets;
use crate::models::portfolio::{AssetAllocation, DashboardStats, EnrichedAsset};
use crate::services::quote_cache::{canonical_symbol, Quote, QuoteResult};

/// `part / whole * 100`, or 0 when `whole` is 0
pub fn percent_of(part: f64, whole: f64) -> f64 {
    if whole == 0.0 { 0.0 } else { part / whole * 100.0 }
}

fn resolved_quote<'a>(quotes: &'a HashMap<String, QuoteResult>, symbol: &str) -> Option<&'a Quote> {
    quotes
        .get(&canonical_symbol(symbol))
        .and_then(|result| result.as_ref().ok())
}

/// Attach current price, value and profit/loss to each asset, keeping order
pub fn enrich(assets: &[assets::Model], quotes: &HashMap<String, QuoteResult>) -> Vec<EnrichedAsset> {
    assets
        .iter()
        .map(|asset| {
            let quote = resolved_quote(quotes, &asset.symbol);
            let invested = asset.quantity * asset.buy_price;

            let (current_price, total_value, profit_loss, profit_loss_percent) = match quote {
                Some(quote) => {
                    let total_value = asset.quantity * quote.price;
                    let profit_loss = total_value - invested;
                    (
                        Some(quote.price),
                        Some(total_value),
                        Some(profit_loss),
                        Some(percent_of(profit_loss, invested)),
                    )
                }
                None => (None, None, None, None),
            };

            EnrichedAsset {
                id: asset.id,
                user_id: asset.user_id.clone(),
                symbol: asset.symbol.clone(),
                ticker: asset.ticker.clone(),
                quantity: asset.quantity,
                buy_price: asset.buy_price,
                created_at: asset.created_at,
                current_price,
                total_value,
                profit_loss,
                profit_loss_percent,
                stale: quote.is_some_and(|q| q.stale),
                quote_unavailable: quote.is_none(),
            }
        })
        .collect()
}

/// Portfolio totals and per-symbol allocation
pub fn dashboard_stats(
    assets: &[assets::Model],
    quotes: &HashMap<String, QuoteResult>,
) -> DashboardStats {
    if assets.is_empty() {
        return DashboardStats::empty();
    }

    let mut total_value = 0.0;
    let mut total_invested = 0.0;
    let mut stale = false;
    let mut unavailable = BTreeSet::new();

    // symbol -> index into `allocations`; first row seen supplies the ticker
    let mut groups: HashMap<&str, usize> = HashMap::new();
    let mut allocations: Vec<AssetAllocation> = Vec::new();

    for asset in assets {
        let value = match resolved_quote(quotes, &asset.symbol) {
            Some(quote) => {
                stale |= quote.stale;
                asset.quantity * quote.price
            }
            None => {
                unavailable.insert(asset.symbol.clone());
                0.0
            }
        };

        total_value += value;
        total_invested += asset.quantity * asset.buy_price;

        match groups.get(asset.symbol.as_str()) {
            Some(&i) => allocations[i].value += value,
            None => {
                groups.insert(asset.symbol.as_str(), allocations.len());
                allocations.push(AssetAllocation {
                    symbol: asset.symbol.clone(),
                    ticker: asset.ticker.clone(),
                    value,
                    percentage: 0.0,
                });
            }
        }
    }

    for allocation in &mut allocations {
        allocation.percentage = percent_of(allocation.value, total_value);
    }

    allocations.sort_by(|a, b| {
        b.value
            .total_cmp(&a.value)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    let total_pl = total_value - total_invested;

    DashboardStats {
        total_value,
        total_invested,
        total_pl,
        total_pl_percent: percent_of(total_pl, total_invested),
        asset_count: assets.len(),
        allocations,
        stale,
        unavailable_symbols: unavailable.into_iter().collect(),
    }
}
