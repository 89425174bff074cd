use axum::{extract::State, Json};

use crate::error::ApiError;
use crate::handlers::auth::AuthUser;
use crate::models::portfolio::DashboardStats;
use crate::services::valuation;
use crate::AppState;

/// GET /api/dashboard/stats
pub async fn get_dashboard_stats(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<DashboardStats>, ApiError> {
    let assets = state.store.list_assets(&user_id).await?;

    if assets.is_empty() {
        return Ok(Json(DashboardStats::empty()));
    }

    let quotes = state
        .quotes
        .get_quotes(assets.iter().map(|a| a.symbol.as_str()))
        .await;

    let stats = valuation::dashboard_stats(&assets, &quotes);
    if !stats.unavailable_symbols.is_empty() {
        tracing::warn!(
            "Dashboard computed without prices for: {}",
            stats.unavailable_symbols.join(", ")
        );
    }

    Ok(Json(stats))
}
