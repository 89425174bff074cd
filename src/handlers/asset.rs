use axum::{extract::State, http::StatusCode, Json};

use crate::error::ApiError;
use crate::handlers::auth::AuthUser;
use crate::handlers::extract::{ApiJson, ApiPath};
use crate::models::asset::{AssetCreate, AssetResponse, AssetUpdate};
use crate::models::portfolio::EnrichedAsset;
use crate::services::valuation;
use crate::AppState;

/// GET /api/assets
///
/// Always 200 once authenticated; assets whose price could not be resolved
/// come back flagged `quote_unavailable`.
pub async fn list_assets(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<EnrichedAsset>>, ApiError> {
    let assets = state.store.list_assets(&user_id).await?;

    if assets.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let quotes = state
        .quotes
        .get_quotes(assets.iter().map(|a| a.symbol.as_str()))
        .await;

    Ok(Json(valuation::enrich(&assets, &quotes)))
}

pub async fn create_asset(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    ApiJson(payload): ApiJson<AssetCreate>,
) -> Result<(StatusCode, Json<AssetResponse>), ApiError> {
    let new_asset = payload.validate()?;
    let asset = state.store.create_asset(&user_id, new_asset).await?;

    Ok((StatusCode::CREATED, Json(asset.into())))
}

pub async fn update_asset(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(payload): ApiJson<AssetUpdate>,
) -> Result<Json<AssetResponse>, ApiError> {
    let changes = payload.validate()?;
    let asset = state.store.update_asset(&user_id, id, changes).await?;

    Ok(Json(asset.into()))
}

pub async fn delete_asset(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    ApiPath(id): ApiPath<i32>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_asset(&user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
