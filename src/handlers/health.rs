use axum::{extract::State, Json};

use crate::models::health::{HealthResponse, ServiceInfo};
use crate::AppState;

pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        message: "CryptoTrack API".to_string(),
        status: "running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        cached_quotes: state.quotes.cached_count(),
    })
}
