// src/lib.rs

use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    routing::{get, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use services::{assets::AssetStore, auth::Authenticator, quote_cache::QuoteCache};

#[derive(Clone)]
pub struct AppState {
    pub store: AssetStore,
    pub quotes: QuoteCache,
    pub auth: Authenticator,
}

pub mod entities {
    pub mod assets;
}

pub mod services {
    pub mod clock;
    pub mod coingecko;
    pub mod quote_cache;
    pub mod jwks;
    pub mod auth;
    pub mod valuation;
    pub mod assets;
}

pub mod config;
pub mod error;
pub mod models;
pub mod handlers;
pub mod jobs;

use handlers::{asset, dashboard, health};

pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/api/assets", get(asset::list_assets).post(asset::create_asset))
        .route(
            "/api/assets/{id}",
            put(asset::update_asset).delete(asset::delete_asset),
        )
        .route("/api/dashboard/stats", get(dashboard::get_dashboard_stats))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
