use std::sync::Arc;

use cryptotrack_backend::{
    build_router,
    config::Settings,
    jobs::jwks_refresh::start_jwks_refresh_job,
    services::{
        assets::AssetStore,
        auth::Authenticator,
        clock::SystemClock,
        coingecko::CoinGeckoService,
        jwks::{HttpJwksSource, SigningKeyCache},
        quote_cache::QuoteCache,
    },
    AppState,
};
use sea_orm::Database;
use sea_orm_migration::MigratorTrait;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cryptotrack_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();
    let settings = Settings::from_env().expect("Invalid configuration");

    // Connect to database
    tracing::info!("Connecting to database...");
    let db = Database::connect(&settings.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    tracing::info!("Running migrations...");
    migration::Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    let clock = Arc::new(SystemClock);

    let coingecko = CoinGeckoService::new(
        settings.coingecko_base_url.clone(),
        settings.coingecko_api_key.clone(),
        settings.http_timeout,
    )
    .expect("Failed to build CoinGecko client");
    let quotes = QuoteCache::new(Arc::new(coingecko), clock.clone(), settings.quote_cache_config())
        .expect("Invalid quote cache configuration");

    let jwks_source = HttpJwksSource::new(settings.jwks_url.clone(), settings.http_timeout)
        .expect("Failed to build JWKS client");
    let keys = SigningKeyCache::new(Arc::new(jwks_source), clock, settings.signing_key_config());
    tracing::info!(
        "Verifying tokens issued by {} (keys from {})",
        settings.clerk_issuer,
        settings.jwks_url
    );

    start_jwks_refresh_job(keys.clone(), settings.jwks_refresh);

    let state = AppState {
        store: AssetStore::new(db),
        quotes,
        auth: Authenticator::new(keys, &settings.clerk_issuer),
    };

    let app = build_router(state, &settings.cors_origins);

    // Start server
    let addr = settings.bind_addr().expect("Invalid bind address");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
