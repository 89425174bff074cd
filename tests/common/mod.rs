#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use cryptotrack_backend::{
    build_router,
    services::{
        assets::AssetStore,
        auth::Authenticator,
        clock::ManualClock,
        coingecko::{PriceBatch, PriceProvider, UpstreamError},
        jwks::{JwksError, JwksSource, SigningKeyCache, SigningKeyCacheConfig},
        quote_cache::{QuoteCache, QuoteCacheConfig},
    },
    AppState,
};
use jsonwebtoken::{encode, jwk::JwkSet, Algorithm, EncodingKey, Header};
use migration::MigratorTrait;
use parking_lot::Mutex;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use serde_json::json;

pub const ISSUER: &str = "https://clerk.cryptotrack.test";

pub const RSA_KEY_1: &[u8] = include_bytes!("../fixtures/rsa_key_1.pem");
pub const RSA_KEY_2: &[u8] = include_bytes!("../fixtures/rsa_key_2.pem");
pub const JWKS_KEY_1: &str = include_str!("../fixtures/jwks_key_1.json");
pub const JWKS_KEY_2: &str = include_str!("../fixtures/jwks_key_2.json");
pub const JWKS_BOTH: &str = include_str!("../fixtures/jwks_both.json");

/// Fresh in-memory SQLite database with migrations applied.
///
/// Pinned to a single connection: each SQLite `:memory:` connection is its
/// own database.
pub async fn setup_test_db() -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);

    let db = Database::connect(options).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn jwks(raw: &str) -> JwkSet {
    serde_json::from_str(raw).expect("fixture JWKS should parse")
}

/// The public half of `raw`, republished under a different `kid`
pub fn jwks_with_kid(raw: &str, kid: &str) -> JwkSet {
    let mut set = jwks(raw);
    for key in &mut set.keys {
        key.common.key_id = Some(kid.to_string());
    }
    set
}

/// Price provider with scripted prices. Coins it has no price for come back
/// as a per-symbol error, the way CoinGecko omits unknown ids.
#[derive(Default)]
pub struct FakePrices {
    prices: Mutex<HashMap<String, f64>>,
    failure: Mutex<Option<UpstreamError>>,
    calls: AtomicUsize,
}

impl FakePrices {
    pub fn with_prices(prices: &[(&str, f64)]) -> Arc<Self> {
        let fake = Arc::new(Self::default());
        for (coin, price) in prices {
            fake.set_price(coin, *price);
        }
        fake
    }

    pub fn set_price(&self, coin: &str, price: f64) {
        self.prices.lock().insert(coin.to_string(), price);
    }

    /// Make every subsequent fetch fail with `failure` (or succeed again with `None`)
    pub fn fail_with(&self, failure: Option<UpstreamError>) {
        *self.failure.lock() = failure;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceProvider for FakePrices {
    async fn fetch(&self, coin_ids: &[String]) -> Result<PriceBatch, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(failure) = self.failure.lock().clone() {
            return Err(failure);
        }

        let prices = self.prices.lock();
        Ok(coin_ids
            .iter()
            .map(|id| {
                let price = prices.get(id).copied().ok_or_else(|| {
                    UpstreamError::MalformedResponse(format!("no usd price for {}", id))
                });
                (id.clone(), price)
            })
            .collect())
    }
}

pub struct FakeJwks {
    response: Mutex<Result<JwkSet, JwksError>>,
    calls: AtomicUsize,
}

impl FakeJwks {
    pub fn serving(set: JwkSet) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Ok(set)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn down() -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Err(JwksError::Unreachable("connection refused".to_string()))),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn respond(&self, response: Result<JwkSet, JwksError>) {
        *self.response.lock() = response;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JwksSource for FakeJwks {
    async fn fetch(&self) -> Result<JwkSet, JwksError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.lock().clone()
    }
}

/// RS256 token signed with `private_pem`, carrying `kid` and `claims`
pub fn mint_token(private_pem: &[u8], kid: &str, claims: serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(private_pem).expect("fixture key should parse");
    encode(&header, &claims, &key).expect("token should encode")
}

pub fn claims_for(user_id: &str) -> serde_json::Value {
    let now = Utc::now().timestamp();
    json!({
        "sub": user_id,
        "iss": ISSUER,
        "iat": now,
        "exp": now + 3600,
    })
}

/// Valid token for `user_id` signed with key-1
pub fn token_for(user_id: &str) -> String {
    mint_token(RSA_KEY_1, "key-1", claims_for(user_id))
}

pub fn authenticator(
    jwks: Arc<FakeJwks>,
    clock: Arc<ManualClock>,
) -> (Authenticator, SigningKeyCache) {
    authenticator_with(jwks, clock, SigningKeyCacheConfig::default())
}

pub fn authenticator_with(
    jwks: Arc<FakeJwks>,
    clock: Arc<ManualClock>,
    config: SigningKeyCacheConfig,
) -> (Authenticator, SigningKeyCache) {
    let keys = SigningKeyCache::new(jwks, clock, config);
    (Authenticator::new(keys.clone(), ISSUER), keys)
}

pub struct TestApp {
    pub router: Router,
    pub store: AssetStore,
    pub prices: Arc<FakePrices>,
    pub jwks: Arc<FakeJwks>,
    pub clock: Arc<ManualClock>,
}

/// Full router over in-memory storage, scripted prices and key-1 as the
/// only published signing key
pub async fn test_app(prices: &[(&str, f64)]) -> TestApp {
    test_app_with_jwks(prices, FakeJwks::serving(jwks(JWKS_KEY_1))).await
}

pub async fn test_app_with_jwks(prices: &[(&str, f64)], jwks_source: Arc<FakeJwks>) -> TestApp {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let store = AssetStore::new(db);
    let prices = FakePrices::with_prices(prices);
    let clock = Arc::new(ManualClock::default());

    let quotes = QuoteCache::new(prices.clone(), clock.clone(), QuoteCacheConfig::default())
        .expect("default quote cache config is valid");
    let (auth, _keys) = authenticator(jwks_source.clone(), clock.clone());

    let state = AppState {
        store: store.clone(),
        quotes,
        auth,
    };

    TestApp {
        router: build_router(state, &["http://localhost:3000".to_string()]),
        store,
        prices,
        jwks: jwks_source,
        clock,
    }
}
