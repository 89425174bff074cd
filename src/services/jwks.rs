//! Signing-Key Cache
//!
//! Holds the JWKS published by the identity provider as a map of
//! `kid -> DecodingKey`. The set is always replaced wholesale. Refreshes are
//! coalesced: while one is in flight, every caller that needs fresh keys
//! waits on it instead of starting another.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{jwk::JwkSet, DecodingKey};
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::services::clock::{self, Clock};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JwksError {
    #[error("JWKS endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("malformed JWKS document: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("no signing key with kid {0}")]
    UnknownKey(String),
    #[error("signing keys unavailable")]
    ServiceUnavailable,
}

#[async_trait]
pub trait JwksSource: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, JwksError>;
}

/// Fetches the key set over HTTP, e.g. `{issuer}/.well-known/jwks.json`
pub struct HttpJwksSource {
    client: Client,
    url: String,
}

impl HttpJwksSource {
    pub fn new(url: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url,
        })
    }
}

#[async_trait]
impl JwksSource for HttpJwksSource {
    async fn fetch(&self) -> Result<JwkSet, JwksError> {
        let response = self
            .client
            .get(&self.url)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| JwksError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::Unreachable(format!(
                "JWKS endpoint returned {}",
                response.status()
            )));
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| JwksError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct SigningKeyCacheConfig {
    /// Age after which the set is refetched on next use
    pub refresh_interval: Duration,
    /// Quiet period after any refresh during which only `invalidate()` can
    /// trigger another one. Zero (the default) disables it.
    pub min_refresh_interval: Duration,
}

impl Default for SigningKeyCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(3600),
            min_refresh_interval: Duration::ZERO,
        }
    }
}

struct KeySet {
    keys: HashMap<String, Arc<DecodingKey>>,
    fetched_at: DateTime<Utc>,
}

impl KeySet {
    fn from_jwks(jwks: JwkSet, fetched_at: DateTime<Utc>) -> Self {
        let mut keys = HashMap::with_capacity(jwks.keys.len());

        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                tracing::warn!("Skipping JWK without kid");
                continue;
            };

            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, Arc::new(key));
                }
                Err(e) => tracing::warn!("Skipping unusable JWK {}: {}", kid, e),
            }
        }

        Self { keys, fetched_at }
    }

    fn lookup(&self, kid: &str) -> Result<Arc<DecodingKey>, KeyError> {
        self.keys
            .get(kid)
            .cloned()
            .ok_or_else(|| KeyError::UnknownKey(kid.to_string()))
    }
}

#[derive(Clone)]
struct RefreshOutcome {
    /// Invalidation generation the refresh started at
    generation: u64,
    /// Set in effect once the refresh settled (last known set on failure)
    keys: Option<Arc<KeySet>>,
    error: Option<JwksError>,
}

type PendingRefresh = watch::Receiver<Option<RefreshOutcome>>;

#[derive(Default)]
struct KeyState {
    current: Option<Arc<KeySet>>,
    invalidated: bool,
    /// Bumped by every `invalidate()`
    generation: u64,
    quiet_until: Option<DateTime<Utc>>,
    refreshing: Option<PendingRefresh>,
}

struct Inner {
    source: Arc<dyn JwksSource>,
    clock: Arc<dyn Clock>,
    refresh_interval: ChronoDuration,
    min_refresh_interval: ChronoDuration,
    state: Mutex<KeyState>,
}

#[derive(Clone)]
pub struct SigningKeyCache {
    inner: Arc<Inner>,
}

impl SigningKeyCache {
    pub fn new(
        source: Arc<dyn JwksSource>,
        clock: Arc<dyn Clock>,
        config: SigningKeyCacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                clock,
                refresh_interval: ChronoDuration::from_std(config.refresh_interval)
                    .unwrap_or(ChronoDuration::MAX),
                min_refresh_interval: ChronoDuration::from_std(config.min_refresh_interval)
                    .unwrap_or(ChronoDuration::MAX),
                state: Mutex::new(KeyState::default()),
            }),
        }
    }

    /// Public key for `kid`, refreshing the set first when it is missing,
    /// expired, invalidated, or lacks `kid`.
    pub async fn get_key(&self, kid: &str) -> Result<Arc<DecodingKey>, KeyError> {
        let mut rejoined = false;

        loop {
            let (pending, generation) = {
                let now = self.inner.clock.now();
                let mut state = self.inner.state.lock();

                if !self.inner.needs_refresh(&state, kid, now) {
                    return match &state.current {
                        Some(set) => set.lookup(kid),
                        None => Err(KeyError::ServiceUnavailable),
                    };
                }

                (self.join_or_begin_refresh(&mut state), state.generation)
            };

            let outcome = self.await_refresh(pending).await;

            // Joined a refresh that began before the latest invalidate(); its
            // document may predate the rotation, so wait for a fresh one
            if outcome.generation < generation && !rejoined {
                rejoined = true;
                continue;
            }

            return match outcome.keys {
                Some(set) => set.lookup(kid),
                None => Err(KeyError::ServiceUnavailable),
            };
        }
    }

    /// Force the next `get_key` to refetch the set, bypassing the quiet period.
    ///
    /// Call after a signature mismatch on a token whose `kid` matched.
    pub fn invalidate(&self) {
        tracing::info!("Signing keys invalidated");
        let mut state = self.inner.state.lock();
        state.invalidated = true;
        state.generation += 1;
    }

    /// Refetch the set now (joining any refresh already in flight).
    /// Returns the number of keys held afterwards.
    pub async fn refresh(&self) -> Result<usize, JwksError> {
        let pending = {
            let mut state = self.inner.state.lock();
            self.join_or_begin_refresh(&mut state)
        };

        let outcome = self.await_refresh(pending).await;

        match outcome.error {
            Some(e) => Err(e),
            None => Ok(outcome.keys.map(|set| set.keys.len()).unwrap_or(0)),
        }
    }

    fn join_or_begin_refresh(&self, state: &mut KeyState) -> PendingRefresh {
        if let Some(pending) = &state.refreshing {
            return pending.clone();
        }

        let (tx, rx) = watch::channel(None);
        state.refreshing = Some(rx.clone());
        self.spawn_refresh(tx, state.generation);
        rx
    }

    async fn await_refresh(&self, mut pending: PendingRefresh) -> RefreshOutcome {
        let settled = match pending.wait_for(Option::is_some).await {
            Ok(resolved) => resolved.clone(),
            Err(_) => None,
        };

        // The refresh task died without settling; answer from what we hold
        settled.unwrap_or_else(|| RefreshOutcome {
            generation: 0,
            keys: self.inner.state.lock().current.clone(),
            error: Some(JwksError::Unreachable("JWKS refresh aborted".to_string())),
        })
    }

    fn spawn_refresh(&self, resolved: watch::Sender<Option<RefreshOutcome>>, generation: u64) {
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut guard = RefreshGuard {
                inner: Arc::clone(&inner),
                armed: true,
            };

            let fetched = inner.source.fetch().await;
            let outcome = inner.settle(fetched, generation);
            guard.armed = false;

            resolved.send_replace(Some(outcome));
        });
    }
}

impl Inner {
    fn needs_refresh(&self, state: &KeyState, kid: &str, now: DateTime<Utc>) -> bool {
        if state.invalidated {
            return true;
        }

        let wanted = match &state.current {
            None => true,
            Some(set) => {
                !clock::is_fresh(set.fetched_at, now, self.refresh_interval)
                    || !set.keys.contains_key(kid)
            }
        };

        wanted && state.quiet_until.is_none_or(|until| now >= until)
    }

    fn settle(&self, fetched: Result<JwkSet, JwksError>, generation: u64) -> RefreshOutcome {
        let now = self.clock.now();
        let mut state = self.state.lock();

        state.refreshing = None;
        // An invalidate() that landed mid-flight still needs its own refetch
        if state.generation == generation {
            state.invalidated = false;
        }
        state.quiet_until = Some(
            now.checked_add_signed(self.min_refresh_interval)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );

        let error = match fetched {
            Ok(jwks) => {
                let set = KeySet::from_jwks(jwks, now);
                tracing::info!("Refreshed JWKS: {} signing keys", set.keys.len());
                state.current = Some(Arc::new(set));
                None
            }
            Err(e) => {
                match &state.current {
                    Some(_) => tracing::error!("JWKS refresh failed, keeping last known keys: {}", e),
                    None => tracing::error!("JWKS refresh failed with no keys cached: {}", e),
                }
                Some(e)
            }
        };

        RefreshOutcome {
            generation,
            keys: state.current.clone(),
            error,
        }
    }
}

/// Releases the in-flight marker if the refresh task unwinds
struct RefreshGuard {
    inner: Arc<Inner>,
    armed: bool,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().refreshing = None;
        }
    }
}
