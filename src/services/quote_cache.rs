//! Price Quote Cache
//!
//! Bounded-staleness cache in front of a [`PriceProvider`]. Fresh entries are
//! served without touching the network; concurrent misses for the same symbol
//! share one upstream call; when the provider throttles or fails, the last
//! known quote is served flagged as stale instead of failing the caller.
//!
//! A single mutex guards both the quote slots and the in-flight table, so the
//! hit/miss decision and the installation of the pending marker happen in one
//! critical section. The provider call itself runs in a spawned task, outside
//! the lock, and keeps running even if every waiter gives up.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::services::clock::{self, Clock};
use crate::services::coingecko::{PriceBatch, PriceProvider, UpstreamError};

/// Cached USD price for one coin id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub fetched_at: DateTime<Utc>,
    /// Set when served past its TTL because a refresh failed
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QuoteError {
    #[error("quote unavailable for {symbol}: {cause}")]
    Unavailable { symbol: String, cause: UpstreamError },
    #[error("timed out waiting for quote of {symbol}")]
    Timeout { symbol: String },
}

pub type QuoteResult = Result<Quote, QuoteError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuoteCacheConfigError {
    #[error("quote TTL must be greater than zero")]
    ZeroTtl,
    #[error("quote wait timeout must be greater than zero")]
    ZeroWaitTimeout,
    #[error("duration out of range: {0:?}")]
    OutOfRange(Duration),
}

#[derive(Debug, Clone)]
pub struct QuoteCacheConfig {
    pub ttl: Duration,
    /// How long a caller waits on an in-flight fetch before giving up locally
    pub wait_timeout: Duration,
    /// Oldest quote still acceptable as a fallback. `None` = no limit.
    pub max_staleness: Option<Duration>,
}

impl Default for QuoteCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(10),
            max_staleness: None,
        }
    }
}

type BatchOutcome = Arc<HashMap<String, QuoteResult>>;
type PendingFetch = watch::Receiver<Option<BatchOutcome>>;

#[derive(Default)]
struct Slots {
    quotes: HashMap<String, Arc<Quote>>,
    pending: HashMap<String, PendingFetch>,
}

struct Inner {
    provider: Arc<dyn PriceProvider>,
    clock: Arc<dyn Clock>,
    ttl: ChronoDuration,
    wait_timeout: Duration,
    max_staleness: Option<ChronoDuration>,
    slots: Mutex<Slots>,
}

#[derive(Clone)]
pub struct QuoteCache {
    inner: Arc<Inner>,
}

/// Canonical form of a coin id: trimmed, lowercase
pub fn canonical_symbol(symbol: &str) -> String {
    symbol.trim().to_lowercase()
}

fn to_chrono(duration: Duration) -> Result<ChronoDuration, QuoteCacheConfigError> {
    ChronoDuration::from_std(duration).map_err(|_| QuoteCacheConfigError::OutOfRange(duration))
}

impl QuoteCache {
    pub fn new(
        provider: Arc<dyn PriceProvider>,
        clock: Arc<dyn Clock>,
        config: QuoteCacheConfig,
    ) -> Result<Self, QuoteCacheConfigError> {
        if config.ttl.is_zero() {
            return Err(QuoteCacheConfigError::ZeroTtl);
        }
        if config.wait_timeout.is_zero() {
            return Err(QuoteCacheConfigError::ZeroWaitTimeout);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                provider,
                clock,
                ttl: to_chrono(config.ttl)?,
                wait_timeout: config.wait_timeout,
                max_staleness: config.max_staleness.map(to_chrono).transpose()?,
                slots: Mutex::new(Slots::default()),
            }),
        })
    }

    /// Resolve quotes for the distinct canonical forms of `symbols`.
    ///
    /// Every requested (non-empty) symbol has an entry in the result. Failures
    /// are per symbol; one bad symbol never fails its siblings.
    pub async fn get_quotes<I, S>(&self, symbols: I) -> HashMap<String, QuoteResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let requested: HashSet<String> = symbols
            .into_iter()
            .map(|s| canonical_symbol(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();

        let mut results = HashMap::with_capacity(requested.len());
        if requested.is_empty() {
            return results;
        }

        let mut waits: Vec<(String, PendingFetch)> = Vec::new();
        let mut to_fetch: Vec<String> = Vec::new();
        let mut resolver = None;

        {
            let now = self.inner.clock.now();
            let mut slots = self.inner.slots.lock();

            for symbol in requested {
                if let Some(quote) = slots.quotes.get(&symbol) {
                    if clock::is_fresh(quote.fetched_at, now, self.inner.ttl) {
                        results.insert(symbol, Ok(Quote::clone(quote)));
                        continue;
                    }
                }

                if let Some(pending) = slots.pending.get(&symbol) {
                    waits.push((symbol, pending.clone()));
                    continue;
                }

                to_fetch.push(symbol);
            }

            if !to_fetch.is_empty() {
                let (tx, rx) = watch::channel(None);
                for symbol in &to_fetch {
                    slots.pending.insert(symbol.clone(), rx.clone());
                    waits.push((symbol.clone(), rx.clone()));
                }
                resolver = Some(tx);
            }
        }

        tracing::debug!(
            "Quote lookup: {} fresh, {} awaiting fetch ({} new)",
            results.len(),
            waits.len(),
            to_fetch.len()
        );

        if let Some(tx) = resolver {
            self.spawn_fetch(to_fetch, tx);
        }

        let deadline = tokio::time::Instant::now() + self.inner.wait_timeout;

        for (symbol, mut pending) in waits {
            let waited = tokio::time::timeout_at(deadline, pending.wait_for(Option::is_some)).await;

            let result = match waited {
                Err(_) => {
                    tracing::warn!("Timed out waiting for {} quote", symbol);
                    Err(QuoteError::Timeout {
                        symbol: symbol.clone(),
                    })
                }
                Ok(Err(_)) => Err(aborted(&symbol)),
                Ok(Ok(resolved)) => resolved
                    .as_ref()
                    .and_then(|batch| batch.get(&symbol).cloned())
                    .unwrap_or_else(|| Err(aborted(&symbol))),
            };

            results.insert(symbol, result);
        }

        results
    }

    /// Number of symbols with a cached quote, fresh or not
    pub fn cached_count(&self) -> usize {
        self.inner.slots.lock().quotes.len()
    }

    fn spawn_fetch(&self, symbols: Vec<String>, resolved: watch::Sender<Option<BatchOutcome>>) {
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut guard = PendingGuard {
                inner: Arc::clone(&inner),
                symbols: symbols.clone(),
                armed: true,
            };

            let fetched = inner.provider.fetch(&symbols).await;
            let outcome = inner.settle(&symbols, fetched);
            guard.armed = false;

            resolved.send_replace(Some(Arc::new(outcome)));
        });
    }
}

impl Inner {
    /// Apply a fetch result: store fresh quotes, pick fallbacks for the rest,
    /// and clear the pending markers, all under one lock.
    fn settle(
        &self,
        symbols: &[String],
        fetched: Result<PriceBatch, UpstreamError>,
    ) -> HashMap<String, QuoteResult> {
        if let Err(e) = &fetched {
            tracing::warn!("Price fetch for {} symbols failed: {}", symbols.len(), e);
        }

        let now = self.clock.now();
        let mut slots = self.slots.lock();
        let mut outcome = HashMap::with_capacity(symbols.len());

        for symbol in symbols {
            slots.pending.remove(symbol);

            let price = match &fetched {
                Ok(batch) => batch.get(symbol).cloned().unwrap_or_else(|| {
                    Err(UpstreamError::MalformedResponse(format!(
                        "{} missing from batch",
                        symbol
                    )))
                }),
                Err(e) => Err(e.clone()),
            };

            let result = match price {
                Ok(price) => {
                    let quote = Quote {
                        symbol: symbol.clone(),
                        price,
                        fetched_at: now,
                        stale: false,
                    };
                    slots.quotes.insert(symbol.clone(), Arc::new(quote.clone()));
                    Ok(quote)
                }
                Err(cause) => self.fallback(slots.quotes.get(symbol), symbol, now, cause),
            };

            outcome.insert(symbol.clone(), result);
        }

        outcome
    }

    fn fallback(
        &self,
        cached: Option<&Arc<Quote>>,
        symbol: &str,
        now: DateTime<Utc>,
        cause: UpstreamError,
    ) -> QuoteResult {
        match cached {
            Some(quote) if self.acceptable_fallback(quote, now) => {
                tracing::warn!(
                    "Serving stale {} quote ({}s old): {}",
                    symbol,
                    now.signed_duration_since(quote.fetched_at).num_seconds(),
                    cause
                );
                Ok(Quote {
                    stale: true,
                    ..Quote::clone(quote)
                })
            }
            _ => {
                tracing::warn!("No usable quote for {}: {}", symbol, cause);
                Err(QuoteError::Unavailable {
                    symbol: symbol.to_string(),
                    cause,
                })
            }
        }
    }

    fn acceptable_fallback(&self, quote: &Quote, now: DateTime<Utc>) -> bool {
        match self.max_staleness {
            Some(ceiling) => clock::is_fresh(quote.fetched_at, now, ceiling),
            None => true,
        }
    }
}

fn aborted(symbol: &str) -> QuoteError {
    QuoteError::Unavailable {
        symbol: symbol.to_string(),
        cause: UpstreamError::Unreachable("price fetch aborted".to_string()),
    }
}

/// Clears pending markers if the fetch task unwinds before settling
struct PendingGuard {
    inner: Arc<Inner>,
    symbols: Vec<String>,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.inner.slots.lock();
            for symbol in &self.symbols {
                slots.pending.remove(symbol);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use async_trait::async_trait;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Behavior {
        /// Ids missing from the map come back malformed
        Prices(HashMap<String, f64>),
        Fail(UpstreamError),
        Panic,
    }

    struct ScriptedProvider {
        calls: AtomicUsize,
        requested: Mutex<Vec<Vec<String>>>,
        behavior: Mutex<Behavior>,
        delay: Duration,
    }

    impl ScriptedProvider {
        fn new(prices: &[(&str, f64)]) -> Arc<Self> {
            Self::with_delay(prices, Duration::ZERO)
        }

        fn with_delay(prices: &[(&str, f64)], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                requested: Mutex::new(Vec::new()),
                behavior: Mutex::new(Behavior::Prices(price_map(prices))),
                delay,
            })
        }

        fn set(&self, behavior: Behavior) {
            *self.behavior.lock() = behavior;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PriceProvider for ScriptedProvider {
        async fn fetch(&self, coin_ids: &[String]) -> Result<PriceBatch, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().push(coin_ids.to_vec());

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let behavior = self.behavior.lock().clone();
            match behavior {
                Behavior::Prices(prices) => Ok(coin_ids
                    .iter()
                    .map(|id| {
                        let price = prices.get(id).copied().ok_or_else(|| {
                            UpstreamError::MalformedResponse(format!("no usd price for {}", id))
                        });
                        (id.clone(), price)
                    })
                    .collect()),
                Behavior::Fail(e) => Err(e),
                Behavior::Panic => panic!("provider blew up"),
            }
        }
    }

    fn price_map(prices: &[(&str, f64)]) -> HashMap<String, f64> {
        prices.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn cache_with(
        provider: Arc<ScriptedProvider>,
        clock: Arc<ManualClock>,
        config: QuoteCacheConfig,
    ) -> QuoteCache {
        QuoteCache::new(provider, clock, config).unwrap()
    }

    fn setup(prices: &[(&str, f64)]) -> (QuoteCache, Arc<ScriptedProvider>, Arc<ManualClock>) {
        let provider = ScriptedProvider::new(prices);
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(provider.clone(), clock.clone(), QuoteCacheConfig::default());
        (cache, provider, clock)
    }

    #[tokio::test]
    async fn test_repeated_lookups_within_ttl_hit_cache() {
        let (cache, provider, clock) = setup(&[("bitcoin", 96721.0)]);

        let first = cache.get_quotes(["bitcoin"]).await;
        clock.advance(ChronoDuration::seconds(30));
        let second = cache.get_quotes(["bitcoin"]).await;

        assert_eq!(provider.calls(), 1);
        assert_eq!(first, second);

        let quote = first["bitcoin"].as_ref().unwrap();
        assert_eq!(quote.price, 96721.0);
        assert!(!quote.stale);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let (cache, provider, clock) = setup(&[("bitcoin", 96721.0)]);

        cache.get_quotes(["bitcoin"]).await;
        provider.set(Behavior::Prices(price_map(&[("bitcoin", 97000.0)])));

        clock.advance(ChronoDuration::seconds(60));
        let refreshed = cache.get_quotes(["bitcoin"]).await;

        assert_eq!(provider.calls(), 2);
        let quote = refreshed["bitcoin"].as_ref().unwrap();
        assert_eq!(quote.price, 97000.0);
        assert_eq!(quote.fetched_at, clock.now());
        assert!(!quote.stale);
    }

    #[tokio::test]
    async fn test_concurrent_cold_misses_share_one_fetch() {
        let provider = ScriptedProvider::with_delay(&[("bitcoin", 96721.0)], Duration::from_millis(50));
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(provider.clone(), clock, QuoteCacheConfig::default());

        let lookups = (0..16).map(|_| {
            let cache = cache.clone();
            async move { cache.get_quotes(["bitcoin"]).await }
        });
        let results = join_all(lookups).await;

        assert_eq!(provider.calls(), 1);
        let expected = results[0]["bitcoin"].clone().unwrap();
        for result in &results {
            assert_eq!(result["bitcoin"], Ok(expected.clone()));
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_across_tasks_share_one_fetch() {
        let provider = ScriptedProvider::with_delay(&[("ethereum", 3688.0)], Duration::from_millis(50));
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(provider.clone(), clock, QuoteCacheConfig::default());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_quotes(["ethereum"]).await })
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result["ethereum"].as_ref().unwrap().price, 3688.0);
        }
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_batches_fetch_shared_symbol_once() {
        let provider = ScriptedProvider::with_delay(
            &[("bitcoin", 1.0), ("ethereum", 2.0), ("solana", 3.0)],
            Duration::from_millis(50),
        );
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(provider.clone(), clock, QuoteCacheConfig::default());

        let (a, b) = tokio::join!(
            cache.get_quotes(["bitcoin", "ethereum"]),
            cache.get_quotes(["ethereum", "solana"])
        );

        assert_eq!(a["ethereum"], b["ethereum"]);
        assert_eq!(b["solana"].as_ref().unwrap().price, 3.0);

        let requested = provider.requested.lock().clone();
        let ethereum_fetches = requested
            .iter()
            .filter(|batch| batch.contains(&"ethereum".to_string()))
            .count();
        assert_eq!(ethereum_fetches, 1);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_fallback_on_rate_limit() {
        let (cache, provider, clock) = setup(&[("bitcoin", 96721.0)]);

        let fresh = cache.get_quotes(["bitcoin"]).await["bitcoin"].clone().unwrap();

        clock.advance(ChronoDuration::seconds(61));
        provider.set(Behavior::Fail(UpstreamError::RateLimited));

        let fallback = cache.get_quotes(["bitcoin"]).await["bitcoin"].clone().unwrap();
        assert!(fallback.stale);
        assert_eq!(fallback.price, fresh.price);
        assert_eq!(fallback.fetched_at, fresh.fetched_at);
        assert_eq!(provider.calls(), 2);

        // Provider recovers: the next lookup retries and clears the flag
        provider.set(Behavior::Prices(price_map(&[("bitcoin", 97000.0)])));
        let recovered = cache.get_quotes(["bitcoin"]).await["bitcoin"].clone().unwrap();
        assert!(!recovered.stale);
        assert_eq!(recovered.price, 97000.0);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_stale_fallback_on_unreachable_and_malformed() {
        let (cache, provider, clock) = setup(&[("bitcoin", 96721.0), ("ethereum", 3688.0)]);
        cache.get_quotes(["bitcoin", "ethereum"]).await;

        clock.advance(ChronoDuration::minutes(5));
        provider.set(Behavior::Fail(UpstreamError::Unreachable("connection reset".into())));
        let results = cache.get_quotes(["bitcoin"]).await;
        assert!(results["bitcoin"].as_ref().unwrap().stale);

        // Partial body: ethereum parses, bitcoin does not
        provider.set(Behavior::Prices(price_map(&[("ethereum", 3700.0)])));
        let results = cache.get_quotes(["bitcoin", "ethereum"]).await;
        assert!(results["bitcoin"].as_ref().unwrap().stale);
        assert_eq!(results["ethereum"].as_ref().unwrap().price, 3700.0);
        assert!(!results["ethereum"].as_ref().unwrap().stale);
    }

    #[tokio::test]
    async fn test_cold_failure_is_per_symbol() {
        let (cache, provider, _clock) = setup(&[("ethereum", 3688.0)]);

        let results = cache.get_quotes(["bitcoin", "ethereum"]).await;

        assert!(matches!(
            &results["bitcoin"],
            Err(QuoteError::Unavailable { symbol, cause: UpstreamError::MalformedResponse(_) })
                if symbol == "bitcoin"
        ));
        assert_eq!(results["ethereum"].as_ref().unwrap().price, 3688.0);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_cold_failure_clears_pending_for_retry() {
        let (cache, provider, _clock) = setup(&[]);
        provider.set(Behavior::Fail(UpstreamError::RateLimited));

        let results = cache.get_quotes(["bitcoin"]).await;
        assert_eq!(
            results["bitcoin"],
            Err(QuoteError::Unavailable {
                symbol: "bitcoin".into(),
                cause: UpstreamError::RateLimited
            })
        );
        assert_eq!(cache.cached_count(), 0);

        provider.set(Behavior::Prices(price_map(&[("bitcoin", 96721.0)])));
        let results = cache.get_quotes(["bitcoin"]).await;
        assert_eq!(results["bitcoin"].as_ref().unwrap().price, 96721.0);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_staleness_ceiling_refuses_old_fallback() {
        let provider = ScriptedProvider::new(&[("bitcoin", 96721.0)]);
        let clock = Arc::new(ManualClock::default());
        let config = QuoteCacheConfig {
            max_staleness: Some(Duration::from_secs(300)),
            ..QuoteCacheConfig::default()
        };
        let cache = cache_with(provider.clone(), clock.clone(), config);

        cache.get_quotes(["bitcoin"]).await;
        provider.set(Behavior::Fail(UpstreamError::RateLimited));

        clock.advance(ChronoDuration::seconds(120));
        assert!(cache.get_quotes(["bitcoin"]).await["bitcoin"].as_ref().unwrap().stale);

        clock.advance(ChronoDuration::seconds(200));
        assert!(matches!(
            cache.get_quotes(["bitcoin"]).await["bitcoin"],
            Err(QuoteError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_timeout_does_not_cancel_shared_fetch() {
        let provider = ScriptedProvider::with_delay(&[("bitcoin", 96721.0)], Duration::from_millis(200));
        let clock = Arc::new(ManualClock::default());
        let config = QuoteCacheConfig {
            wait_timeout: Duration::from_millis(20),
            ..QuoteCacheConfig::default()
        };
        let cache = cache_with(provider.clone(), clock, config);

        let results = cache.get_quotes(["bitcoin"]).await;
        assert_eq!(
            results["bitcoin"],
            Err(QuoteError::Timeout {
                symbol: "bitcoin".into()
            })
        );

        tokio::time::sleep(Duration::from_millis(400)).await;

        let results = cache.get_quotes(["bitcoin"]).await;
        assert_eq!(results["bitcoin"].as_ref().unwrap().price, 96721.0);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_panicking_fetch_releases_pending() {
        let (cache, provider, _clock) = setup(&[("bitcoin", 96721.0)]);
        provider.set(Behavior::Panic);

        let results = cache.get_quotes(["bitcoin"]).await;
        assert!(matches!(results["bitcoin"], Err(QuoteError::Unavailable { .. })));

        provider.set(Behavior::Prices(price_map(&[("bitcoin", 96721.0)])));
        let results = cache.get_quotes(["bitcoin"]).await;
        assert!(results["bitcoin"].is_ok());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_symbols_are_canonicalized() {
        let (cache, provider, _clock) = setup(&[("bitcoin", 96721.0)]);

        let results = cache.get_quotes([" Bitcoin ", "BITCOIN", "bitcoin", "  "]).await;

        assert_eq!(results.len(), 1);
        assert!(results.contains_key("bitcoin"));
        assert_eq!(provider.requested.lock()[0], vec!["bitcoin".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_request_skips_provider() {
        let (cache, provider, _clock) = setup(&[]);
        let results = cache.get_quotes(Vec::<String>::new()).await;
        assert!(results.is_empty());
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let provider = ScriptedProvider::new(&[]);
        let config = QuoteCacheConfig {
            ttl: Duration::ZERO,
            ..QuoteCacheConfig::default()
        };
        let result = QuoteCache::new(provider, Arc::new(ManualClock::default()), config);
        assert!(matches!(result, Err(QuoteCacheConfigError::ZeroTtl)));
    }
}
