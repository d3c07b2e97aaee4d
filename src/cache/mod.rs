// Indicator cache: cache-aside over a pluggable snapshot store
pub mod redis_store;
pub mod store;

pub use redis_store::RedisCacheStore;
pub use store::{CacheError, CacheStore, InMemoryCacheStore};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use crate::indicators::IndicatorEngine;
use crate::market_data::{MarketDataError, MarketDataProvider};
use crate::models::{Candle, IndicatorSnapshot, Timeframe};

pub const DEFAULT_CANDLE_WINDOW: usize = 100;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum IndicatorError {
    /// Not enough history yet; not an exit signal
    #[error("indeterminate: {available} candles available, {required} required")]
    Indeterminate { available: usize, required: usize },

    #[error(transparent)]
    MarketData(#[from] MarketDataError),
}

pub fn cache_key(symbol: &str, timeframe: Timeframe) -> String {
    format!("indicators:{}:{}", symbol, timeframe)
}

/// Cache-aside indicator snapshots keyed by (symbol, timeframe)
///
/// A cached snapshot is served only while its `source_close_time` is at
/// least the close time of the newest fetched candle. Misses are computed
/// under a per-key lock so concurrent callers for the same key compute once;
/// hits never take that lock.
pub struct IndicatorCache {
    store: Arc<dyn CacheStore>,
    market: Arc<dyn MarketDataProvider>,
    engine: IndicatorEngine,
    window: usize,
    fetch_timeout: Duration,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    computations: AtomicU64,
}

impl IndicatorCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        market: Arc<dyn MarketDataProvider>,
        engine: IndicatorEngine,
    ) -> Self {
        Self {
            store,
            market,
            engine,
            window: DEFAULT_CANDLE_WINDOW,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            key_locks: Mutex::new(HashMap::new()),
            computations: AtomicU64::new(0),
        }
    }

    /// Number of candles fetched per lookup
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn engine(&self) -> &IndicatorEngine {
        &self.engine
    }

    /// Total snapshots computed (cache misses) since construction
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    /// Return a fresh snapshot for (symbol, timeframe), computing it on a miss
    ///
    /// A failed candle fetch is returned as-is and leaves the store untouched;
    /// a cached value is never served without first confirming it is fresh.
    pub async fn get_or_compute(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<IndicatorSnapshot, IndicatorError> {
        let candles = self.fetch_candles(symbol, timeframe).await?;

        let required = self.engine.required_lookback();
        let latest = match candles.last() {
            Some(last) if candles.len() >= required => last.close_time,
            _ => {
                return Err(IndicatorError::Indeterminate {
                    available: candles.len(),
                    required,
                })
            }
        };

        let key = cache_key(symbol, timeframe);

        if let Some(snapshot) = self.lookup(&key).await {
            if snapshot.is_fresh_for(latest) {
                tracing::debug!(key = %key, "Indicator cache hit");
                return Ok(snapshot);
            }
        }

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        // Another caller may have filled the key while we waited
        let stale = match self.lookup(&key).await {
            Some(snapshot) if snapshot.is_fresh_for(latest) => {
                tracing::debug!(key = %key, "Indicator cache filled while waiting");
                return Ok(snapshot);
            }
            Some(_) => true,
            None => false,
        };

        if stale {
            if let Err(e) = self.store.delete(&key).await {
                tracing::warn!(key = %key, error = %e, "Failed to evict stale snapshot");
            }
        }

        let snapshot = self
            .engine
            .snapshot(&candles)
            .ok_or(IndicatorError::Indeterminate {
                available: candles.len(),
                required,
            })?;
        self.computations.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.store.set(&key, &snapshot).await {
            tracing::warn!(key = %key, error = %e, "Failed to store snapshot");
        }

        tracing::debug!(
            key = %key,
            source_close_time = %snapshot.source_close_time,
            stale,
            "Computed indicator snapshot"
        );

        Ok(snapshot)
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Vec<Candle>, MarketDataError> {
        timeout(
            self.fetch_timeout,
            self.market.fetch_candles(symbol, timeframe, self.window),
        )
        .await
        .map_err(|_| MarketDataError::Timeout(self.fetch_timeout))?
    }

    /// Store read where any error counts as a miss
    async fn lookup(&self, key: &str) -> Option<IndicatorSnapshot> {
        match self.store.get(key).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Unreadable cache entry, recomputing");
                None
            }
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct MockMarket {
        candles: Mutex<Vec<Candle>>,
        fail: AtomicBool,
        delay: Option<Duration>,
        fetches: AtomicUsize,
    }

    impl MockMarket {
        fn new(count: usize) -> Self {
            Self {
                candles: Mutex::new(create_candles(count)),
                fail: AtomicBool::new(false),
                delay: None,
                fetches: AtomicUsize::new(0),
            }
        }

        fn push_candle(&self) {
            let mut candles = self.candles.lock().unwrap();
            let n = candles.len();
            let next = create_candles(n + 1).pop().unwrap();
            candles.push(next);
        }
    }

    #[async_trait]
    impl MarketDataProvider for MockMarket {
        async fn fetch_candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Candle>, MarketDataError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(MarketDataError::ExchangeUnavailable("down".into()));
            }
            let candles = self.candles.lock().unwrap();
            let skip = candles.len().saturating_sub(limit);
            Ok(candles[skip..].to_vec())
        }

        async fn current_price(&self, _symbol: &str) -> Result<f64, MarketDataError> {
            Ok(100.0)
        }
    }

    /// Store whose reads always fail as corrupt
    struct CorruptStore;

    #[async_trait]
    impl CacheStore for CorruptStore {
        async fn get(&self, key: &str) -> Result<Option<IndicatorSnapshot>, CacheError> {
            Err(CacheError::Corrupt {
                key: key.to_string(),
                reason: "truncated".into(),
            })
        }

        async fn set(&self, _key: &str, _value: &IndicatorSnapshot) -> Result<(), CacheError> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Ok(())
        }
    }

    fn create_candles(count: usize) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.5).sin() * 3.0 + i as f64 * 0.05;
                Candle {
                    open_time: start + ChronoDuration::minutes(5 * i as i64),
                    close_time: start + ChronoDuration::minutes(5 * (i as i64 + 1)),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1000.0,
                }
            })
            .collect()
    }

    fn build(market: Arc<MockMarket>, store: Arc<dyn CacheStore>) -> IndicatorCache {
        IndicatorCache::new(store, market, IndicatorEngine::default())
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let market = Arc::new(MockMarket::new(100));
        let cache = build(market.clone(), Arc::new(InMemoryCacheStore::new()));

        let first = cache.get_or_compute("BTCUSDT", Timeframe::M5).await.unwrap();
        let second = cache.get_or_compute("BTCUSDT", Timeframe::M5).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.computations(), 1);
        assert_eq!(market.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_new_candle_invalidates_snapshot() {
        let market = Arc::new(MockMarket::new(100));
        let cache = build(market.clone(), Arc::new(InMemoryCacheStore::new()));

        let first = cache.get_or_compute("BTCUSDT", Timeframe::M5).await.unwrap();
        market.push_candle();
        let second = cache.get_or_compute("BTCUSDT", Timeframe::M5).await.unwrap();

        assert_eq!(cache.computations(), 2);
        assert!(second.source_close_time > first.source_close_time);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let market = Arc::new(MockMarket::new(100));
        let store = Arc::new(InMemoryCacheStore::new());
        let cache = build(market, store.clone());

        cache.get_or_compute("BTCUSDT", Timeframe::M5).await.unwrap();
        cache.get_or_compute("ETHUSDT", Timeframe::M5).await.unwrap();
        cache.get_or_compute("BTCUSDT", Timeframe::H1).await.unwrap();

        assert_eq!(cache.computations(), 3);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_insufficient_candles_is_indeterminate() {
        let market = Arc::new(MockMarket::new(20));
        let store = Arc::new(InMemoryCacheStore::new());
        let cache = build(market, store.clone());

        let err = cache.get_or_compute("BTCUSDT", Timeframe::M5).await.unwrap_err();
        assert!(matches!(
            err,
            IndicatorError::Indeterminate { available: 20, required: 34 }
        ));
        assert!(store.is_empty().await);
        assert_eq!(cache.computations(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates_and_keeps_store() {
        let market = Arc::new(MockMarket::new(100));
        let store = Arc::new(InMemoryCacheStore::new());
        let cache = build(market.clone(), store.clone());

        let cached = cache.get_or_compute("BTCUSDT", Timeframe::M5).await.unwrap();

        market.fail.store(true, Ordering::SeqCst);
        let err = cache.get_or_compute("BTCUSDT", Timeframe::M5).await.unwrap_err();
        assert!(matches!(err, IndicatorError::MarketData(_)));

        let key = cache_key("BTCUSDT", Timeframe::M5);
        assert_eq!(store.get(&key).await.unwrap(), Some(cached));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let market = Arc::new(MockMarket {
            delay: Some(Duration::from_millis(500)),
            ..MockMarket::new(100)
        });
        let cache = build(market, Arc::new(InMemoryCacheStore::new()))
            .with_fetch_timeout(Duration::from_millis(20));

        let err = cache.get_or_compute("BTCUSDT", Timeframe::M5).await.unwrap_err();
        assert!(matches!(
            err,
            IndicatorError::MarketData(MarketDataError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let market = Arc::new(MockMarket::new(100));
        let cache = build(market, Arc::new(CorruptStore));

        let snapshot = cache.get_or_compute("BTCUSDT", Timeframe::M5).await;
        assert!(snapshot.is_ok());
        assert_eq!(cache.computations(), 1);
    }

    #[tokio::test]
    async fn test_window_limits_fetch() {
        let market = Arc::new(MockMarket::new(200));
        let cache = build(market, Arc::new(InMemoryCacheStore::new())).with_window(40);

        let snapshot = cache.get_or_compute("BTCUSDT", Timeframe::M5).await.unwrap();
        assert_eq!(
            snapshot.source_close_time,
            create_candles(200).last().unwrap().close_time
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_compute_once() {
        let market = Arc::new(MockMarket {
            delay: Some(Duration::from_millis(10)),
            ..MockMarket::new(100)
        });
        let cache = Arc::new(build(market, Arc::new(InMemoryCacheStore::new())));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_or_compute("BTCUSDT", Timeframe::M5).await })
            })
            .collect();

        let mut snapshots = Vec::new();
        for handle in handles {
            snapshots.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(cache.computations(), 1);
        assert!(snapshots.windows(2).all(|w| w[0] == w[1]));
    }
}
