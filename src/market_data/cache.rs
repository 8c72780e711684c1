// =============================================================================
// Market Data Cache — TTL-wrapped, read-through brokerage reads
// =============================================================================
//
// Wraps a `Broker` with a small per-key TTL cache so the strategy loop, the
// dashboard API, and anything else polling market state doesn't hammer the
// venue on every tick. Read-through: a miss (key absent, or present but
// expired) calls the broker directly. On a broker error, a present — even
// expired — entry is returned with `fallback` set rather than failing the
// caller outright; callers decide whether a fallback read is good enough.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::binance::broker::{Broker, BrokerError, MarketClock};
use crate::market_data::Candle;

/// Default TTL for the venue clock: the clock barely moves meaning between
/// ticks, so a full minute of staleness is acceptable.
pub const CLOCK_TTL: Duration = Duration::from_secs(60);
/// Default TTL for historical bar fetches.
pub const HISTORY_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
enum CacheKind {
    Clock,
    LatestBar,
    History(u32),
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct CacheKey {
    symbol: String,
    kind: CacheKind,
    timeframe: String,
}

#[derive(Clone)]
enum CachedValue {
    Clock(MarketClock),
    LatestBar(Candle),
    History(Vec<Candle>),
}

struct Entry {
    value: CachedValue,
    cached_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_fresh(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// A value read from the cache, tagged with whether it came from a live
/// broker call (`fallback == false`) or a stale entry served because the
/// live call failed (`fallback == true`).
pub struct CachedRead<T> {
    pub value: T,
    pub fallback: bool,
}

/// Read-through TTL cache in front of a [`Broker`].
pub struct MarketDataCache {
    broker: std::sync::Arc<dyn Broker>,
    latest_bar_ttl: Duration,
    entries: RwLock<HashMap<CacheKey, Entry>>,
}

impl MarketDataCache {
    /// `latest_bar_ttl` should match the strategy loop's tick interval — a
    /// fresh bar is only ever as new as the next tick anyway.
    pub fn new(broker: std::sync::Arc<dyn Broker>, latest_bar_ttl: Duration) -> Self {
        Self {
            broker,
            latest_bar_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn fresh_entry(&self, key: &CacheKey) -> Option<CachedValue> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|e| e.is_fresh())
            .map(|e| e.value.clone())
    }

    fn any_entry(&self, key: &CacheKey) -> Option<CachedValue> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    fn store(&self, key: CacheKey, value: CachedValue, ttl: Duration) {
        self.entries.write().insert(
            key,
            Entry {
                value,
                cached_at: Instant::now(),
                ttl,
            },
        );
    }

    /// The venue's trading clock, TTL 60 s.
    pub async fn clock(&self) -> Result<CachedRead<MarketClock>, BrokerError> {
        let key = CacheKey {
            symbol: String::new(),
            kind: CacheKind::Clock,
            timeframe: String::new(),
        };

        if let Some(CachedValue::Clock(clock)) = self.fresh_entry(&key) {
            return Ok(CachedRead { value: clock, fallback: false });
        }

        match self.broker.clock().await {
            Ok(clock) => {
                self.store(key, CachedValue::Clock(clock.clone()), CLOCK_TTL);
                Ok(CachedRead { value: clock, fallback: false })
            }
            Err(e) => match self.any_entry(&key) {
                Some(CachedValue::Clock(clock)) => Ok(CachedRead { value: clock, fallback: true }),
                _ => Err(e),
            },
        }
    }

    /// The most recent bar for `symbol`, TTL equal to the configured tick
    /// interval.
    pub async fn latest_bar(&self, symbol: &str) -> Result<CachedRead<Candle>, BrokerError> {
        let key = CacheKey {
            symbol: symbol.to_string(),
            kind: CacheKind::LatestBar,
            timeframe: String::new(),
        };

        if let Some(CachedValue::LatestBar(bar)) = self.fresh_entry(&key) {
            return Ok(CachedRead { value: bar, fallback: false });
        }

        match self.broker.latest_bar(symbol).await {
            Ok(bar) => {
                self.store(key, CachedValue::LatestBar(bar.clone()), self.latest_bar_ttl);
                Ok(CachedRead { value: bar, fallback: false })
            }
            Err(e) => match self.any_entry(&key) {
                Some(CachedValue::LatestBar(bar)) => Ok(CachedRead { value: bar, fallback: true }),
                _ => Err(e),
            },
        }
    }

    /// The last `n` bars for `symbol` at `timeframe`, TTL 60 s.
    pub async fn history_bars(
        &self,
        symbol: &str,
        n: u32,
        timeframe: &str,
    ) -> Result<CachedRead<Vec<Candle>>, BrokerError> {
        let key = CacheKey {
            symbol: symbol.to_string(),
            kind: CacheKind::History(n),
            timeframe: timeframe.to_string(),
        };

        if let Some(CachedValue::History(bars)) = self.fresh_entry(&key) {
            return Ok(CachedRead { value: bars, fallback: false });
        }

        match self.broker.history_bars(symbol, n, timeframe).await {
            Ok(bars) => {
                self.store(key, CachedValue::History(bars.clone()), HISTORY_TTL);
                Ok(CachedRead { value: bars, fallback: false })
            }
            Err(e) => match self.any_entry(&key) {
                Some(CachedValue::History(bars)) => Ok(CachedRead { value: bars, fallback: true }),
                _ => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::broker::{BrokerErrorKind, BracketOrderResult, OrderResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn sample_candle(close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
            quote_volume: 1.0,
            trades_count: 1,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }

    /// A fake broker that counts calls and can be switched to fail on demand.
    struct FakeBroker {
        calls: AtomicU32,
        fail: std::sync::atomic::AtomicBool,
    }

    impl FakeBroker {
        fn new() -> Self {
            Self { calls: AtomicU32::new(0), fail: std::sync::atomic::AtomicBool::new(false) }
        }
    }

    #[async_trait]
    impl Broker for FakeBroker {
        async fn latest_bar(&self, _symbol: &str) -> Result<Candle, BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(BrokerError::new(BrokerErrorKind::TransientNetwork, "down"));
            }
            Ok(sample_candle(100.0))
        }
        async fn history_bars(&self, _s: &str, _n: u32, _tf: &str) -> Result<Vec<Candle>, BrokerError> {
            Ok(vec![sample_candle(100.0)])
        }
        async fn clock(&self) -> Result<MarketClock, BrokerError> {
            Ok(MarketClock { timestamp_ms: 0, is_open: true })
        }
        async fn account(&self) -> Result<serde_json::Value, BrokerError> {
            Ok(serde_json::json!({}))
        }
        async fn positions(&self) -> Result<Vec<serde_json::Value>, BrokerError> {
            Ok(vec![])
        }
        async fn open_orders(&self, _symbol: Option<&str>) -> Result<Vec<serde_json::Value>, BrokerError> {
            Ok(vec![])
        }
        async fn place_market(&self, _s: &str, _q: f64, _side: &str) -> Result<OrderResult, BrokerError> {
            unimplemented!()
        }
        async fn place_limit(&self, _s: &str, _q: f64, _side: &str, _l: f64, _tif: &str) -> Result<OrderResult, BrokerError> {
            unimplemented!()
        }
        async fn place_bracket(
            &self,
            _s: &str,
            _q: f64,
            _side: &str,
            _tp: f64,
            _sl: f64,
            _sl_limit: Option<f64>,
            _entry_limit: Option<f64>,
        ) -> Result<BracketOrderResult, BrokerError> {
            unimplemented!()
        }
        async fn cancel_order(&self, _s: &str, _id: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn cancel_all(&self, _s: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn close_all(&self, _s: &str, _cancel_pending: bool) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let broker = Arc::new(FakeBroker::new());
        let cache = MarketDataCache::new(broker.clone(), Duration::from_secs(30));

        cache.latest_bar("BTCUSDT").await.unwrap();
        cache.latest_bar("BTCUSDT").await.unwrap();

        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn serves_stale_fallback_on_broker_error() {
        let broker = Arc::new(FakeBroker::new());
        let cache = MarketDataCache::new(broker.clone(), Duration::from_millis(1));

        let first = cache.latest_bar("BTCUSDT").await.unwrap();
        assert!(!first.fallback);

        tokio::time::sleep(Duration::from_millis(5)).await;
        broker.fail.store(true, Ordering::SeqCst);

        let second = cache.latest_bar("BTCUSDT").await.unwrap();
        assert!(second.fallback);
        assert_eq!(second.value.close, 100.0);
    }

    #[tokio::test]
    async fn propagates_error_with_no_prior_entry() {
        let broker = Arc::new(FakeBroker::new());
        broker.fail.store(true, Ordering::SeqCst);
        let cache = MarketDataCache::new(broker, Duration::from_secs(30));

        let result = cache.latest_bar("BTCUSDT").await;
        assert!(result.is_err());
    }
}
