// =============================================================================
// MarketCache — keyed TTL store + append-only tick stream
// =============================================================================
//
// A Redis-like key/value + stream abstraction kept entirely in-process.
// `MarketDataScheduler` is the sole writer; `ToolRegistry` and the HTTP
// `/market/indicators/{symbol}` handler are readers. Per §5's shared-resource
// policy there is no cross-key critical section — each key/stream is
// independently locked.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One entry in the append-only per-symbol tick stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

struct CacheEntry {
    value: serde_json::Value,
    stored_at: DateTime<Utc>,
    ttl: Duration,
}

impl CacheEntry {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.stored_at);
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => age > ttl,
            Err(_) => false,
        }
    }
}

/// Market-data cache kinds, used to build well-known key strings and to
/// select the default TTL for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Ticker,
    OrderBook,
    Funding,
    OhlcvShort,
    OhlcvLong,
    Indicators,
}

impl CacheKind {
    pub fn default_ttl(self) -> Duration {
        match self {
            Self::Ticker => Duration::from_secs(10),
            Self::OrderBook => Duration::from_secs(10),
            Self::Funding => Duration::from_secs(300),
            Self::OhlcvShort => Duration::from_secs(60),
            Self::OhlcvLong => Duration::from_secs(300),
            Self::Indicators => Duration::from_secs(60),
        }
    }
}

/// Build the canonical cache key for `symbol`/`kind`, e.g.
/// `market:BTCUSDT:ticker` or `market:BTCUSDT:ohlcv:15m`.
pub fn cache_key(symbol: &str, kind: CacheKind, timeframe: Option<&str>) -> String {
    match kind {
        CacheKind::Ticker => format!("market:{symbol}:ticker"),
        CacheKind::OrderBook => format!("market:{symbol}:orderbook"),
        CacheKind::Funding => format!("market:{symbol}:funding"),
        CacheKind::OhlcvShort | CacheKind::OhlcvLong => {
            format!("market:{symbol}:ohlcv:{}", timeframe.unwrap_or("unknown"))
        }
        CacheKind::Indicators => format!("market:{symbol}:indicators"),
    }
}

/// Default max tick-stream depth per symbol before backpressure kicks in.
pub const DEFAULT_MAX_ENTRIES_PER_SYMBOL: usize = 500;

/// Multiplier applied to `max_entries_per_symbol` beyond which an incoming
/// tick is dropped rather than enqueued.
const BACKPRESSURE_FACTOR: f64 = 1.2;

pub struct MarketCache {
    store: RwLock<HashMap<String, CacheEntry>>,
    streams: RwLock<HashMap<String, VecDeque<Tick>>>,
    max_entries_per_symbol: usize,
    retention: Duration,
}

impl MarketCache {
    pub fn new(max_entries_per_symbol: usize, retention: Duration) -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            max_entries_per_symbol,
            retention,
        }
    }

    /// Fetch a cached value, treating a missing OR stale entry as absent.
    pub fn get_json(&self, key: &str) -> Option<serde_json::Value> {
        let now = Utc::now();
        let store = self.store.read();
        let entry = store.get(key)?;
        if entry.is_stale(now) {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn set_json(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let mut store = self.store.write();
        store.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Utc::now(),
                ttl,
            },
        );
    }

    /// Fetch a value stored via `hash_set`, deserialized as a flat string map.
    pub fn hash_get(&self, key: &str) -> Option<HashMap<String, serde_json::Value>> {
        let value = self.get_json(key)?;
        serde_json::from_value(value).ok()
    }

    pub fn hash_set(&self, key: &str, mapping: HashMap<String, serde_json::Value>, ttl: Duration) {
        let value = serde_json::to_value(mapping).unwrap_or(serde_json::Value::Null);
        self.set_json(key, value, ttl);
    }

    /// Append a tick to `symbol`'s stream. Producers must not block: if the
    /// stream already exceeds `1.2 * max_entries_per_symbol`, the tick is
    /// dropped and a warning logged rather than applying backpressure to
    /// the caller.
    pub fn append(&self, tick: Tick) {
        let symbol = tick.symbol.clone();
        let mut streams = self.streams.write();
        let stream = streams.entry(symbol.clone()).or_default();

        let overflow_threshold = (self.max_entries_per_symbol as f64 * BACKPRESSURE_FACTOR) as usize;
        if stream.len() > overflow_threshold {
            warn!(symbol = %symbol, depth = stream.len(), "tick stream backpressure: dropping tick");
            return;
        }

        stream.push_back(tick);

        // Trim by hard cap and by retention window.
        while stream.len() > self.max_entries_per_symbol {
            stream.pop_front();
        }
        let cutoff = Utc::now() - chrono::Duration::from_std(self.retention).unwrap_or_default();
        while stream
            .front()
            .map(|t| t.timestamp < cutoff)
            .unwrap_or(false)
        {
            stream.pop_front();
        }
    }

    /// Read the most recent `count` ticks for `symbol`, oldest first.
    pub fn read_latest(&self, symbol: &str, count: usize) -> Vec<Tick> {
        let streams = self.streams.read();
        match streams.get(symbol) {
            Some(stream) => {
                let len = stream.len();
                let start = len.saturating_sub(count);
                stream.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn stream_depth(&self, symbol: &str) -> usize {
        self.streams.read().get(symbol).map(VecDeque::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, price: f64, ts: DateTime<Utc>) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            timestamp: ts,
        }
    }

    #[test]
    fn get_json_missing_key_is_absent() {
        let cache = MarketCache::new(10, Duration::from_secs(3600));
        assert!(cache.get_json("nope").is_none());
    }

    #[test]
    fn set_then_get_json_roundtrips() {
        let cache = MarketCache::new(10, Duration::from_secs(3600));
        cache.set_json("k", serde_json::json!({"a": 1}), Duration::from_secs(60));
        let v = cache.get_json("k").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn stale_entry_is_treated_as_absent() {
        let cache = MarketCache::new(10, Duration::from_secs(3600));
        cache.set_json("k", serde_json::json!(1), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_json("k").is_none());
    }

    #[test]
    fn hash_set_then_hash_get_roundtrips() {
        let cache = MarketCache::new(10, Duration::from_secs(3600));
        let mut map = HashMap::new();
        map.insert("rsi14".to_string(), serde_json::json!(55.2));
        cache.hash_set("h", map.clone(), Duration::from_secs(60));
        let got = cache.hash_get("h").unwrap();
        assert_eq!(got["rsi14"], 55.2);
    }

    #[test]
    fn append_and_read_latest_preserves_order() {
        let cache = MarketCache::new(100, Duration::from_secs(3600));
        let base = Utc::now();
        for i in 0..5 {
            cache.append(tick("BTCUSDT", 100.0 + i as f64, base + chrono::Duration::seconds(i)));
        }
        let latest = cache.read_latest("BTCUSDT", 3);
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].price, 102.0);
        assert_eq!(latest[2].price, 104.0);
    }

    #[test]
    fn read_latest_on_unknown_symbol_is_empty() {
        let cache = MarketCache::new(10, Duration::from_secs(3600));
        assert!(cache.read_latest("NOPE", 5).is_empty());
    }

    #[test]
    fn backpressure_drops_ticks_past_1_2x_max_entries() {
        let cache = MarketCache::new(10, Duration::from_secs(3600));
        let base = Utc::now();
        // Push far more than the overflow threshold (12).
        for i in 0..50 {
            cache.append(tick("ETHUSDT", i as f64, base + chrono::Duration::seconds(i)));
        }
        assert!(cache.stream_depth("ETHUSDT") <= 10);
    }

    #[test]
    fn hard_cap_trims_to_max_entries_per_symbol() {
        let cache = MarketCache::new(5, Duration::from_secs(3600));
        let base = Utc::now();
        for i in 0..6 {
            cache.append(tick("BTCUSDT", i as f64, base + chrono::Duration::seconds(i)));
        }
        assert_eq!(cache.stream_depth("BTCUSDT"), 5);
    }

    #[test]
    fn cache_key_formats_by_kind() {
        assert_eq!(cache_key("BTCUSDT", CacheKind::Ticker, None), "market:BTCUSDT:ticker");
        assert_eq!(
            cache_key("BTCUSDT", CacheKind::OhlcvShort, Some("15m")),
            "market:BTCUSDT:ohlcv:15m"
        );
        assert_eq!(cache_key("BTCUSDT", CacheKind::Indicators, None), "market:BTCUSDT:indicators");
    }
}
