// =============================================================================
// MarketDataScheduler — fast periodic market-data refresh (§4.3)
// =============================================================================
//
// The sole writer of `MarketCache`. Every tick, for each configured symbol:
// fetch ticker/orderbook/funding concurrently, fetch the short and long OHLCV
// windows, compute an indicator snapshot, and write everything through the
// cache with kind-specific TTLs. One symbol's failure never aborts the tick —
// it increments `api_failures` and is logged, so a flaky venue degrades one
// symbol at a time instead of stalling the whole cache.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::normalize_symbol;
use crate::exchange::{ExchangeClient, OrderBook};
use crate::indicators::build_snapshot;
use crate::market_cache::{cache_key, CacheKind, MarketCache, Tick};
use crate::tools::indicator_tool::TOOL_SERIES_POINTS;

const VOLUME_RATIO_PERIOD: usize = 20;
/// Smaller than `VOLUME_RATIO_PERIOD`: the higher-timeframe snapshot covers a
/// longer bar length, so its rolling volume average needs fewer samples to
/// stay representative (§4.1).
const HIGHER_TIMEFRAME_VOLUME_RATIO_PERIOD: usize = 10;
const ORDERBOOK_DEPTH: u32 = 40;
const OHLCV_LIMIT: u32 = 200;
/// Ticker timestamp older than this is "stale" for the decision cycle (§4.3).
pub const DEFAULT_STALE_THRESHOLD_SECONDS: i64 = 30;

/// Compact per-symbol snapshot fanned out to the WS feed.
#[derive(Debug, Clone, Serialize)]
pub struct MarketBroadcast {
    pub symbol: String,
    pub price: f64,
    pub change_pct_24h: f64,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
}

pub struct MarketDataScheduler {
    exchange: Arc<dyn ExchangeClient>,
    cache: Arc<MarketCache>,
    symbols: Vec<String>,
    short_timeframe: String,
    long_timeframe: String,
    tick_interval: Duration,
    api_failures: AtomicU64,
    broadcast: broadcast::Sender<MarketBroadcast>,
}

impl MarketDataScheduler {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        cache: Arc<MarketCache>,
        symbols: &[String],
        short_timeframe: impl Into<String>,
        long_timeframe: impl Into<String>,
        tick_interval: Duration,
    ) -> Self {
        let (broadcast, _) = broadcast::channel(256);
        Self {
            exchange,
            cache,
            symbols: symbols.iter().map(|s| normalize_symbol(s)).collect(),
            short_timeframe: short_timeframe.into(),
            long_timeframe: long_timeframe.into(),
            tick_interval,
            api_failures: AtomicU64::new(0),
            broadcast,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketBroadcast> {
        self.broadcast.subscribe()
    }

    pub fn api_failures(&self) -> u64 {
        self.api_failures.load(Ordering::Relaxed)
    }

    /// Drive the periodic loop until the process exits. Intended to be
    /// spawned as its own task.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// Refresh every configured symbol concurrently.
    pub async fn tick(&self) {
        let futures = self.symbols.iter().map(|symbol| self.refresh_symbol(symbol));
        futures_util::future::join_all(futures).await;
    }

    async fn refresh_symbol(&self, symbol: &str) {
        let (ticker, orderbook, funding) = tokio::join!(
            self.exchange.get_ticker(symbol),
            self.exchange.get_orderbook(symbol, ORDERBOOK_DEPTH),
            self.exchange.get_funding(symbol),
        );

        match ticker {
            Ok(ticker) => {
                self.cache.set_json(
                    &cache_key(symbol, CacheKind::Ticker, None),
                    serde_json::to_value(&ticker).unwrap_or_default(),
                    CacheKind::Ticker.default_ttl(),
                );
                self.cache.append(Tick { symbol: symbol.to_string(), price: ticker.price, timestamp: ticker.timestamp });
                let _ = self.broadcast.send(MarketBroadcast {
                    symbol: symbol.to_string(),
                    price: ticker.price,
                    change_pct_24h: ticker.change_pct_24h,
                    volume_24h: ticker.volume_24h,
                    high_24h: ticker.high_24h,
                    low_24h: ticker.low_24h,
                });
            }
            Err(e) => self.note_failure(symbol, "ticker", &e),
        }

        match orderbook {
            Ok(orderbook) => self.cache.set_json(
                &cache_key(symbol, CacheKind::OrderBook, None),
                serde_json::to_value(&orderbook).unwrap_or_default(),
                CacheKind::OrderBook.default_ttl(),
            ),
            Err(e) => self.note_failure(symbol, "orderbook", &e),
        }

        match funding {
            Ok(funding) => self.cache.set_json(
                &cache_key(symbol, CacheKind::Funding, None),
                serde_json::to_value(&funding).unwrap_or_default(),
                CacheKind::Funding.default_ttl(),
            ),
            Err(e) => self.note_failure(symbol, "funding", &e),
        }

        self.refresh_ohlcv_and_indicators(symbol).await;
    }

    async fn refresh_ohlcv_and_indicators(&self, symbol: &str) {
        let (short, long) = tokio::join!(
            self.exchange.get_ohlcv(symbol, &self.short_timeframe, OHLCV_LIMIT),
            self.exchange.get_ohlcv(symbol, &self.long_timeframe, OHLCV_LIMIT),
        );

        let short_candles = match short {
            Ok(candles) => {
                self.cache.set_json(
                    &cache_key(symbol, CacheKind::OhlcvShort, Some(&self.short_timeframe)),
                    serde_json::to_value(&candles).unwrap_or_default(),
                    CacheKind::OhlcvShort.default_ttl(),
                );
                Some(candles)
            }
            Err(e) => {
                self.note_failure(symbol, "ohlcv_short", &e);
                None
            }
        };

        let long_candles = match long {
            Ok(candles) => {
                self.cache.set_json(
                    &cache_key(symbol, CacheKind::OhlcvLong, Some(&self.long_timeframe)),
                    serde_json::to_value(&candles).unwrap_or_default(),
                    CacheKind::OhlcvLong.default_ttl(),
                );
                Some(candles)
            }
            Err(e) => {
                self.note_failure(symbol, "ohlcv_long", &e);
                None
            }
        };

        let Some(short_candles) = short_candles else { return };
        let mut snapshot = build_snapshot(&short_candles, VOLUME_RATIO_PERIOD, TOOL_SERIES_POINTS);
        if let (Some(snapshot), Some(long_candles)) = (snapshot.as_mut(), long_candles.as_ref()) {
            snapshot.higher_timeframe =
                build_snapshot(long_candles, HIGHER_TIMEFRAME_VOLUME_RATIO_PERIOD, TOOL_SERIES_POINTS).map(Box::new);
        }

        if let Some(snapshot) = snapshot {
            self.cache.set_json(
                &cache_key(symbol, CacheKind::Indicators, None),
                serde_json::to_value(&snapshot).unwrap_or_default(),
                CacheKind::Indicators.default_ttl(),
            );
        }
    }

    fn note_failure(&self, symbol: &str, what: &str, err: &anyhow::Error) {
        self.api_failures.fetch_add(1, Ordering::Relaxed);
        warn!(symbol, what, error = %err, "market data fetch failed; continuing tick");
    }

    /// Whether `symbol`'s cached ticker is too old to trust for a decision
    /// cycle, per §4.3's staleness rule.
    pub fn is_stale(&self, symbol: &str, stale_threshold_seconds: i64) -> bool {
        let Some(value) = self.cache.get_json(&cache_key(symbol, CacheKind::Ticker, None)) else { return true };
        let Some(timestamp) = value.get("timestamp").and_then(|v| v.as_str()) else { return true };
        let Ok(timestamp) = chrono::DateTime::parse_from_rfc3339(timestamp) else { return true };
        let age = Utc::now().signed_duration_since(timestamp.with_timezone(&Utc));
        age > chrono::Duration::seconds(stale_threshold_seconds)
    }
}

/// Depth-limited order book imbalance. Not currently consumed by the
/// decision pipeline but useful for the `/market/indicators` endpoint.
pub fn orderbook_imbalance(book: &OrderBook) -> f64 {
    let bid_vol: f64 = book.bids.iter().map(|l| l.quantity).sum();
    let ask_vol: f64 = book.asks.iter().map(|l| l.quantity).sum();
    let total = bid_vol + ask_vol;
    if total == 0.0 {
        0.0
    } else {
        (bid_vol - ask_vol) / total
    }
}
