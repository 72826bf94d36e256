// =============================================================================
// live_market_data tool
// =============================================================================
//
// Returns the last price plus two candle windows. Consults `MarketCache`
// first; on a miss or expiry it falls through to the `ExchangeClient`
// directly. A fallback fetch is never written back to `MarketCache` — the
// cache has exactly one writer, `MarketDataScheduler` (see `market_cache.rs`).
// =============================================================================

use anyhow::Result;
use serde_json::json;

use crate::domain::Candle;
use crate::exchange::ExchangeClient;
use crate::market_cache::{cache_key, CacheKind, MarketCache};

/// `intraday_candles` cap, per §4.4 ("at most the last ~50").
pub const MAX_INTRADAY_CANDLES: usize = 50;
/// `high_timeframe_candles` cap, per §4.4 ("≈120").
pub const MAX_HIGH_TIMEFRAME_CANDLES: usize = 120;

fn trim_last(mut candles: Vec<Candle>, limit: usize) -> Vec<Candle> {
    if candles.len() > limit {
        candles = candles.split_off(candles.len() - limit);
    }
    candles
}

/// Shared by `live_market` and `indicator_tool`: read a candle window from
/// the cache, falling back to a live exchange fetch on a miss.
pub(crate) async fn fetch_candles(
    cache: &MarketCache,
    exchange: &dyn ExchangeClient,
    symbol: &str,
    timeframe: &str,
    kind: CacheKind,
    limit: usize,
) -> Result<Vec<Candle>> {
    let key = cache_key(symbol, kind, Some(timeframe));
    if let Some(value) = cache.get_json(&key) {
        if let Ok(candles) = serde_json::from_value::<Vec<Candle>>(value) {
            return Ok(trim_last(candles, limit));
        }
    }
    let candles = exchange.get_ohlcv(symbol, timeframe, limit as u32).await?;
    Ok(trim_last(candles, limit))
}

async fn fetch_last_price(cache: &MarketCache, exchange: &dyn ExchangeClient, symbol: &str) -> Result<f64> {
    let key = cache_key(symbol, CacheKind::Ticker, None);
    if let Some(value) = cache.get_json(&key) {
        if let Some(price) = value.get("price").and_then(|v| v.as_f64()) {
            return Ok(price);
        }
    }
    Ok(exchange.get_ticker(symbol).await?.price)
}

pub async fn fetch_live_market_data(
    cache: &MarketCache,
    exchange: &dyn ExchangeClient,
    symbol: &str,
    short_timeframe: &str,
    long_timeframe: &str,
) -> Result<serde_json::Value> {
    let last_price = fetch_last_price(cache, exchange, symbol).await?;

    let intraday = fetch_candles(
        cache,
        exchange,
        symbol,
        short_timeframe,
        CacheKind::OhlcvShort,
        MAX_INTRADAY_CANDLES,
    )
    .await?;

    let high_timeframe = fetch_candles(
        cache,
        exchange,
        symbol,
        long_timeframe,
        CacheKind::OhlcvLong,
        MAX_HIGH_TIMEFRAME_CANDLES,
    )
    .await?;

    Ok(json!({
        "last_price": last_price,
        "short_term_timeframe": short_timeframe,
        "long_term_timeframe": long_timeframe,
        "intraday_candles": intraday,
        "high_timeframe_candles": high_timeframe,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn candle(close: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn trim_last_keeps_newest_n() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i as f64)).collect();
        let trimmed = trim_last(candles, 3);
        assert_eq!(trimmed.len(), 3);
        assert_eq!(trimmed[0].close, 7.0);
        assert_eq!(trimmed[2].close, 9.0);
    }

    #[test]
    fn trim_last_is_noop_under_limit() {
        let candles: Vec<Candle> = (0..3).map(|i| candle(i as f64)).collect();
        let trimmed = trim_last(candles.clone(), 10);
        assert_eq!(trimmed.len(), 3);
    }

    #[tokio::test]
    async fn fetch_candles_prefers_cache_over_exchange() {
        use crate::exchange::okx::OkxClient;

        let cache = MarketCache::new(500, Duration::from_secs(3600));
        let cached_candles = vec![candle(111.0)];
        cache.set_json(
            &cache_key("BTC-USDT-SWAP", CacheKind::OhlcvShort, Some("15m")),
            serde_json::to_value(&cached_candles).unwrap(),
            Duration::from_secs(60),
        );

        // A client with no network access is fine here: the cache hit means
        // the exchange is never actually called.
        let exchange = OkxClient::new("k".into(), "s".into(), "p".into(), "https://unused.invalid".into(), true);

        let result = fetch_candles(&cache, &exchange, "BTC-USDT-SWAP", "15m", CacheKind::OhlcvShort, 50)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].close, 111.0);
    }
}
