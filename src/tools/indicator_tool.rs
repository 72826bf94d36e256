// =============================================================================
// indicator_calculator tool
// =============================================================================
//
// Returns a trimmed `IndicatorSnapshot` (series truncated to the tool's
// point budget) with the higher-timeframe snapshot nested underneath when
// enough long-timeframe candles are available.
// =============================================================================

use anyhow::Result;

use crate::domain::IndicatorSnapshot;
use crate::exchange::ExchangeClient;
use crate::indicators::build_snapshot;
use crate::market_cache::{CacheKind, MarketCache};
use crate::tools::live_market::fetch_candles;

/// Series points retained per §4.4 ("series truncated to ≤10 points").
pub const TOOL_SERIES_POINTS: usize = 10;
const VOLUME_RATIO_PERIOD: usize = 20;
/// Smaller than `VOLUME_RATIO_PERIOD`, per §4.1's "higher-timeframe snapshot
/// is the same function with a different timeframe and a smaller
/// `volume_ratio_period`".
const HIGHER_TIMEFRAME_VOLUME_RATIO_PERIOD: usize = 10;

pub async fn fetch_indicator_snapshot(
    cache: &MarketCache,
    exchange: &dyn ExchangeClient,
    symbol: &str,
    short_timeframe: &str,
    long_timeframe: &str,
) -> Result<serde_json::Value> {
    let short_candles = fetch_candles(
        cache,
        exchange,
        symbol,
        short_timeframe,
        CacheKind::OhlcvShort,
        crate::tools::live_market::MAX_INTRADAY_CANDLES,
    )
    .await?;

    let long_candles = fetch_candles(
        cache,
        exchange,
        symbol,
        long_timeframe,
        CacheKind::OhlcvLong,
        crate::tools::live_market::MAX_HIGH_TIMEFRAME_CANDLES,
    )
    .await?;

    let mut snapshot = build_snapshot(&short_candles, VOLUME_RATIO_PERIOD, TOOL_SERIES_POINTS);

    if let Some(snapshot) = snapshot.as_mut() {
        snapshot.higher_timeframe =
            build_snapshot(&long_candles, HIGHER_TIMEFRAME_VOLUME_RATIO_PERIOD, TOOL_SERIES_POINTS).map(Box::new);
    }

    Ok(serde_json::to_value(snapshot.unwrap_or_else(empty_snapshot))?)
}

/// Returned when there isn't enough history to compute indicators yet;
/// callers (and the LLM) see zeroed fields rather than a tool error.
fn empty_snapshot() -> IndicatorSnapshot {
    IndicatorSnapshot {
        price: 0.0,
        ema20: 0.0,
        macd: 0.0,
        macd_signal: 0.0,
        macd_histogram: 0.0,
        rsi7: 50.0,
        rsi14: 50.0,
        atr3: 0.0,
        atr14: 0.0,
        volume: 0.0,
        volume_ratio: 0.0,
        volatility: 0.0,
        ema20_series: Vec::new(),
        macd_series: Vec::new(),
        macd_histogram_series: Vec::new(),
        rsi7_series: Vec::new(),
        rsi14_series: Vec::new(),
        higher_timeframe: None,
    }
}
