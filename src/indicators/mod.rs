// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the core technical indicators used
// by the trading engine. Every low-level function operates on plain number
// slices and never performs I/O, touches the clock, or holds state between
// calls.

pub mod atr;
pub mod ema;
pub mod macd;
pub mod resample;
pub mod rsi;
pub mod volatility;

use crate::domain::{Candle, IndicatorSnapshot};

/// Number of trailing samples kept in each `*_series` field of a snapshot.
pub const DEFAULT_SERIES_POINTS: usize = 50;

fn trailing(xs: &[f64], n: usize) -> Vec<f64> {
    if xs.len() <= n {
        xs.to_vec()
    } else {
        xs[xs.len() - n..].to_vec()
    }
}

fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }
    let r = numerator / denominator;
    if r.is_finite() {
        r
    } else {
        0.0
    }
}

/// Build an `IndicatorSnapshot` from already-resampled OHLC `bars` (oldest
/// first). Returns `None` when there are fewer than
/// `max(volume_ratio_period, 20)` bars — insufficient history yields an
/// absent snapshot, never a zero-filled one.
pub fn build_snapshot(
    bars: &[Candle],
    volume_ratio_period: usize,
    series_points: usize,
) -> Option<IndicatorSnapshot> {
    let min_bars = volume_ratio_period.max(20);
    if bars.len() < min_bars {
        return None;
    }

    let closes: Vec<f64> = bars.iter().map(|c| c.close).collect();
    let highs: Vec<f64> = bars.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = bars.iter().map(|c| c.low).collect();
    let volumes: Vec<f64> = bars.iter().map(|c| c.volume).collect();

    let price = *closes.last()?;
    let (macd_line, macd_signal, macd_histogram) = macd::macd(&closes);

    let volume = *volumes.last()?;
    let avg_volume = resample::rolling_mean(&volumes, volume_ratio_period);
    let volume_ratio = safe_ratio(volume, avg_volume);

    let ema20_full = ema::calculate_ema(&closes, 20);
    let rsi7_full = rsi::calculate_rsi(&closes, 7);
    let rsi14_full = rsi::calculate_rsi(&closes, 14);
    let macd_series_full = macd::macd_series(&closes);
    let macd_line_series: Vec<f64> = macd_series_full.iter().map(|(m, _, _)| *m).collect();
    let macd_hist_series: Vec<f64> = macd_series_full.iter().map(|(_, _, h)| *h).collect();

    Some(IndicatorSnapshot {
        price,
        ema20: ema::ema(&closes, 20),
        macd: macd_line,
        macd_signal,
        macd_histogram,
        rsi7: rsi::rsi(&closes, 7),
        rsi14: rsi::rsi(&closes, 14),
        atr3: atr::atr(&highs, &lows, &closes, 3),
        atr14: atr::atr(&highs, &lows, &closes, 14),
        volume,
        volume_ratio,
        volatility: volatility::volatility(&closes, min_bars.min(20)),
        ema20_series: trailing(&ema20_full, series_points),
        macd_series: trailing(&macd_line_series, series_points),
        macd_histogram_series: trailing(&macd_hist_series, series_points),
        rsi7_series: trailing(&rsi7_full, series_points),
        rsi14_series: trailing(&rsi14_full, series_points),
        higher_timeframe: None,
    })
}
