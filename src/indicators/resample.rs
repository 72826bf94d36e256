// =============================================================================
// OHLC resampling
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};

use crate::domain::Candle;

/// Group `bars` into `timeframe_seconds`-wide buckets keyed by
/// `floor(timestamp / timeframe)`, producing one resampled candle per
/// non-empty bucket in ascending time order.
///
/// `bars` need not be pre-sorted; this function sorts a local copy of the
/// bucket keys before emitting output. Buckets are built from at least one
/// bar each, so none are ever dropped for "having no close" — the
/// construction makes that case unreachable; the guard is kept only to
/// document the invariant the source carried.
pub fn resample_ohlc(bars: &[Candle], timeframe_seconds: i64) -> Vec<Candle> {
    if bars.is_empty() || timeframe_seconds <= 0 {
        return Vec::new();
    }

    let mut buckets: std::collections::BTreeMap<i64, Vec<&Candle>> =
        std::collections::BTreeMap::new();

    for bar in bars {
        let key = bar.timestamp.timestamp().div_euclid(timeframe_seconds);
        buckets.entry(key).or_default().push(bar);
    }

    buckets
        .into_iter()
        .filter_map(|(key, mut group)| {
            if group.is_empty() {
                return None;
            }
            group.sort_by_key(|c| c.timestamp);
            let open = group.first()?.open;
            let close = group.last()?.close;
            let high = group.iter().fold(f64::MIN, |acc, c| acc.max(c.high));
            let low = group.iter().fold(f64::MAX, |acc, c| acc.min(c.low));
            let volume = group.iter().map(|c| c.volume).sum();
            let timestamp = bucket_start(key, timeframe_seconds);
            Some(Candle {
                timestamp,
                open,
                high,
                low,
                close,
                volume,
            })
        })
        .collect()
}

fn bucket_start(bucket_key: i64, timeframe_seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(bucket_key * timeframe_seconds, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Rolling arithmetic mean of the trailing `period` values, or `0.0` when
/// there is not enough history — used to normalize volume into a ratio.
pub fn rolling_mean(xs: &[f64], period: usize) -> f64 {
    if period == 0 || xs.len() < period {
        return 0.0;
    }
    let window = &xs[xs.len() - period..];
    window.iter().sum::<f64>() / period as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle_at(secs: i64, close: f64) -> Candle {
        Candle {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn resample_empty_input_is_empty() {
        assert!(resample_ohlc(&[], 60).is_empty());
    }

    #[test]
    fn resample_groups_by_timeframe_bucket() {
        // Two bars in bucket 0 (secs 0, 30) and one in bucket 1 (secs 60).
        let bars = vec![candle_at(0, 100.0), candle_at(30, 110.0), candle_at(60, 120.0)];
        let resampled = resample_ohlc(&bars, 60);
        assert_eq!(resampled.len(), 2);
        assert_eq!(resampled[0].open, 100.0);
        assert_eq!(resampled[0].close, 110.0);
        assert_eq!(resampled[0].volume, 2.0);
        assert_eq!(resampled[1].open, 120.0);
    }

    #[test]
    fn resample_aggregates_high_low_volume() {
        let bars = vec![
            Candle {
                timestamp: Utc.timestamp_opt(0, 0).unwrap(),
                open: 100.0,
                high: 105.0,
                low: 95.0,
                close: 101.0,
                volume: 10.0,
            },
            Candle {
                timestamp: Utc.timestamp_opt(1, 0).unwrap(),
                open: 101.0,
                high: 108.0,
                low: 90.0,
                close: 103.0,
                volume: 5.0,
            },
        ];
        let resampled = resample_ohlc(&bars, 60);
        assert_eq!(resampled.len(), 1);
        assert_eq!(resampled[0].high, 108.0);
        assert_eq!(resampled[0].low, 90.0);
        assert_eq!(resampled[0].volume, 15.0);
    }

    #[test]
    fn resample_output_is_time_ordered() {
        let bars = vec![candle_at(120, 1.0), candle_at(0, 2.0), candle_at(60, 3.0)];
        let resampled = resample_ohlc(&bars, 60);
        assert_eq!(resampled.len(), 3);
        assert!(resampled.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn rolling_mean_zero_when_insufficient() {
        assert_eq!(rolling_mean(&[1.0, 2.0], 5), 0.0);
    }

    #[test]
    fn rolling_mean_uses_trailing_window() {
        let xs = vec![100.0, 1.0, 2.0, 3.0];
        assert!((rolling_mean(&xs, 3) - 2.0).abs() < 1e-9);
    }
}
