// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// macd_line  = EMA(closes, 12) - EMA(closes, 26)
// signal     = EMA(macd_line series, 9)
// histogram  = macd_line - signal
//
// Built entirely out of `ema::calculate_ema`; no independent smoothing logic.
// =============================================================================

use super::ema::calculate_ema;

/// `(macd_line, signal, histogram)` computed from the last value of each
/// series. Returns `(0.0, 0.0, 0.0)` when there isn't enough history for
/// the 26-period EMA or its 9-period signal line.
pub fn macd(closes: &[f64]) -> (f64, f64, f64) {
    let series = macd_series(closes);
    series.last().copied().unwrap_or((0.0, 0.0, 0.0))
}

/// Full aligned `(macd_line, signal, histogram)` series. The three vectors
/// returned by `calculate_ema` have different lengths (12- vs 26- vs
/// 9-period seeds); this function aligns them on their shared trailing
/// window so each tuple element corresponds to the same bar.
pub fn macd_series(closes: &[f64]) -> Vec<(f64, f64, f64)> {
    let ema12 = calculate_ema(closes, 12);
    let ema26 = calculate_ema(closes, 26);
    if ema12.is_empty() || ema26.is_empty() {
        return Vec::new();
    }

    // ema12 is longer than ema26 by (26-12) elements since both are seeded
    // at their own period; align by taking the trailing `ema26.len()` of ema12.
    let offset = ema12.len().saturating_sub(ema26.len());
    let macd_line: Vec<f64> = ema12[offset..]
        .iter()
        .zip(ema26.iter())
        .map(|(&a, &b)| a - b)
        .collect();

    let signal = calculate_ema(&macd_line, 9);
    if signal.is_empty() {
        return Vec::new();
    }

    let sig_offset = macd_line.len().saturating_sub(signal.len());
    macd_line[sig_offset..]
        .iter()
        .zip(signal.iter())
        .map(|(&m, &s)| (m, s, m - s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ascending(n: usize) -> Vec<f64> {
        (1..=n).map(|i| i as f64).collect()
    }

    #[test]
    fn macd_insufficient_data_returns_zeros() {
        assert_eq!(macd(&ascending(10)), (0.0, 0.0, 0.0));
    }

    #[test]
    fn macd_produces_finite_values_on_long_series() {
        let closes = ascending(100);
        let (line, signal, hist) = macd(&closes);
        assert!(line.is_finite());
        assert!(signal.is_finite());
        assert!(hist.is_finite());
        assert!((hist - (line - signal)).abs() < 1e-9);
    }

    #[test]
    fn macd_rising_series_is_positive() {
        // A steadily rising series should produce a positive MACD line
        // (fast EMA rises above slow EMA).
        let closes = ascending(100);
        let (line, _, _) = macd(&closes);
        assert!(line > 0.0);
    }

    #[test]
    fn macd_series_length_is_consistent() {
        let closes = ascending(120);
        let series = macd_series(&closes);
        assert!(!series.is_empty());
        assert_eq!(series.last().copied().unwrap(), macd(&closes));
    }
}
