// =============================================================================
// Volatility — trailing population standard deviation
// =============================================================================

/// Population standard deviation of the trailing `period` values in `xs`.
/// Returns `0.0` when `xs.len() < period` or `period == 0`.
pub fn volatility(xs: &[f64], period: usize) -> f64 {
    if period == 0 || xs.len() < period {
        return 0.0;
    }
    let window = &xs[xs.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();
    if sd.is_finite() {
        sd
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatility_zero_on_short_input() {
        assert_eq!(volatility(&[1.0, 2.0], 5), 0.0);
    }

    #[test]
    fn volatility_zero_period_is_zero() {
        assert_eq!(volatility(&[1.0, 2.0, 3.0], 0), 0.0);
    }

    #[test]
    fn volatility_constant_series_is_zero() {
        assert_eq!(volatility(&[5.0; 20], 10), 0.0);
    }

    #[test]
    fn volatility_known_value() {
        // [2, 4, 4, 4, 5, 5, 7, 9] has population stdev = 2.0 (textbook example).
        let xs = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let v = volatility(&xs, xs.len());
        assert!((v - 2.0).abs() < 1e-9);
    }

    #[test]
    fn volatility_uses_trailing_window_only() {
        let mut xs = vec![1000.0, -1000.0]; // large values outside the window
        xs.extend(vec![5.0; 10]);
        let v = volatility(&xs, 10);
        assert_eq!(v, 0.0);
    }
}
