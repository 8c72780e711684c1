// =============================================================================
// Statistical primitives — stdev, log-returns, Pearson correlation
// =============================================================================
//
// Shared building blocks used by the regime analyzer (annualised volatility
// fallback, breadth correlation) and the backtest summary (Sharpe ratio).

/// Population standard deviation of `values`. Returns `None` for fewer than
/// two observations (undefined dispersion).
pub fn standard_deviation(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    let sd = variance.sqrt();
    sd.is_finite().then_some(sd)
}

/// Log returns `ln(p_t / p_{t-1})` for consecutive closes. Non-positive
/// prices are skipped (they would produce a non-finite log); the resulting
/// series may therefore be shorter than `closes.len() - 1`.
pub fn log_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter_map(|w| {
            if w[0] > 0.0 && w[1] > 0.0 {
                Some((w[1] / w[0]).ln())
            } else {
                None
            }
        })
        .collect()
}

/// Annualised volatility estimate from the trailing `window` daily closes:
/// `stdev(log returns) * sqrt(252) * 100`. This is the documented
/// last-resort VIX proxy when neither a live VIX feed nor an inverse-vol
/// ETF proxy is available.
pub fn annualized_volatility_pct(closes: &[f64], window: usize) -> Option<f64> {
    if closes.len() < window + 1 {
        return None;
    }
    let tail = &closes[closes.len() - window - 1..];
    let returns = log_returns(tail);
    let sd = standard_deviation(&returns)?;
    Some(sd * 252.0_f64.sqrt() * 100.0)
}

/// Pearson correlation coefficient between two equal-length series.
///
/// Returns `None` when the series differ in length, have fewer than two
/// points, or either series has zero variance (undefined correlation).
pub fn pearson_correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..a.len() {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }

    let r = cov / (var_a.sqrt() * var_b.sqrt());
    r.is_finite().then_some(r.clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdev_needs_two_points() {
        assert!(standard_deviation(&[1.0]).is_none());
    }

    #[test]
    fn stdev_constant_series_is_zero() {
        let v = vec![5.0; 10];
        assert!((standard_deviation(&v).unwrap()).abs() < 1e-10);
    }

    #[test]
    fn log_returns_basic() {
        let closes = vec![100.0, 110.0, 99.0];
        let r = log_returns(&closes);
        assert_eq!(r.len(), 2);
        assert!((r[0] - (110.0_f64 / 100.0).ln()).abs() < 1e-12);
    }

    #[test]
    fn log_returns_skips_non_positive() {
        let closes = vec![100.0, -5.0, 110.0];
        let r = log_returns(&closes);
        assert_eq!(r.len(), 0);
    }

    #[test]
    fn annualized_vol_insufficient_data() {
        assert!(annualized_volatility_pct(&[1.0, 2.0], 20).is_none());
    }

    #[test]
    fn annualized_vol_positive_for_noisy_series() {
        let closes: Vec<f64> = (0..30)
            .map(|i| 100.0 + (i as f64 * 1.3).sin() * 5.0)
            .collect();
        let vol = annualized_volatility_pct(&closes, 20).unwrap();
        assert!(vol > 0.0);
    }

    #[test]
    fn correlation_perfect_positive() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = vec![2.0, 4.0, 6.0, 8.0, 10.0];
        let r = pearson_correlation(&a, &b).unwrap();
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn correlation_perfect_negative() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = vec![5.0, 4.0, 3.0, 2.0, 1.0];
        let r = pearson_correlation(&a, &b).unwrap();
        assert!((r + 1.0).abs() < 1e-9);
    }

    #[test]
    fn correlation_zero_variance_is_none() {
        let a = vec![1.0, 1.0, 1.0];
        let b = vec![1.0, 2.0, 3.0];
        assert!(pearson_correlation(&a, &b).is_none());
    }

    #[test]
    fn correlation_mismatched_lengths_is_none() {
        assert!(pearson_correlation(&[1.0, 2.0], &[1.0]).is_none());
    }
}
