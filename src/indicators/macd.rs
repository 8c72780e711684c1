// =============================================================================
// MACD — Moving Average Convergence Divergence (12, 26, 9)
// =============================================================================
//
// MACD line   = EMA(fast) - EMA(slow)
// Signal line = EMA(signal period) of the MACD line
// Histogram   = MACD line - Signal line
//
// Standard parameters (12, 26, 9) mirror the teacher's EMA stack choices
// (9/21/55) in spirit: fast-reacting minus slow-reacting, smoothed again.

use super::ema::calculate_ema;

/// A single MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the full MACD series for `closes` using `(fast, slow, signal)`
/// periods. Returns one entry per bar where both the MACD line and its
/// signal line are defined.
///
/// Returns an empty vec when there is insufficient history for the slow EMA
/// plus the signal smoothing window.
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Vec<MacdResult> {
    if fast == 0 || slow == 0 || signal == 0 || slow <= fast {
        return Vec::new();
    }
    if closes.len() < slow + signal {
        return Vec::new();
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);

    // Align series: ema_fast starts at index `fast-1`, ema_slow at `slow-1`.
    // The slow series is always shorter (starts later); truncate the fast
    // series' leading elements to match.
    let offset = slow - fast;
    if ema_fast.len() <= offset {
        return Vec::new();
    }
    let aligned_fast = &ema_fast[offset..];
    let len = aligned_fast.len().min(ema_slow.len());

    let macd_line: Vec<f64> = (0..len)
        .map(|i| aligned_fast[i] - ema_slow[i])
        .collect();

    if macd_line.len() < signal {
        return Vec::new();
    }

    let signal_line = calculate_ema(&macd_line, signal);
    let sig_offset = macd_line.len() - signal_line.len();

    signal_line
        .iter()
        .enumerate()
        .map(|(i, &sig)| {
            let macd = macd_line[i + sig_offset];
            MacdResult {
                macd,
                signal: sig,
                histogram: macd - sig,
            }
        })
        .collect()
}

/// Standard (12, 26, 9) MACD, returning only the latest reading.
pub fn current_macd(closes: &[f64]) -> Option<MacdResult> {
    calculate_macd(closes, 12, 26, 9).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data_is_empty() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_empty());
    }

    #[test]
    fn macd_rising_series_has_positive_histogram() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let series = calculate_macd(&closes, 12, 26, 9);
        assert!(!series.is_empty());
        let last = series.last().unwrap();
        // A steadily ascending series has the fast EMA pulling away from the
        // slow one, so MACD line and histogram should both be positive.
        assert!(last.macd > 0.0);
    }

    #[test]
    fn macd_flat_series_converges_to_zero() {
        let closes = vec![50.0; 100];
        let series = calculate_macd(&closes, 12, 26, 9);
        let last = series.last().unwrap();
        assert!(last.macd.abs() < 1e-6);
        assert!(last.histogram.abs() < 1e-6);
    }

    #[test]
    fn current_macd_matches_series_last() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let series = calculate_macd(&closes, 12, 26, 9);
        let current = current_macd(&closes).unwrap();
        assert_eq!(series.last().copied(), Some(current));
    }

    #[test]
    fn macd_bad_periods_returns_empty() {
        let closes: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 0, 26, 9).is_empty());
        assert!(calculate_macd(&closes, 26, 12, 9).is_empty());
    }
}
