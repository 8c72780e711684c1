// =============================================================================
// Macro Regime & Multi-Timeframe Analyzer
// =============================================================================
//
// Classifies the broad market backdrop (trend direction plus a volatility
// gate) from a market-proxy series, independent of the microstructure regime
// computed by `regime::detector`. Strategy selection dispatches on this
// classification; `regime::detector`'s output remains a supplementary signal
// feeding the weighted-ensemble scorer.
//
// Classification hierarchy (first match wins):
//
//   1. HighVolatility  — vix > 30
//   2. StrongBull      — price > ma50 > ma200 AND volRatio > 1.2 AND breadth > 0.6
//   3. WeakBull        — price > ma50 > ma200 (uptrend only)
//   4. StrongBear      — price < ma50 < ma200 AND volRatio > 1.2 AND breadth < 0.4
//   5. WeakBear        — price < ma50 < ma200 (downtrend only)
//   6. RangeBound      — neutral trend and vix < 15, or default

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::sma::calculate_sma;
use crate::indicators::stats::annualized_volatility_pct;
use crate::market_data::candle_buffer::{CandleBuffer, CandleKey};

/// TTL applied to cached per-`(symbol, timeframe)` signals.
const SIGNAL_CACHE_TTL: Duration = Duration::from_secs(60);

/// Timeframes scanned by the multi-timeframe analyzer.
pub const ANALYZED_TIMEFRAMES: &[&str] = &["15m", "1h", "1d"];

// =============================================================================
// Types
// =============================================================================

/// Broad market backdrop, distinct from the microstructure regime in
/// `regime::detector`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MacroRegime {
    StrongBull,
    WeakBull,
    StrongBear,
    WeakBear,
    RangeBound,
    HighVolatility,
}

impl std::fmt::Display for MacroRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrongBull => write!(f, "STRONG_BULL"),
            Self::WeakBull => write!(f, "WEAK_BULL"),
            Self::StrongBear => write!(f, "STRONG_BEAR"),
            Self::WeakBear => write!(f, "WEAK_BEAR"),
            Self::RangeBound => write!(f, "RANGE_BOUND"),
            Self::HighVolatility => write!(f, "HIGH_VOLATILITY"),
        }
    }
}

/// A single macro-regime classification with its contributing inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroRegimeState {
    pub regime: MacroRegime,
    pub confidence: f64,
    pub vix: f64,
    pub ma50: f64,
    pub ma200: f64,
    pub price: f64,
    pub vol_ratio: f64,
    pub breadth: f64,
    /// True when `breadth` came from the hard-coded index-basket proxy rather
    /// than a real advance/decline feed; confidence is marked down accordingly.
    pub breadth_is_proxy: bool,
    pub timestamp: i64,
}

/// Per-timeframe trend bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trend {
    StrongUp,
    WeakUp,
    Neutral,
    WeakDown,
    StrongDown,
}

/// Directional recommendation for a single timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeframeAction {
    Buy,
    Sell,
    Hold,
}

/// Trend/strength/action summary for one `(symbol, timeframe)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeSignal {
    pub timeframe: String,
    pub trend: Trend,
    pub strength: f64,
    pub signal: TimeframeAction,
    pub sma20: f64,
    pub sma50: f64,
    pub price: f64,
}

/// Aggregated recommendation across all analyzed timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalRecommendation {
    Buy,
    Sell,
    Hold,
}

// =============================================================================
// Regime classification
// =============================================================================

/// Classify the macro regime from the documented inputs. Pure and
/// deterministic; all thresholds are fixed.
pub fn classify_macro_regime(
    vix: f64,
    ma50: f64,
    ma200: f64,
    price: f64,
    vol_ratio: f64,
    breadth: f64,
) -> (MacroRegime, f64) {
    if vix > 30.0 {
        let confidence = (0.5 + ((vix - 30.0) / 40.0).clamp(0.0, 0.3)).clamp(0.3, 1.0);
        return (MacroRegime::HighVolatility, confidence);
    }

    let uptrend = price > ma50 && ma50 > ma200;
    let downtrend = price < ma50 && ma50 < ma200;
    let strength = if ma200.abs() > f64::EPSILON {
        ((price - ma200) / ma200).abs().min(1.0)
    } else {
        0.0
    };

    let mut confidence: f64 = 0.5 + strength * 0.3;

    if uptrend {
        let volume_confirmed = vol_ratio > 1.2;
        let breadth_confirmed = breadth > 0.6;
        confidence += if volume_confirmed { 0.1 } else { -0.1 };
        confidence += if breadth_confirmed { 0.1 } else { -0.1 };
        confidence = confidence.clamp(0.3, 1.0);
        if volume_confirmed && breadth_confirmed {
            return (MacroRegime::StrongBull, confidence);
        }
        return (MacroRegime::WeakBull, confidence);
    }

    if downtrend {
        let volume_confirmed = vol_ratio > 1.2;
        let breadth_confirmed = breadth < 0.4;
        confidence += if volume_confirmed { 0.1 } else { -0.1 };
        confidence += if breadth_confirmed { 0.1 } else { -0.1 };
        confidence = confidence.clamp(0.3, 1.0);
        if volume_confirmed && breadth_confirmed {
            return (MacroRegime::StrongBear, confidence);
        }
        return (MacroRegime::WeakBear, confidence);
    }

    if vix < 15.0 {
        return (MacroRegime::RangeBound, confidence.clamp(0.3, 1.0));
    }

    (MacroRegime::RangeBound, 0.30)
}

/// Convert an inverse-volatility ETF proxy reading into an approximate VIX
/// level via the documented linear conversion.
pub fn vix_from_inverse_vol_proxy(proxy: f64) -> f64 {
    proxy / 2.0 + 2.0
}

/// Last-resort volatility proxy: annualized stdev of 20-day log returns.
/// Falls back to a neutral reading when there isn't enough history.
pub fn vix_from_annualized_stdev(closes: &[f64]) -> f64 {
    annualized_volatility_pct(closes, 20).unwrap_or(20.0)
}

/// Advance/decline breadth over a small hard-coded index basket, computed
/// from each symbol's last two closes in `candle_buffer`. Returns `(breadth,
/// is_proxy)`; `is_proxy` is always `true` here since the bot has no live
/// advance/decline feed and this basket stands in for one.
pub fn compute_breadth_proxy(
    candle_buffer: &CandleBuffer,
    basket: &[String],
    interval: &str,
) -> (f64, bool) {
    let mut advancing = 0usize;
    let mut declining = 0usize;

    for symbol in basket {
        let key = CandleKey {
            symbol: symbol.clone(),
            interval: interval.to_string(),
        };
        let closes = candle_buffer.get_closes(&key, 2);
        if closes.len() < 2 {
            continue;
        }
        if closes[1] > closes[0] {
            advancing += 1;
        } else if closes[1] < closes[0] {
            declining += 1;
        }
    }

    let total = advancing + declining;
    if total == 0 {
        return (0.5, true);
    }
    (advancing as f64 / total as f64, true)
}

// =============================================================================
// Multi-timeframe signal
// =============================================================================

fn classify_trend(sma20: f64, sma50: f64) -> (Trend, f64) {
    if sma50.abs() < f64::EPSILON {
        return (Trend::Neutral, 0.0);
    }
    let sep_pct = (sma20 - sma50) / sma50 * 100.0;
    let strength = (sep_pct.abs() / 5.0).clamp(0.0, 1.0);
    let trend = if sep_pct > 3.0 {
        Trend::StrongUp
    } else if sep_pct > 0.5 {
        Trend::WeakUp
    } else if sep_pct < -3.0 {
        Trend::StrongDown
    } else if sep_pct < -0.5 {
        Trend::WeakDown
    } else {
        Trend::Neutral
    };
    (trend, strength)
}

/// Relaxed-entry signal rule applied on top of the trend bucket.
fn relaxed_entry_signal(trend: Trend, price: f64, sma20: f64) -> TimeframeAction {
    match trend {
        Trend::StrongUp => {
            if price > sma20 * 1.05 {
                TimeframeAction::Hold
            } else {
                TimeframeAction::Buy
            }
        }
        Trend::WeakUp => {
            if price < sma20 * 1.03 {
                TimeframeAction::Buy
            } else {
                TimeframeAction::Hold
            }
        }
        Trend::StrongDown | Trend::WeakDown => {
            if price > sma20 * 0.99 {
                TimeframeAction::Sell
            } else {
                TimeframeAction::Hold
            }
        }
        Trend::Neutral => TimeframeAction::Hold,
    }
}

/// Compute the timeframe signal for `symbol` on `timeframe` from closed
/// candles, uncached. Returns `None` with fewer than 50 closes.
pub fn analyze_timeframe(
    candle_buffer: &CandleBuffer,
    symbol: &str,
    timeframe: &str,
) -> Option<TimeframeSignal> {
    let key = CandleKey {
        symbol: symbol.to_string(),
        interval: timeframe.to_string(),
    };
    let closes = candle_buffer.get_closes(&key, 200);
    if closes.len() < 50 {
        return None;
    }

    let sma20 = *calculate_sma(&closes, 20).last()?;
    let sma50 = *calculate_sma(&closes, 50).last()?;
    let price = *closes.last()?;

    let (trend, strength) = classify_trend(sma20, sma50);
    let signal = relaxed_entry_signal(trend, price, sma20);

    Some(TimeframeSignal {
        timeframe: timeframe.to_string(),
        trend,
        strength,
        signal,
        sma20,
        sma50,
        price,
    })
}

/// Combine per-timeframe signals into a single recommendation.
///
/// Fires `Buy`/`Sell` when either at least `min_aligned` timeframes agree on
/// the same directional signal, or at least 60% of timeframes are bullish
/// (`Buy`) with average strength >= 0.4. Otherwise `Hold`.
pub fn final_recommendation(signals: &[TimeframeSignal], min_aligned: usize) -> FinalRecommendation {
    if signals.is_empty() {
        return FinalRecommendation::Hold;
    }

    let buy_count = signals
        .iter()
        .filter(|s| s.signal == TimeframeAction::Buy)
        .count();
    let sell_count = signals
        .iter()
        .filter(|s| s.signal == TimeframeAction::Sell)
        .count();

    if buy_count >= min_aligned && buy_count >= sell_count {
        return FinalRecommendation::Buy;
    }
    if sell_count >= min_aligned && sell_count > buy_count {
        return FinalRecommendation::Sell;
    }

    let bullish_frac = buy_count as f64 / signals.len() as f64;
    let avg_strength = signals.iter().map(|s| s.strength).sum::<f64>() / signals.len() as f64;
    if bullish_frac >= 0.6 && avg_strength >= 0.4 {
        return FinalRecommendation::Buy;
    }

    let bearish_frac = sell_count as f64 / signals.len() as f64;
    if bearish_frac >= 0.6 && avg_strength >= 0.4 {
        return FinalRecommendation::Sell;
    }

    FinalRecommendation::Hold
}

// =============================================================================
// TTL cache — one entry per (symbol, timeframe)
// =============================================================================

/// Thread-safe cache of the most recent [`TimeframeSignal`] per
/// `(symbol, timeframe)`, refreshed at most once per minute.
pub struct TimeframeSignalCache {
    entries: RwLock<HashMap<(String, String), (Instant, TimeframeSignal)>>,
}

impl TimeframeSignalCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Return a fresh or cached signal for `(symbol, timeframe)`, recomputing
    /// from `candle_buffer` when the cached entry is absent or stale.
    pub fn get_or_compute(
        &self,
        candle_buffer: &CandleBuffer,
        symbol: &str,
        timeframe: &str,
    ) -> Option<TimeframeSignal> {
        let cache_key = (symbol.to_string(), timeframe.to_string());
        let now = Instant::now();

        if let Some((fetched_at, signal)) = self.entries.read().get(&cache_key) {
            if now.duration_since(*fetched_at) < SIGNAL_CACHE_TTL {
                return Some(signal.clone());
            }
        }

        let fresh = analyze_timeframe(candle_buffer, symbol, timeframe)?;
        debug!(symbol, timeframe, "timeframe signal cache refreshed");
        self.entries.write().insert(cache_key, (now, fresh.clone()));
        Some(fresh)
    }

    /// Compute (or reuse cached) signals across [`ANALYZED_TIMEFRAMES`] and
    /// return the aggregated recommendation alongside the per-timeframe detail.
    pub fn analyze_symbol(
        &self,
        candle_buffer: &CandleBuffer,
        symbol: &str,
        min_aligned: usize,
    ) -> (FinalRecommendation, Vec<TimeframeSignal>) {
        let signals: Vec<TimeframeSignal> = ANALYZED_TIMEFRAMES
            .iter()
            .filter_map(|tf| self.get_or_compute(candle_buffer, symbol, tf))
            .collect();
        let recommendation = final_recommendation(&signals, min_aligned);
        (recommendation, signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_volatility_overrides_everything() {
        let (regime, _) = classify_macro_regime(35.0, 100.0, 90.0, 110.0, 2.0, 0.9);
        assert_eq!(regime, MacroRegime::HighVolatility);
    }

    #[test]
    fn strong_bull_requires_volume_and_breadth() {
        let (regime, conf) = classify_macro_regime(18.0, 100.0, 90.0, 110.0, 1.5, 0.7);
        assert_eq!(regime, MacroRegime::StrongBull);
        assert!(conf >= 0.3 && conf <= 1.0);
    }

    #[test]
    fn weak_bull_when_confirmation_missing() {
        let (regime, _) = classify_macro_regime(18.0, 100.0, 90.0, 110.0, 0.9, 0.5);
        assert_eq!(regime, MacroRegime::WeakBull);
    }

    #[test]
    fn strong_bear_symmetric_to_strong_bull() {
        let (regime, _) = classify_macro_regime(18.0, 90.0, 100.0, 80.0, 1.5, 0.3);
        assert_eq!(regime, MacroRegime::StrongBear);
    }

    #[test]
    fn weak_bear_when_confirmation_missing() {
        let (regime, _) = classify_macro_regime(18.0, 90.0, 100.0, 80.0, 0.9, 0.5);
        assert_eq!(regime, MacroRegime::WeakBear);
    }

    #[test]
    fn range_bound_neutral_low_vix() {
        let (regime, _) = classify_macro_regime(10.0, 100.0, 100.0, 100.0, 1.0, 0.5);
        assert_eq!(regime, MacroRegime::RangeBound);
    }

    #[test]
    fn range_bound_is_default() {
        let (regime, conf) = classify_macro_regime(20.0, 100.0, 100.0, 100.0, 1.0, 0.5);
        assert_eq!(regime, MacroRegime::RangeBound);
        assert!((conf - 0.30).abs() < 1e-9);
    }

    #[test]
    fn vix_proxy_conversion() {
        assert!((vix_from_inverse_vol_proxy(30.0) - 17.0).abs() < 1e-9);
    }

    #[test]
    fn relaxed_entry_strong_up_blocks_extended_price() {
        let action = relaxed_entry_signal(Trend::StrongUp, 106.0, 100.0);
        assert_eq!(action, TimeframeAction::Hold);
    }

    #[test]
    fn relaxed_entry_strong_up_buys_when_not_extended() {
        let action = relaxed_entry_signal(Trend::StrongUp, 103.0, 100.0);
        assert_eq!(action, TimeframeAction::Buy);
    }

    #[test]
    fn relaxed_entry_weak_down_sells_above_discount() {
        let action = relaxed_entry_signal(Trend::WeakDown, 100.0, 100.0);
        assert_eq!(action, TimeframeAction::Sell);
    }

    #[test]
    fn final_recommendation_majority_alignment() {
        let signals = vec![
            TimeframeSignal {
                timeframe: "15m".into(),
                trend: Trend::StrongUp,
                strength: 0.8,
                signal: TimeframeAction::Buy,
                sma20: 100.0,
                sma50: 95.0,
                price: 101.0,
            },
            TimeframeSignal {
                timeframe: "1h".into(),
                trend: Trend::WeakUp,
                strength: 0.5,
                signal: TimeframeAction::Buy,
                sma20: 100.0,
                sma50: 98.0,
                price: 101.0,
            },
            TimeframeSignal {
                timeframe: "1d".into(),
                trend: Trend::Neutral,
                strength: 0.1,
                signal: TimeframeAction::Hold,
                sma20: 100.0,
                sma50: 100.0,
                price: 100.0,
            },
        ];
        assert_eq!(final_recommendation(&signals, 2), FinalRecommendation::Buy);
    }

    #[test]
    fn final_recommendation_empty_is_hold() {
        assert_eq!(final_recommendation(&[], 2), FinalRecommendation::Hold);
    }

    #[test]
    fn breadth_proxy_empty_basket_is_neutral() {
        let buf = CandleBuffer::new(10);
        let (breadth, is_proxy) = compute_breadth_proxy(&buf, &[], "1d");
        assert!((breadth - 0.5).abs() < 1e-9);
        assert!(is_proxy);
    }
}
