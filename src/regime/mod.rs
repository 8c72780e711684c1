// =============================================================================
// Regime Detection Module
// =============================================================================
//
// Market regime classification using multiple quantitative indicators:
// - ADX (trend strength)
// - Bollinger Band Width (volatility expansion/contraction)
// - Hurst exponent (persistence vs mean-reversion)
// - Shannon entropy (randomness / information content)
//
// `macro_regime` classifies the broader trend/volatility backdrop
// (bull/bear/range/high-vol) that strategy selection dispatches on; it is
// independent of the microstructure regime above.

pub mod detector;
pub mod entropy;
pub mod hurst;
pub mod macro_regime;

pub use detector::{MarketRegime, RegimeDetector, RegimeState};
pub use entropy::ShannonEntropyFilter;
pub use hurst::calculate_hurst_exponent;
pub use macro_regime::{
    FinalRecommendation, MacroRegime, MacroRegimeState, TimeframeAction, TimeframeSignal,
    TimeframeSignalCache, Trend,
};
