// =============================================================================
// Strategy Engine — The Brain of Aurora
// =============================================================================
//
// Evaluates each symbol on every 5M candle close and produces trade Proposals.
//
// Pipeline:
//   1. Compute all indicators (EMA, RSI, ADX, Bollinger, ATR, ROC)
//   2. Detect market regime
//   3. Build signal inputs
//   4. Run weighted ensemble scorer
//   5. Apply insurance gates
//   6. Apply smart filters
//   7. Compute SL/TP using **5M ATR** (CRITICAL: never use 1M ATR)
//   8. Enforce minimum floors: SL >= 0.4%, TP1 >= 0.6%, TP2 >= 1.0%
//   9. Output DecisionEnvelope + optional Proposal
// =============================================================================

use std::sync::Arc;
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::decision_envelope::DecisionEnvelope;
use crate::indicators::atr::calculate_atr;
use crate::indicators::ema::calculate_ema;
use crate::indicators::rsi::calculate_rsi;
use crate::indicators::stats::log_returns;
use crate::market_data::CandleKey;
use crate::regime::MacroRegime;
use crate::signals::SignalInput;
use crate::trade_insurance::InsuranceGate;

/// Whether an RFC3339 timestamp falls on the current UTC calendar date.
fn is_opened_today(opened_at: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(opened_at)
        .map(|dt| dt.date_naive() == chrono::Utc::now().date_naive())
        .unwrap_or(false)
}

/// Log-returns of the 15m close series for a symbol, used by the correlation
/// entry veto. Empty if there isn't enough history.
fn candle_buffer_log_returns(state: &Arc<AppState>, symbol: &str) -> Vec<f64> {
    let key = CandleKey {
        symbol: symbol.to_string(),
        interval: "15m".to_string(),
    };
    let closes = state.candle_buffer.get_closes(&key, 60);
    if closes.len() < 10 {
        return Vec::new();
    }
    log_returns(&closes)
}

// =============================================================================
// Regime -> Strategy Dispatch Table
// =============================================================================

/// Minimum daily closes required before a macro regime strategy is trusted.
const DISPATCH_MIN_HISTORY: usize = 30;

/// Outcome of mapping the macro regime to a concrete strategy signal.
enum DispatchSignal {
    /// No directional signal; carries the reason shown on the blocked envelope.
    Hold(String),
    /// A directional signal produced by the named strategy.
    Trade { side: &'static str },
}

/// Maps the current macro regime to the strategy that trades it:
///
/// * RangeBound      -> RSI(14) mean reversion, 30/70 bands.
/// * WeakBull/StrongBull -> MACD(12,26,9) trend following.
/// * HighVolatility  -> Bollinger(20, k=2.5) mean reversion.
/// * StrongBear/WeakBear -> defensive: sell existing longs, otherwise hold.
///
/// Returns the strategy's display name alongside its signal so callers can
/// record it for the `activeStrategy(symbol)` observability hook.
fn dispatch_strategy(
    regime: MacroRegime,
    daily_closes: &[f64],
    has_open_long: bool,
) -> (&'static str, DispatchSignal) {
    if daily_closes.len() < DISPATCH_MIN_HISTORY {
        return ("None", DispatchSignal::Hold("Insufficient history".to_string()));
    }

    match regime {
        MacroRegime::RangeBound => {
            let rsi = calculate_rsi(daily_closes, 14).last().copied();
            let signal = match rsi {
                Some(r) if r < 30.0 => DispatchSignal::Trade { side: "BUY" },
                Some(r) if r > 70.0 => DispatchSignal::Trade { side: "SELL" },
                Some(r) => DispatchSignal::Hold(format!("RSI {:.1} inside 30/70 band", r)),
                None => DispatchSignal::Hold("RSI not ready".to_string()),
            };
            ("RsiMeanReversion", signal)
        }
        MacroRegime::WeakBull | MacroRegime::StrongBull => {
            let macd = crate::indicators::macd::calculate_macd(daily_closes, 12, 26, 9);
            let signal = match macd.last() {
                Some(m) if m.macd > m.signal && m.histogram > 0.0 => {
                    DispatchSignal::Trade { side: "BUY" }
                }
                Some(m) if m.macd < m.signal && m.histogram < 0.0 => {
                    DispatchSignal::Trade { side: "SELL" }
                }
                Some(_) => DispatchSignal::Hold("MACD not aligned with trend".to_string()),
                None => DispatchSignal::Hold("MACD not ready".to_string()),
            };
            ("MacdTrend", signal)
        }
        MacroRegime::HighVolatility => {
            let bands = crate::indicators::bollinger::calculate_bollinger(daily_closes, 20, 2.5);
            let price = *daily_closes.last().unwrap();
            let signal = match bands {
                Some(b) if price < b.lower => DispatchSignal::Trade { side: "BUY" },
                Some(b) if price > b.upper => DispatchSignal::Trade { side: "SELL" },
                Some(_) => DispatchSignal::Hold("Price inside Bollinger bands".to_string()),
                None => DispatchSignal::Hold("Bollinger bands not ready".to_string()),
            };
            ("BollingerMeanReversion", signal)
        }
        MacroRegime::StrongBear | MacroRegime::WeakBear => {
            let signal = if has_open_long {
                DispatchSignal::Trade { side: "SELL" }
            } else {
                DispatchSignal::Hold("Defensive regime — no long to exit".to_string())
            };
            ("Defensive", signal)
        }
    }
}

// =============================================================================
// Trade Proposal
// =============================================================================

/// A fully validated trade proposal ready for execution.
#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub confidence: f64,
    pub regime: String,
    pub score: f64,
}

// =============================================================================
// Strategy Engine
// =============================================================================

pub struct StrategyEngine;

impl StrategyEngine {
    /// The strategy currently dispatched for `symbol`, from its last
    /// evaluation. `None` until the symbol has been evaluated at least once.
    pub fn active_strategy(state: &Arc<AppState>, symbol: &str) -> Option<String> {
        state.active_strategies.read().get(symbol).cloned()
    }

    /// Evaluate a single symbol and return an optional trade proposal with
    /// its decision envelope.
    pub fn evaluate_symbol(
        state: &Arc<AppState>,
        symbol: &str,
    ) -> (DecisionEnvelope, Option<TradeProposal>) {
        let config = state.runtime_config.read().clone();
        let strategy_name = "AuroraV3";

        // ── 1. Gather 5M candles ─────────────────────────────────────────
        let key_5m = CandleKey {
            symbol: symbol.to_string(),
            interval: "5m".to_string(),
        };
        let candles_5m = state.candle_buffer.get_closed_candles(&key_5m, 100);

        if candles_5m.len() < 30 {
            let envelope = DecisionEnvelope::blocked(
                symbol,
                "BUY",
                strategy_name,
                "DataQuality",
                format!("Insufficient 5M candles: {} < 30", candles_5m.len()),
            );
            return (envelope, None);
        }

        // ── 2. Compute indicators on 5M ──────────────────────────────────
        let closes: Vec<f64> = candles_5m.iter().map(|c| c.close).collect();

        let ema_9 = calculate_ema(&closes, 9).last().copied();
        let ema_21 = calculate_ema(&closes, 21).last().copied();
        let ema_55 = calculate_ema(&closes, 55).last().copied();
        let rsi_14 = calculate_rsi(&closes, 14).last().copied();

        // CRITICAL: ATR from 5M candles ONLY (never 1M)
        let atr_14 = calculate_atr(&candles_5m, 14);

        let adx_val = crate::indicators::adx::calculate_adx(&candles_5m, 14);
        let bb = crate::indicators::bollinger::calculate_bollinger(&closes, 20, 2.0);
        let roc_14 = crate::indicators::roc::calculate_roc(&closes, 14).last().copied();

        let current_price = candles_5m.last().map(|c| c.close).unwrap_or(0.0);

        if current_price <= 0.0 || atr_14.is_none() {
            let envelope = DecisionEnvelope::blocked(
                symbol,
                "BUY",
                strategy_name,
                "DataQuality",
                "Invalid price or ATR not ready",
            );
            return (envelope, None);
        }

        let atr = atr_14.unwrap();

        // ── 3. Detect regime ─────────────────────────────────────────────
        let regime_state = state.regime_detector.read().current_regime();
        let regime_label = regime_state
            .as_ref()
            .map(|r| r.regime.to_string())
            .unwrap_or_else(|| "Ranging".to_string());

        // ── 3b. Regime -> strategy dispatch ──────────────────────────────
        let daily_key = CandleKey {
            symbol: symbol.to_string(),
            interval: "1d".to_string(),
        };
        let daily_closes = state.candle_buffer.get_closes(&daily_key, 220);
        let has_open_long = state
            .position_manager
            .get_open_positions()
            .iter()
            .any(|p| p.symbol == symbol && p.side == "BUY");
        let macro_regime = state
            .last_macro_regime
            .read()
            .as_ref()
            .map(|m| m.regime)
            .unwrap_or(MacroRegime::RangeBound);

        let (dispatch_strategy_name, dispatch_signal) =
            dispatch_strategy(macro_regime, &daily_closes, has_open_long);
        state
            .active_strategies
            .write()
            .insert(symbol.to_string(), dispatch_strategy_name.to_string());

        let dispatch_side = match dispatch_signal {
            DispatchSignal::Hold(reason) => {
                let envelope = DecisionEnvelope::blocked(
                    symbol, "HOLD", dispatch_strategy_name, "StrategyDispatch", &reason,
                );
                return (envelope, None);
            }
            DispatchSignal::Trade { side } => side,
        };

        // ── 4. Build signal inputs ───────────────────────────────────────
        let mut signals = Vec::new();

        // RSI signal
        if let Some(rsi) = rsi_14 {
            let (direction, confidence) = if rsi < 30.0 {
                (1.0, (30.0 - rsi) / 30.0)
            } else if rsi > 70.0 {
                (-1.0, (rsi - 70.0) / 30.0)
            } else {
                (0.0, 0.0)
            };
            signals.push(SignalInput {
                name: "rsi".to_string(),
                weight: 0.15,
                confidence: confidence.min(1.0),
                direction,
            });
        }

        // EMA trend alignment signal
        if let (Some(e9), Some(e21), Some(e55)) = (ema_9, ema_21, ema_55) {
            let bullish = e9 > e21 && e21 > e55 && current_price > e9;
            let bearish = e9 < e21 && e21 < e55 && current_price < e9;
            let (direction, confidence) = if bullish {
                (1.0, 0.8)
            } else if bearish {
                (-1.0, 0.8)
            } else {
                (0.0, 0.3)
            };
            signals.push(SignalInput {
                name: "ema_trend".to_string(),
                weight: 0.20,
                confidence,
                direction,
            });
        }

        // ADX signal (trend strength)
        if let Some(adx) = adx_val {
            let confidence = (adx / 50.0).min(1.0);
            signals.push(SignalInput {
                name: "adx".to_string(),
                weight: 0.15,
                confidence,
                direction: if adx > 25.0 { 1.0 } else { 0.0 },
            });
        }

        // Bollinger Band width (volatility)
        if let Some(ref bands) = bb {
            let bbw = if bands.middle > 0.0 {
                (bands.upper - bands.lower) / bands.middle * 100.0
            } else {
                0.0
            };
            let direction = if current_price < bands.lower {
                1.0
            } else if current_price > bands.upper {
                -1.0
            } else {
                0.0
            };
            signals.push(SignalInput {
                name: "bbw".to_string(),
                weight: 0.10,
                confidence: (bbw / 5.0).min(1.0),
                direction,
            });
        }

        // ROC (momentum)
        if let Some(roc) = roc_14 {
            let direction = if roc > 0.0 { 1.0 } else if roc < 0.0 { -1.0 } else { 0.0 };
            let confidence = (roc.abs() / 5.0).min(1.0);
            signals.push(SignalInput {
                name: "roc".to_string(),
                weight: 0.10,
                confidence,
                direction,
            });
        }

        // Orderbook imbalance
        if let Some(imbalance) = state.orderbook_manager.imbalance(symbol) {
            let direction = if imbalance > 0.1 {
                1.0
            } else if imbalance < -0.1 {
                -1.0
            } else {
                0.0
            };
            signals.push(SignalInput {
                name: "orderbook".to_string(),
                weight: 0.10,
                confidence: imbalance.abs().min(1.0),
                direction,
            });
        }

        // CVD (cumulative volume delta)
        {
            let trade_procs = state.trade_processors.read();
            if let Some(tp) = trade_procs.get(symbol) {
                let buy_ratio = tp.buy_volume_ratio();
                let direction = if buy_ratio > 0.55 {
                    1.0
                } else if buy_ratio < 0.45 {
                    -1.0
                } else {
                    0.0
                };
                signals.push(SignalInput {
                    name: "cvd".to_string(),
                    weight: 0.10,
                    confidence: ((buy_ratio - 0.5).abs() * 4.0).min(1.0),
                    direction,
                });
            }
        }

        // VPIN signal
        {
            let vpin_states = state.vpin_states.read();
            if let Some(vpin_state) = vpin_states.get(symbol) {
                let vpin_val = vpin_state.vpin;
                let direction = if vpin_val > 0.7 {
                    -1.0
                } else {
                    0.0
                };
                signals.push(SignalInput {
                    name: "vpin".to_string(),
                    weight: 0.10,
                    confidence: vpin_val.min(1.0),
                    direction,
                });
            }
        }

        // ── 5. Score ─────────────────────────────────────────────────────
        let scoring = state.weighted_scorer.read().score(&signals, &regime_label);

        // Store for dashboard
        *state.last_scoring.write() = Some(scoring.clone());

        debug!(
            symbol,
            score = scoring.total_score,
            decision = %scoring.decision,
            regime = %regime_label,
            "strategy scoring complete"
        );

        // The dispatch table (3b) picked the side for the active regime
        // strategy; the ensemble scorer corroborates rather than decides.
        // A strong contradiction (scorer confidently wants the opposite
        // side) vetoes the trade instead of silently overriding it.
        let dispatch_direction = if dispatch_side == "BUY" { 1.0 } else { -1.0 };
        if scoring.total_score * dispatch_direction < -0.25 {
            let envelope = DecisionEnvelope::blocked(
                symbol,
                "HOLD",
                dispatch_strategy_name,
                "Strategy",
                format!(
                    "Ensemble score {:.3} contradicts {} dispatch signal (regime: {})",
                    scoring.total_score, dispatch_side, regime_label
                ),
            );
            return (envelope, None);
        }

        let side = dispatch_side.to_string();
        let strategy_name = dispatch_strategy_name;

        // ── 6. Insurance gates ───────────────────────────────────────────
        let insurance_result = InsuranceGate::check_all(state, symbol, &side);
        if let Some(block_reason) = insurance_result {
            let envelope = DecisionEnvelope::blocked(
                symbol, &side, strategy_name, "Insurance", &block_reason,
            );
            return (envelope, None);
        }

        // ── 6b. Risk entry veto rule 1: global drawdown halt ─────────────
        if let Some(reason) = state.risk_engine.drawdown_halt_active() {
            let envelope = DecisionEnvelope::blocked(symbol, &side, strategy_name, "RiskVeto", &reason);
            return (envelope, None);
        }

        // ── 6c. Risk entry veto rule 2: PDT guard ────────────────────────
        // Only a same-day round trip on an existing position counts as a
        // day trade; a fresh entry never trips this on its own.
        let equity = state.risk_engine.current_equity();
        let is_same_day_round_trip = side == "SELL"
            && state
                .position_manager
                .get_open_positions()
                .iter()
                .any(|p| p.symbol == symbol && is_opened_today(&p.opened_at));
        if let Some(reason) = state.risk_engine.pdt_guard(equity, is_same_day_round_trip) {
            let envelope = DecisionEnvelope::blocked(symbol, &side, strategy_name, "RiskVeto", &reason);
            return (envelope, None);
        }

        // ── 7. Smart filters ─────────────────────────────────────────────
        let smart_filter_result = crate::smart_filters::SmartFilterEngine::evaluate(
            state, symbol, &side, &regime_label, scoring.total_score,
        );
        if let Some(block_reason) = smart_filter_result {
            let envelope = DecisionEnvelope::blocked(
                symbol, &side, strategy_name, "SmartFilter", &block_reason,
            );
            return (envelope, None);
        }

        // ── 8. Compute SL/TP using 5M ATR with minimum floors ───────────
        let params = &config.strategy_params;
        let sl_distance = atr * params.sl_atr_multiplier;
        let tp1_distance = atr * params.tp1_atr_multiplier;
        let tp2_distance = atr * params.tp2_atr_multiplier;

        let min_sl = current_price * (params.min_sl_pct / 100.0);
        let min_tp1 = current_price * (params.min_tp1_pct / 100.0);
        let min_tp2 = current_price * (params.min_tp2_pct / 100.0);

        let sl_dist = sl_distance.max(min_sl);
        let tp1_dist = tp1_distance.max(min_tp1);
        let tp2_dist = tp2_distance.max(min_tp2);

        let (stop_loss, take_profit_1, take_profit_2) = if side == "BUY" {
            (
                current_price - sl_dist,
                current_price + tp1_dist,
                current_price + tp2_dist,
            )
        } else {
            (
                current_price + sl_dist,
                current_price - tp1_dist,
                current_price - tp2_dist,
            )
        };

        // ── 9. Position sizing ───────────────────────────────────────────
        // floor((equity * riskPerTrade) / (entryPrice * stopLossPct), step).
        let balances = state.balances.read();
        let usdt_balance = balances
            .iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.free)
            .unwrap_or(equity);
        drop(balances);

        let stop_loss_pct = (sl_dist / current_price).max(f64::EPSILON);
        let mut quantity = state.risk_engine.size_position(equity, current_price, stop_loss_pct);
        if quantity <= 0.0 {
            // Fall back to the configured base allocation when the risk
            // formula collapses to zero (e.g. stop distance larger than
            // one risk unit covers).
            let position_value = usdt_balance * (params.base_position_pct / 100.0);
            quantity = if current_price > 0.0 {
                position_value / current_price
            } else {
                0.0
            };
        }

        if quantity <= 0.0 {
            let envelope = DecisionEnvelope::blocked(
                symbol, &side, strategy_name, "PositionSizing", "Computed quantity is zero",
            );
            return (envelope, None);
        }

        let position_value = quantity * current_price;

        // ── 9b. Risk entry veto: capital reserve ─────────────────────────
        if let Some(reason) = state.risk_engine.reserve_veto(equity, usdt_balance, position_value) {
            let envelope = DecisionEnvelope::blocked(symbol, &side, strategy_name, "RiskVeto", &reason);
            return (envelope, None);
        }

        // ── 9c. Risk entry veto: position-size cap ───────────────────────
        if let Some(reason) = state.risk_engine.position_size_veto(equity, position_value) {
            let envelope = DecisionEnvelope::blocked(symbol, &side, strategy_name, "RiskVeto", &reason);
            return (envelope, None);
        }

        // ── 9d. Risk entry veto: correlation limit ───────────────────────
        let candidate_returns = candle_buffer_log_returns(state, symbol);
        let open_positions = state.position_manager.get_open_positions();
        if !candidate_returns.is_empty() && !open_positions.is_empty() {
            let state_for_returns = state.clone();
            let correlation_block = state.risk_engine.correlation_veto(
                &candidate_returns,
                &open_positions,
                |other_symbol| {
                    let returns = candle_buffer_log_returns(&state_for_returns, other_symbol);
                    if returns.is_empty() {
                        None
                    } else {
                        Some(returns)
                    }
                },
            );
            if let Some(reason) = correlation_block {
                let envelope = DecisionEnvelope::blocked(symbol, &side, strategy_name, "RiskVeto", &reason);
                return (envelope, None);
            }
        }

        // ── 10. Build proposal ───────────────────────────────────────────
        let proposal = TradeProposal {
            symbol: symbol.to_string(),
            side: side.clone(),
            entry_price: current_price,
            quantity,
            stop_loss,
            take_profit_1,
            take_profit_2,
            confidence: scoring.total_score.abs(),
            regime: regime_label.clone(),
            score: scoring.total_score,
        };

        let mut envelope = DecisionEnvelope::allow(symbol, &side, strategy_name);
        envelope.reason = Some(format!(
            "Score {:.3} | Regime {} | ATR {:.4} | SL {:.2} | TP1 {:.2} | TP2 {:.2}",
            scoring.total_score, regime_label, atr, stop_loss, take_profit_1, take_profit_2
        ));

        info!(
            symbol,
            side = %side,
            score = scoring.total_score,
            regime = %regime_label,
            atr,
            stop_loss,
            take_profit_1,
            take_profit_2,
            quantity,
            "trade proposal generated"
        );

        (envelope, Some(proposal))
    }
}
