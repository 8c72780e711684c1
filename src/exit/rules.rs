// =============================================================================
// Priority Exit Rules — strict-priority exit decision engine
// =============================================================================
//
// Evaluated per open position, per tick, in strict priority order (first
// match wins): StopLoss, TakeProfit, PartialProfit, VolatilitySpike,
// TimeDecay, Correlation, PDTPartial, VelocityDrop, EODLock, QuickScalp.
//
// Pure with respect to its inputs (position, price, portfolio snapshot,
// per-position fired-level bookkeeping, clock). Does not place orders or
// mutate positions directly — callers act on the returned `ExitDecision`.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::position_engine::Position;
use crate::runtime_config::ExitParams;

/// Which priority rule produced an `ExitDecision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitRuleKind {
    None,
    StopLoss,
    TakeProfit,
    PartialProfit,
    VolatilitySpike,
    TimeDecay,
    Correlation,
    PDTPartial,
    VelocityDrop,
    EODLock,
    QuickScalp,
}

impl std::fmt::Display for ExitRuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::StopLoss => write!(f, "StopLoss"),
            Self::TakeProfit => write!(f, "TakeProfit"),
            Self::PartialProfit => write!(f, "PartialProfit"),
            Self::VolatilitySpike => write!(f, "VolatilitySpike"),
            Self::TimeDecay => write!(f, "TimeDecay"),
            Self::Correlation => write!(f, "Correlation"),
            Self::PDTPartial => write!(f, "PDTPartial"),
            Self::VelocityDrop => write!(f, "VelocityDrop"),
            Self::EODLock => write!(f, "EODLock"),
            Self::QuickScalp => write!(f, "QuickScalp"),
        }
    }
}

/// Outcome of one rule evaluation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitDecision {
    pub kind: ExitRuleKind,
    /// Fraction of the position's *remaining* quantity to close: 1.0 for a
    /// full exit, otherwise the partial fraction.
    pub quantity_fraction: f64,
    pub reason: String,
    pub expected_price: f64,
}

impl ExitDecision {
    fn none() -> Self {
        Self {
            kind: ExitRuleKind::None,
            quantity_fraction: 0.0,
            reason: String::new(),
            expected_price: 0.0,
        }
    }

    /// Whether this decision calls for closing any quantity at all.
    pub fn is_actionable(&self) -> bool {
        self.kind != ExitRuleKind::None && self.quantity_fraction > 0.0
    }
}

/// Per-position bookkeeping the rule engine needs across ticks: which
/// progress-based partial levels have already fired (each fires at most
/// once per position) and the peak profit velocity seen so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionExitState {
    pub partial_25_fired: bool,
    pub partial_50_fired: bool,
    pub partial_75_fired: bool,
    pub correlation_partial_fired: bool,
    pub pdt_partial_fired: bool,
    pub peak_profit_per_hour: f64,
}

/// Everything the rule engine needs about the wider world for a single
/// position's evaluation, beyond the position itself.
pub struct ExitContext {
    pub current_price: f64,
    /// Realized short-horizon volatility, as a percentage (e.g. 6.0 = 6%).
    pub short_horizon_vol_pct: f64,
    /// Number of currently open positions across the whole portfolio.
    pub portfolio_position_count: usize,
    /// Whether the account is at its rolling PDT day-trade limit.
    pub pdt_at_limit: bool,
    /// Whether the configured end-of-day lock window is currently active.
    pub eod_lock_active: bool,
    pub now_secs: i64,
}

fn position_profit_pct(position: &Position, current_price: f64) -> f64 {
    if position.entry_price <= 0.0 {
        return 0.0;
    }
    let direction = if position.side == "BUY" { 1.0 } else { -1.0 };
    direction * (current_price - position.entry_price) / position.entry_price * 100.0
}

fn held_hours(position: &Position, now_secs: i64) -> f64 {
    let opened_at_secs = chrono::DateTime::parse_from_rfc3339(&position.opened_at)
        .map(|dt| dt.timestamp())
        .unwrap_or(now_secs);
    (now_secs - opened_at_secs).max(0) as f64 / 3600.0
}

/// Evaluate the 10 priority exit rules for one position and return the
/// first one that matches, or `ExitDecision::none()` (via `kind == None`)
/// if none apply. May update `state`'s fired-level / peak-velocity
/// bookkeeping even when it ultimately returns `None`, since peak velocity
/// must track every tick to stay meaningful.
pub fn evaluate(
    position: &Position,
    state: &mut PositionExitState,
    ctx: &ExitContext,
    params: &ExitParams,
) -> ExitDecision {
    let is_long = position.side == "BUY";
    let price = ctx.current_price;
    let profit_pct = position_profit_pct(position, price);
    let profitable = profit_pct > 0.0;
    let hours = held_hours(position, ctx.now_secs);

    // 1. StopLoss
    let sl_hit = if is_long {
        price <= position.stop_loss
    } else {
        price >= position.stop_loss
    };
    if sl_hit {
        return ExitDecision {
            kind: ExitRuleKind::StopLoss,
            quantity_fraction: 1.0,
            reason: format!("price {:.4} through stop-loss {:.4}", price, position.stop_loss),
            expected_price: price,
        };
    }

    // 2. TakeProfit (final target, TP2)
    let tp_hit = if is_long {
        price >= position.take_profit_2
    } else {
        price <= position.take_profit_2
    };
    if tp_hit {
        return ExitDecision {
            kind: ExitRuleKind::TakeProfit,
            quantity_fraction: 1.0,
            reason: format!("price {:.4} through take-profit {:.4}", price, position.take_profit_2),
            expected_price: price,
        };
    }

    // 3. PartialProfit: progress toward TP2 crossing 25/50/75%, each level
    // fires at most once, higher levels checked first since they imply the
    // lower ones already happened on a fast-moving tick.
    let tp_distance = (position.take_profit_2 - position.entry_price).abs();
    if tp_distance > 0.0 {
        let progress = if is_long {
            (price - position.entry_price) / tp_distance
        } else {
            (position.entry_price - price) / tp_distance
        };
        if progress >= 0.75 && !state.partial_75_fired {
            state.partial_75_fired = true;
            return ExitDecision {
                kind: ExitRuleKind::PartialProfit,
                quantity_fraction: 0.5,
                reason: "75% progress to take-profit".to_string(),
                expected_price: price,
            };
        }
        if progress >= 0.50 && !state.partial_50_fired {
            state.partial_50_fired = true;
            return ExitDecision {
                kind: ExitRuleKind::PartialProfit,
                quantity_fraction: 0.5,
                reason: "50% progress to take-profit".to_string(),
                expected_price: price,
            };
        }
        if progress >= 0.25 && !state.partial_25_fired {
            state.partial_25_fired = true;
            return ExitDecision {
                kind: ExitRuleKind::PartialProfit,
                quantity_fraction: 1.0 / 3.0,
                reason: "25% progress to take-profit".to_string(),
                expected_price: price,
            };
        }
    }

    // 4. VolatilitySpike
    if ctx.short_horizon_vol_pct > 5.0 && profitable {
        return ExitDecision {
            kind: ExitRuleKind::VolatilitySpike,
            quantity_fraction: 1.0,
            reason: format!(
                "short-horizon vol {:.2}% > 5% while profitable",
                ctx.short_horizon_vol_pct
            ),
            expected_price: price,
        };
    }

    // 5. TimeDecay
    if hours >= params.max_hold_hours && !profitable {
        return ExitDecision {
            kind: ExitRuleKind::TimeDecay,
            quantity_fraction: 1.0,
            reason: format!(
                "held {:.1}h >= max hold {:.1}h and unprofitable",
                hours, params.max_hold_hours
            ),
            expected_price: price,
        };
    }
    if hours >= 2.0 * params.max_hold_hours && profit_pct.abs() < 0.5 {
        return ExitDecision {
            kind: ExitRuleKind::TimeDecay,
            quantity_fraction: 1.0,
            reason: format!(
                "held {:.1}h >= 2x max hold and flat ({:.2}%)",
                hours, profit_pct
            ),
            expected_price: price,
        };
    }

    // 6. Correlation (portfolio too concentrated, take some profit off)
    if ctx.portfolio_position_count > params.max_correlated_positions as usize
        && profit_pct > 2.0
        && !state.correlation_partial_fired
    {
        state.correlation_partial_fired = true;
        return ExitDecision {
            kind: ExitRuleKind::Correlation,
            quantity_fraction: 0.5,
            reason: format!(
                "{} open positions > max correlated {}",
                ctx.portfolio_position_count, params.max_correlated_positions
            ),
            expected_price: price,
        };
    }

    // 7. PDTPartial
    if ctx.pdt_at_limit && profit_pct >= 0.5 && !state.pdt_partial_fired {
        state.pdt_partial_fired = true;
        return ExitDecision {
            kind: ExitRuleKind::PDTPartial,
            quantity_fraction: params.pdt_partial_fraction,
            reason: "PDT day-trade limit reached, taking intraday profit".to_string(),
            expected_price: price,
        };
    }

    // 8. VelocityDrop — track peak profit-per-hour even on ticks that don't
    // trigger, since the peak must be monotonic to mean anything later.
    let profit_per_hour = if hours > 0.0 { profit_pct / hours } else { 0.0 };
    if profit_per_hour > state.peak_profit_per_hour {
        state.peak_profit_per_hour = profit_per_hour;
    }
    if state.peak_profit_per_hour > 0.0
        && profit_pct > params.min_velocity_profit_pct
        && profit_per_hour < (1.0 - params.velocity_drop_threshold) * state.peak_profit_per_hour
    {
        return ExitDecision {
            kind: ExitRuleKind::VelocityDrop,
            quantity_fraction: 1.0,
            reason: format!(
                "velocity {:.3}%/h fell below {:.0}% of peak {:.3}%/h",
                profit_per_hour,
                (1.0 - params.velocity_drop_threshold) * 100.0,
                state.peak_profit_per_hour
            ),
            expected_price: price,
        };
    }

    // 9. EODLock
    if ctx.eod_lock_active && profitable && hours < params.min_hold_hours {
        return ExitDecision {
            kind: ExitRuleKind::EODLock,
            quantity_fraction: 1.0,
            reason: format!(
                "end-of-day lock, profitable, held {:.2}h < min hold {:.2}h",
                hours, params.min_hold_hours
            ),
            expected_price: price,
        };
    }

    // 10. QuickScalp
    let held_minutes = hours * 60.0;
    if profit_pct >= 1.0 && held_minutes <= 30.0 {
        return ExitDecision {
            kind: ExitRuleKind::QuickScalp,
            quantity_fraction: 0.75,
            reason: format!("profit {:.2}% >= 1.0% within 30 minutes", profit_pct),
            expected_price: price,
        };
    }
    if profit_pct >= 0.5 && held_minutes <= 15.0 {
        return ExitDecision {
            kind: ExitRuleKind::QuickScalp,
            quantity_fraction: 0.5,
            reason: format!("profit {:.2}% >= 0.5% within 15 minutes", profit_pct),
            expected_price: price,
        };
    }

    ExitDecision::none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position_engine::PositionStatus;

    fn base_position(entry: f64, side: &str, opened_secs_ago: i64) -> Position {
        let opened_at = (chrono::Utc::now() - chrono::Duration::seconds(opened_secs_ago)).to_rfc3339();
        Position {
            id: "pos-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: side.to_string(),
            entry_price: entry,
            quantity: 1.0,
            current_price: entry,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            stop_loss: entry * 0.98,
            take_profit_1: entry * 1.02,
            take_profit_2: entry * 1.04,
            trailing_stop: None,
            highest_price: entry,
            status: PositionStatus::Open,
            opened_at,
            closed_at: None,
            close_reason: None,
            realized_pnl: 0.0,
        }
    }

    fn ctx(price: f64, now_secs: i64) -> ExitContext {
        ExitContext {
            current_price: price,
            short_horizon_vol_pct: 1.0,
            portfolio_position_count: 1,
            pdt_at_limit: false,
            eod_lock_active: false,
            now_secs,
        }
    }

    #[test]
    fn stop_loss_wins_over_everything() {
        let position = base_position(100.0, "BUY", 10);
        let mut state = PositionExitState::default();
        let params = ExitParams::default();
        let now = chrono::Utc::now().timestamp();

        let decision = evaluate(&position, &mut state, &ctx(97.0, now), &params);
        assert_eq!(decision.kind, ExitRuleKind::StopLoss);
        assert_eq!(decision.quantity_fraction, 1.0);
    }

    #[test]
    fn take_profit_fires_at_tp2() {
        let position = base_position(100.0, "BUY", 10);
        let mut state = PositionExitState::default();
        let params = ExitParams::default();
        let now = chrono::Utc::now().timestamp();

        let decision = evaluate(&position, &mut state, &ctx(105.0, now), &params);
        assert_eq!(decision.kind, ExitRuleKind::TakeProfit);
    }

    #[test]
    fn partial_profit_fires_once_per_level() {
        let position = base_position(100.0, "BUY", 10);
        let mut state = PositionExitState::default();
        let params = ExitParams::default();
        let now = chrono::Utc::now().timestamp();

        // 25% progress toward TP2 (entry 100, TP2 104 => 1.0 price move).
        let first = evaluate(&position, &mut state, &ctx(101.0, now), &params);
        assert_eq!(first.kind, ExitRuleKind::PartialProfit);
        assert!(state.partial_25_fired);

        // Same progress again should not re-fire the 25% level.
        let second = evaluate(&position, &mut state, &ctx(101.0, now), &params);
        assert_eq!(second.kind, ExitRuleKind::None);
    }

    #[test]
    fn volatility_spike_requires_profitability() {
        let position = base_position(100.0, "BUY", 10);
        let mut state = PositionExitState::default();
        let params = ExitParams::default();
        let now = chrono::Utc::now().timestamp();

        let mut hot_ctx = ctx(99.0, now);
        hot_ctx.short_horizon_vol_pct = 8.0;
        let decision = evaluate(&position, &mut state, &hot_ctx, &params);
        assert_eq!(decision.kind, ExitRuleKind::None, "unprofitable position should not spike-exit");
    }

    #[test]
    fn time_decay_on_unprofitable_stale_position() {
        let position = base_position(100.0, "BUY", 25 * 3600);
        let mut state = PositionExitState::default();
        let params = ExitParams::default();
        let now = chrono::Utc::now().timestamp();

        let decision = evaluate(&position, &mut state, &ctx(99.5, now), &params);
        assert_eq!(decision.kind, ExitRuleKind::TimeDecay);
    }

    #[test]
    fn quick_scalp_within_fifteen_minutes() {
        let position = base_position(100.0, "BUY", 5 * 60);
        let mut state = PositionExitState::default();
        let params = ExitParams::default();
        let now = chrono::Utc::now().timestamp();

        let decision = evaluate(&position, &mut state, &ctx(100.6, now), &params);
        assert_eq!(decision.kind, ExitRuleKind::QuickScalp);
        assert_eq!(decision.quantity_fraction, 0.5);
    }

    #[test]
    fn no_rule_fires_in_the_quiet_middle() {
        let position = base_position(100.0, "BUY", 3600);
        let mut state = PositionExitState::default();
        let params = ExitParams::default();
        let now = chrono::Utc::now().timestamp();

        let decision = evaluate(&position, &mut state, &ctx(100.2, now), &params);
        assert_eq!(decision.kind, ExitRuleKind::None);
    }
}
