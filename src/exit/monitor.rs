// =============================================================================
// Exit Monitor Loop — stop/TP tightening + priority exit rule evaluation
// =============================================================================
//
// Runs as a background Tokio task, waking every 5 seconds to:
//   1. Iterate all open positions.
//   2. Let the triple-barrier and micro-trail modules tighten (never widen)
//      each position's working stop-loss.
//   3. Evaluate the strict-priority exit rule table (see `exit::rules`)
//      against the tightened position; the first rule that matches decides
//      the exit, full or partial.
//   4. Close (fully or partially) any position an exit rule fired for.
//   5. Log every exit with the triggering rule and reason.
//
// The monitor is designed to be spawned once at engine startup:
//
//   tokio::spawn(run_exit_monitor(
//       Arc::clone(&state),
//       barrier_states,
//       micro_trail_states,
//       exit_rule_states,
//   ));
//
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Timelike;
use parking_lot::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::exit::micro_trail::{MicroTrailState, OrderFlowContext};
use crate::exit::rules::{self, ExitContext, ExitDecision, PositionExitState};
use crate::exit::triple_barrier::BarrierState;
use crate::indicators::stats::{log_returns, standard_deviation};
use crate::market_data::CandleKey;

/// Interval at which the exit monitor evaluates open positions.
const MONITOR_INTERVAL_SECS: u64 = 5;

/// Shared barrier states keyed by position ID.
pub type BarrierStates = Arc<RwLock<HashMap<String, BarrierState>>>;

/// Shared micro-trail states keyed by position ID.
pub type MicroTrailStates = Arc<RwLock<HashMap<String, MicroTrailState>>>;

/// Shared priority-exit-rule bookkeeping, keyed by position ID.
pub type ExitRuleStates = Arc<RwLock<HashMap<String, PositionExitState>>>;

/// Create a new, empty barrier states map.
pub fn new_barrier_states() -> BarrierStates {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Create a new, empty micro-trail states map.
pub fn new_micro_trail_states() -> MicroTrailStates {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Create a new, empty exit-rule-state map.
pub fn new_exit_rule_states() -> ExitRuleStates {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Realized short-horizon volatility of a symbol's most recent 5m closes,
/// as a plain (non-annualized) percentage. `None` if there isn't enough
/// history yet.
fn short_horizon_vol_pct(state: &AppState, symbol: &str) -> f64 {
    let key = CandleKey {
        symbol: symbol.to_string(),
        interval: "5m".to_string(),
    };
    let closes = state.candle_buffer.get_closes(&key, 13);
    if closes.len() < 5 {
        return 0.0;
    }
    standard_deviation(&log_returns(&closes))
        .map(|sd| sd * 100.0)
        .unwrap_or(0.0)
}

/// Run the exit monitor loop. This function runs forever and should be spawned
/// as a background Tokio task.
///
/// # Arguments
///
/// * `state` — Shared application state (provides position manager, risk
///   engine, order flow data, and version tracking).
/// * `barriers` — Mutable map of barrier states, one per open position.
/// * `micro_trails` — Mutable map of micro-trail states, one per open position.
/// * `exit_rule_states` — Mutable map of priority-exit-rule bookkeeping
///   (fired partial levels, peak velocity), one per open position.
pub async fn run_exit_monitor(
    state: Arc<AppState>,
    barriers: BarrierStates,
    micro_trails: MicroTrailStates,
    exit_rule_states: ExitRuleStates,
) {
    info!(
        interval_secs = MONITOR_INTERVAL_SECS,
        "Exit monitor started (priority exit rules)"
    );

    let mut ticker = interval(Duration::from_secs(MONITOR_INTERVAL_SECS));

    loop {
        ticker.tick().await;

        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let open_positions = state.position_manager.get_open_positions();

        if open_positions.is_empty() {
            debug!("Exit monitor: no open positions");
            continue;
        }

        // Read feature flag + exit params once per tick.
        let micro_trail_enabled = state.runtime_config.read().enable_micro_trail;
        let exit_params = state.runtime_config.read().exit_params.clone();
        let eod_lock_active = chrono::Utc::now().hour() >= exit_params.eod_lock_hour_utc;
        let portfolio_position_count = open_positions.len();
        let pdt_equity = state.risk_engine.current_equity();
        let pdt_at_limit = state.risk_engine.pdt_at_limit(pdt_equity);

        debug!(
            count = open_positions.len(),
            micro_trail = micro_trail_enabled,
            "Exit monitor: evaluating positions"
        );

        // Collect positions to close (we cannot hold the various state locks
        // while calling close_position/partial_close, which also write to
        // AppState). Each entry is (position_id, opened_at, fraction, price, reason).
        let mut to_close: Vec<(String, String, f64, f64, String)> = Vec::new();

        {
            let mut barrier_map = barriers.write();
            let mut trail_map = micro_trails.write();
            let mut rule_state_map = exit_rule_states.write();

            for position in &open_positions {
                let current_price = position.current_price;
                if current_price <= 0.0 {
                    warn!(
                        id = %position.id,
                        symbol = %position.symbol,
                        price = current_price,
                        "Invalid current price — skipping exit evaluation"
                    );
                    continue;
                }

                // ── Stop/TP dynamic updates (§4.7) ───────────────────
                // Triple-barrier progressive tightening / breakeven / profit
                // lock and micro-trail both only *tighten* the working stop;
                // the actual exit decision comes from the priority rules
                // below, not from either module's own trigger.
                if let Some(barrier) = barrier_map.get_mut(&position.id) {
                    barrier.evaluate(current_price, now_secs);
                    state
                        .position_manager
                        .tighten_stop_loss(&position.id, barrier.current_sl_price);
                }

                if let Some(trail) = trail_map.get_mut(&position.id) {
                    let of_ctx = build_order_flow_context(&state, &position.symbol, trail);
                    let trail_hit = trail.evaluate(current_price, now_secs, &of_ctx);
                    if trail_hit && micro_trail_enabled {
                        state
                            .position_manager
                            .tighten_stop_loss(&position.id, trail.trail_price);
                    }
                }

                // ── Priority exit rule evaluation (strict, first match wins) ─
                let rule_state = rule_state_map
                    .entry(position.id.clone())
                    .or_insert_with(PositionExitState::default);

                // Re-read the position so rule 1 (StopLoss) sees any
                // tightening applied just above.
                let live_position = state
                    .position_manager
                    .get_open_positions()
                    .into_iter()
                    .find(|p| p.id == position.id)
                    .unwrap_or_else(|| position.clone());

                let ctx = ExitContext {
                    current_price,
                    short_horizon_vol_pct: short_horizon_vol_pct(&state, &position.symbol),
                    portfolio_position_count,
                    pdt_at_limit,
                    eod_lock_active,
                    now_secs: now_secs as i64,
                };

                let decision: ExitDecision =
                    rules::evaluate(&live_position, rule_state, &ctx, &exit_params);

                if decision.is_actionable() {
                    info!(
                        id = %position.id,
                        symbol = %position.symbol,
                        side = %position.side,
                        entry_price = position.entry_price,
                        exit_price = current_price,
                        rule = %decision.kind,
                        fraction = decision.quantity_fraction,
                        reason = %decision.reason,
                        "EXIT RULE TRIGGERED"
                    );
                    to_close.push((
                        position.id.clone(),
                        position.opened_at.clone(),
                        decision.quantity_fraction,
                        current_price,
                        format!("{}:{}", decision.kind, decision.reason),
                    ));
                } else {
                    debug!(
                        id = %position.id,
                        symbol = %position.symbol,
                        price = current_price,
                        "Exit rules: no trigger"
                    );
                }
            }
        }

        // Close (fully or partially) every position an exit rule fired for.
        for (position_id, opened_at, fraction, exit_price, reason) in to_close {
            let close_result = if fraction >= 1.0 {
                state.position_manager.close_position(&position_id, &reason, exit_price)
            } else {
                state
                    .position_manager
                    .partial_close(&position_id, fraction, &reason, exit_price)
            };

            match close_result {
                Some(realized_pnl) => {
                    info!(
                        id = %position_id,
                        pnl = realized_pnl,
                        reason = &reason,
                        "Position closed by exit monitor"
                    );

                    // Record the trade result in the risk engine.
                    state.risk_engine.record_trade_result(realized_pnl);

                    if fraction >= 1.0 {
                        // A position closed the same calendar day it was
                        // opened counts toward the rolling PDT day-trade
                        // window; partial closes leave the position (and its
                        // day-trade accounting) open.
                        if opened_at_is_today(&opened_at) {
                            state.risk_engine.record_day_trade();
                        }

                        barriers.write().remove(&position_id);
                        micro_trails.write().remove(&position_id);
                        exit_rule_states.write().remove(&position_id);
                    }

                    state.increment_version();
                }
                None => {
                    error!(
                        id = %position_id,
                        "Failed to close position — not found in position manager"
                    );
                }
            }
        }
    }
}

/// Whether an RFC3339 timestamp falls on the current UTC calendar date.
fn opened_at_is_today(opened_at: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(opened_at)
        .map(|dt| dt.date_naive() == chrono::Utc::now().date_naive())
        .unwrap_or(false)
}

/// Build an `OrderFlowContext` for the given symbol from AppState data.
fn build_order_flow_context(
    state: &AppState,
    symbol: &str,
    trail: &MicroTrailState,
) -> OrderFlowContext {
    let trade_procs = state.trade_processors.read();
    let proc = trade_procs.get(symbol);

    let cvd = proc.map(|p| p.cvd()).unwrap_or(0.0);
    let orderbook_imbalance = state
        .orderbook_manager
        .imbalance(symbol)
        .unwrap_or(0.0);

    let vpin = state
        .vpin_states
        .read()
        .get(symbol)
        .map(|v| v.vpin)
        .unwrap_or(0.0);

    OrderFlowContext {
        cvd,
        cvd_at_entry: trail.cvd_at_entry,
        orderbook_imbalance,
        vpin,
    }
}
