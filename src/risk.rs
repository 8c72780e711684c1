// =============================================================================
// Risk Engine — circuit breakers plus pre-trade sizing and veto rules
// =============================================================================
//
// Circuit breakers (checked by `can_trade`):
//   1. Daily Loss       — trips when cumulative daily PnL loss exceeds a
//                         percentage of starting capital.
//   2. Consecutive Losses — trips after N consecutive losing trades.
//   3. Max Drawdown      — trips when intra-day drawdown from peak equity
//                         exceeds the threshold.
//   4. Trade Limit       — trips when daily trade count reaches the cap.
//
// Entry veto rules (checked by `evaluate_entry`, ordered — first match wins):
//   1. Global drawdown halt — equity at or below peak·(1−maxDrawdown).
//   2. PDT guard — sub-$25k equity accounts capped at 3 day-trades per
//      rolling window.
//   3. Capital reserve — cash remaining after the position would fall below
//      the configured reserve fraction of equity.
//   4. Position-size cap — position value would exceed `maxPositionPct` of
//      equity.
//   5. Correlation limit — candidate symbol's recent returns are too highly
//      correlated with an existing open position.
//
// The engine automatically resets daily statistics when the date rolls over.
// The all-time peak equity and day-trade log are NOT reset on date rollover —
// only `reset_daily`'s intraday breaker statistics are.
// =============================================================================

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::indicators::stats::pearson_correlation;
use crate::position_engine::Position;
use crate::runtime_config::RiskParams;

/// Day-trade entries older than this are dropped from the rolling PDT
/// window. Five business days is approximated as seven calendar days.
const PDT_WINDOW_DAYS: i64 = 7;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Snapshot of a single circuit breaker for dashboard display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub name: String,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

/// Full snapshot of the risk engine's internal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub risk_mode: String,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub daily_pnl_pct: f64,
    #[serde(default)]
    pub remaining_daily_loss_pct: f64,
    #[serde(default)]
    pub consecutive_losses: u32,
    #[serde(default)]
    pub daily_trades_count: u32,
    #[serde(default)]
    pub daily_wins: u32,
    #[serde(default)]
    pub daily_losses: u32,
    #[serde(default)]
    pub max_drawdown_today: f64,
    #[serde(default)]
    pub peak_equity_today: f64,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerInfo>,
    #[serde(default)]
    pub current_date: String,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    risk_mode: String,
    daily_pnl: f64,
    consecutive_losses: u32,
    daily_trades_count: u32,
    daily_wins: u32,
    daily_losses: u32,
    max_drawdown_today: f64,
    peak_equity_today: f64,
    current_date: String,
    killed: bool,
    /// Cumulative realized PnL across the whole session, never reset by the
    /// daily rollover — feeds the persistent drawdown halt.
    all_time_pnl: f64,
    /// Highest equity ever observed, never reset by the daily rollover.
    peak_equity_all_time: f64,
    /// Epoch-millis timestamps of same-day round-trip closes, pruned to the
    /// PDT rolling window.
    day_trade_log: VecDeque<i64>,
}

// ---------------------------------------------------------------------------
// Risk Engine
// ---------------------------------------------------------------------------

/// Configuration limits supplied at construction time.
pub struct RiskEngine {
    state: RwLock<Inner>,
    /// Starting capital for the current session (used to compute percentages).
    capital: f64,
    /// Maximum daily loss allowed as a fraction (e.g. 0.03 = 3 %).
    max_daily_loss_pct: f64,
    /// Maximum consecutive losing trades before the breaker trips.
    max_consecutive_losses: u32,
    /// Maximum intra-day drawdown as a fraction.
    max_drawdown_pct: f64,
    /// Maximum number of trades per day.
    max_daily_trades: u32,
    /// PDT guard, reserve, sizing, and correlation parameters.
    risk_params: RiskParams,
}

impl RiskEngine {
    /// Create a new risk engine.
    ///
    /// # Arguments
    /// * `capital`              — Starting capital for percentage calculations.
    /// * `max_daily_loss_pct`   — e.g. 0.03 for 3 %.
    /// * `max_consecutive_losses` — e.g. 5.
    /// * `max_drawdown_pct`     — e.g. 0.05 for 5 %.
    /// * `max_daily_trades`     — e.g. 50.
    pub fn new(
        capital: f64,
        max_daily_loss_pct: f64,
        max_consecutive_losses: u32,
        max_drawdown_pct: f64,
        max_daily_trades: u32,
        risk_params: RiskParams,
    ) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            capital,
            max_daily_loss_pct,
            max_consecutive_losses,
            max_drawdown_pct,
            max_daily_trades,
            "RiskEngine initialised"
        );

        Self {
            state: RwLock::new(Inner {
                risk_mode: "Normal".to_string(),
                daily_pnl: 0.0,
                consecutive_losses: 0,
                daily_trades_count: 0,
                daily_wins: 0,
                daily_losses: 0,
                max_drawdown_today: 0.0,
                peak_equity_today: capital,
                current_date: today,
                killed: false,
                all_time_pnl: 0.0,
                peak_equity_all_time: capital,
                day_trade_log: VecDeque::new(),
            }),
            capital,
            max_daily_loss_pct,
            max_consecutive_losses,
            max_drawdown_pct,
            max_daily_trades,
            risk_params,
        }
    }

    // -------------------------------------------------------------------------
    // Trade recording
    // -------------------------------------------------------------------------

    /// Record the PnL of a completed trade and update all internal counters.
    pub fn record_trade_result(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        s.daily_pnl += pnl;
        s.daily_trades_count += 1;

        if pnl >= 0.0 {
            s.daily_wins += 1;
            s.consecutive_losses = 0;
        } else {
            s.daily_losses += 1;
            s.consecutive_losses += 1;
        }

        // Track peak equity and drawdown.
        let current_equity = self.capital + s.daily_pnl;
        if current_equity > s.peak_equity_today {
            s.peak_equity_today = current_equity;
        }
        let drawdown = if s.peak_equity_today > 0.0 {
            (s.peak_equity_today - current_equity) / s.peak_equity_today
        } else {
            0.0
        };
        if drawdown > s.max_drawdown_today {
            s.max_drawdown_today = drawdown;
        }

        // All-time equity tracking, independent of the daily reset.
        s.all_time_pnl += pnl;
        let all_time_equity = self.capital + s.all_time_pnl;
        if all_time_equity > s.peak_equity_all_time {
            s.peak_equity_all_time = all_time_equity;
        }

        // Update risk mode label.
        s.risk_mode = self.compute_risk_mode(&s);

        debug!(
            pnl,
            daily_pnl = s.daily_pnl,
            consecutive_losses = s.consecutive_losses,
            daily_trades = s.daily_trades_count,
            drawdown = s.max_drawdown_today,
            risk_mode = %s.risk_mode,
            "trade result recorded"
        );
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Check whether trading is currently allowed.
    ///
    /// Returns `(true, None)` if all breakers are clear, or `(false,
    /// Some(reason))` if a breaker has tripped.
    pub fn can_trade(&self) -> (bool, Option<String>) {
        self.maybe_reset_daily();
        let s = self.state.read();

        if s.killed {
            return (false, Some("Kill switch activated".to_string()));
        }

        // 1. Daily loss
        let daily_loss_pct = if self.capital > 0.0 {
            (-s.daily_pnl) / self.capital
        } else {
            0.0
        };
        if daily_loss_pct >= self.max_daily_loss_pct {
            let msg = format!(
                "Daily Loss breaker tripped: {:.2}% lost (limit {:.2}%)",
                daily_loss_pct * 100.0,
                self.max_daily_loss_pct * 100.0
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        // 2. Consecutive losses
        if s.consecutive_losses >= self.max_consecutive_losses {
            let msg = format!(
                "Consecutive Losses breaker tripped: {} consecutive losses (limit {})",
                s.consecutive_losses, self.max_consecutive_losses
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        // 3. Max drawdown
        if s.max_drawdown_today >= self.max_drawdown_pct {
            let msg = format!(
                "Max Drawdown breaker tripped: {:.2}% drawdown (limit {:.2}%)",
                s.max_drawdown_today * 100.0,
                self.max_drawdown_pct * 100.0
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        // 4. Trade limit
        if s.daily_trades_count >= self.max_daily_trades {
            let msg = format!(
                "Trade Limit breaker tripped: {} trades today (limit {})",
                s.daily_trades_count, self.max_daily_trades
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        (true, None)
    }

    /// Current all-time equity (starting capital plus cumulative realized PnL).
    pub fn current_equity(&self) -> f64 {
        let s = self.state.read();
        self.capital + s.all_time_pnl
    }

    // -------------------------------------------------------------------------
    // Position sizing
    // -------------------------------------------------------------------------

    /// `floor((equity * riskPerTrade) / (entryPrice * stopLossPct), step)`.
    /// `stop_loss_pct` and `risk_per_trade_pct` are fractions (e.g. 0.01 = 1%).
    pub fn size_position(&self, equity: f64, entry_price: f64, stop_loss_pct: f64) -> f64 {
        if equity <= 0.0 || entry_price <= 0.0 || stop_loss_pct <= 0.0 {
            return 0.0;
        }
        let risk_per_trade_pct = self.risk_params.risk_per_trade_pct / 100.0;
        let raw_qty = (equity * risk_per_trade_pct) / (entry_price * stop_loss_pct);
        let step = self.risk_params.sizing_step.max(f64::EPSILON);
        (raw_qty / step).floor() * step
    }

    // -------------------------------------------------------------------------
    // Entry veto rules (ordered — first match wins)
    // -------------------------------------------------------------------------

    /// Rule 1: refuse all new entries once equity has fallen to or below
    /// `peakEquity * (1 - maxDrawdown)`, until the peak is re-reached.
    pub fn drawdown_halt_active(&self) -> Option<String> {
        let s = self.state.read();
        let current_equity = self.capital + s.all_time_pnl;
        let floor = s.peak_equity_all_time * (1.0 - self.max_drawdown_pct);
        if current_equity <= floor {
            return Some(format!(
                "Drawdown halt: equity {:.2} <= peak {:.2} * (1 - {:.2}%)",
                current_equity,
                s.peak_equity_all_time,
                self.max_drawdown_pct * 100.0
            ));
        }
        None
    }

    /// Rule 2: sub-threshold equity accounts may not exceed the configured
    /// day-trade count within the rolling PDT window if the candidate sell
    /// would realize a same-day round trip.
    pub fn pdt_guard(&self, equity: f64, is_same_day_round_trip: bool) -> Option<String> {
        if !is_same_day_round_trip || equity >= self.risk_params.pdt_equity_threshold {
            return None;
        }
        let count = self.rolling_day_trade_count();
        if count >= self.risk_params.pdt_max_day_trades {
            return Some(format!(
                "PDT guard: {} day-trades in the rolling window (limit {}) on equity ${:.2} < ${:.2}",
                count, self.risk_params.pdt_max_day_trades, equity, self.risk_params.pdt_equity_threshold
            ));
        }
        None
    }

    /// Whether the account is currently at its rolling PDT day-trade limit
    /// (used by the exit engine's PDTPartial rule, independent of whether a
    /// same-day round trip is actually being proposed right now).
    pub fn pdt_at_limit(&self, equity: f64) -> bool {
        equity < self.risk_params.pdt_equity_threshold
            && self.rolling_day_trade_count() >= self.risk_params.pdt_max_day_trades
    }

    /// Capital reserve check: cash remaining after committing `position_value`
    /// must stay at or above `reservePct` of equity.
    pub fn reserve_veto(&self, equity: f64, cash: f64, position_value: f64) -> Option<String> {
        let reserve_floor = equity * (self.risk_params.reserve_pct / 100.0);
        let cash_after = cash - position_value;
        if cash_after < reserve_floor {
            return Some(format!(
                "Capital reserve breached: cash after {:.2} < reserve floor {:.2}",
                cash_after, reserve_floor
            ));
        }
        None
    }

    /// Position-size cap: `positionValue <= equity * maxPositionPct`.
    pub fn position_size_veto(&self, equity: f64, position_value: f64) -> Option<String> {
        let cap = equity * (self.risk_params.max_position_pct / 100.0);
        if position_value > cap {
            return Some(format!(
                "Position size {:.2} exceeds cap {:.2} ({:.1}% of equity)",
                position_value, cap, self.risk_params.max_position_pct
            ));
        }
        None
    }

    /// Correlation limit: refuse an entry whose recent returns correlate
    /// above `correlation_limit` with any existing open position's returns.
    pub fn correlation_veto(
        &self,
        candidate_returns: &[f64],
        open_positions: &[Position],
        returns_by_symbol: impl Fn(&str) -> Option<Vec<f64>>,
    ) -> Option<String> {
        for position in open_positions {
            let Some(other_returns) = returns_by_symbol(&position.symbol) else {
                continue;
            };
            if let Some(corr) = pearson_correlation(candidate_returns, &other_returns) {
                if corr.abs() > self.risk_params.correlation_limit {
                    return Some(format!(
                        "Correlation limit: {:.2} with open position {} exceeds {:.2}",
                        corr, position.symbol, self.risk_params.correlation_limit
                    ));
                }
            }
        }
        None
    }

    /// Record a same-day round-trip close for PDT tracking.
    pub fn record_day_trade(&self) {
        let mut s = self.state.write();
        let now = Utc::now().timestamp_millis();
        s.day_trade_log.push_back(now);
        Self::prune_day_trade_log(&mut s.day_trade_log, now);
    }

    fn rolling_day_trade_count(&self) -> u32 {
        let mut s = self.state.write();
        let now = Utc::now().timestamp_millis();
        Self::prune_day_trade_log(&mut s.day_trade_log, now);
        s.day_trade_log.len() as u32
    }

    fn prune_day_trade_log(log: &mut VecDeque<i64>, now_ms: i64) {
        let window_ms = PDT_WINDOW_DAYS * 24 * 60 * 60 * 1000;
        while let Some(&oldest) = log.front() {
            if now_ms - oldest > window_ms {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    // -------------------------------------------------------------------------
    // State snapshot
    // -------------------------------------------------------------------------

    /// Build a serialisable snapshot of the current risk state.
    pub fn get_state(&self) -> RiskState {
        self.maybe_reset_daily();
        let s = self.state.read();

        let daily_pnl_pct = if self.capital > 0.0 {
            (s.daily_pnl / self.capital) * 100.0
        } else {
            0.0
        };
        let remaining_daily_loss_pct = (self.max_daily_loss_pct * 100.0) - ((-s.daily_pnl / self.capital.max(1.0)) * 100.0);

        let breakers = self.build_circuit_breaker_info(&s);

        RiskState {
            risk_mode: s.risk_mode.clone(),
            daily_pnl: s.daily_pnl,
            daily_pnl_pct,
            remaining_daily_loss_pct: remaining_daily_loss_pct.max(0.0),
            consecutive_losses: s.consecutive_losses,
            daily_trades_count: s.daily_trades_count,
            daily_wins: s.daily_wins,
            daily_losses: s.daily_losses,
            max_drawdown_today: s.max_drawdown_today,
            peak_equity_today: s.peak_equity_today,
            circuit_breakers: breakers,
            current_date: s.current_date.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Daily reset
    // -------------------------------------------------------------------------

    /// Forcefully reset daily statistics (e.g. called by an admin endpoint).
    pub fn reset_daily(&self) {
        let mut s = self.state.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self::do_reset(&mut s, &today, self.capital);
        info!(date = %today, "daily risk counters reset (manual)");
    }

    /// Activate the kill switch — blocks all trading until manually cleared.
    pub fn kill(&self) {
        let mut s = self.state.write();
        s.killed = true;
        s.risk_mode = "KILLED".to_string();
        warn!("kill switch activated — all trading halted");
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// If the calendar date has changed since the last check, reset all daily
    /// counters automatically.
    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        // Date has changed — acquire write lock and reset.
        let mut s = self.state.write();
        // Double-check after acquiring write lock (another thread may have
        // already performed the reset).
        if s.current_date != today {
            info!(
                old_date = %s.current_date,
                new_date = %today,
                "date rolled — resetting daily risk counters"
            );
            Self::do_reset(&mut s, &today, self.capital);
        }
    }

    fn do_reset(s: &mut Inner, date: &str, capital: f64) {
        s.daily_pnl = 0.0;
        s.consecutive_losses = 0;
        s.daily_trades_count = 0;
        s.daily_wins = 0;
        s.daily_losses = 0;
        s.max_drawdown_today = 0.0;
        s.peak_equity_today = capital;
        s.current_date = date.to_string();
        s.risk_mode = if s.killed {
            "KILLED".to_string()
        } else {
            "Normal".to_string()
        };
    }

    fn compute_risk_mode(&self, s: &Inner) -> String {
        if s.killed {
            return "KILLED".to_string();
        }

        let daily_loss_pct = if self.capital > 0.0 {
            (-s.daily_pnl) / self.capital
        } else {
            0.0
        };

        if daily_loss_pct >= self.max_daily_loss_pct
            || s.consecutive_losses >= self.max_consecutive_losses
            || s.max_drawdown_today >= self.max_drawdown_pct
            || s.daily_trades_count >= self.max_daily_trades
        {
            "BREAKER_TRIPPED".to_string()
        } else if daily_loss_pct >= self.max_daily_loss_pct * 0.75
            || s.consecutive_losses as f64 >= self.max_consecutive_losses as f64 * 0.75
        {
            "Cautious".to_string()
        } else {
            "Normal".to_string()
        }
    }

    fn build_circuit_breaker_info(&self, s: &Inner) -> Vec<CircuitBreakerInfo> {
        let daily_loss_pct = if self.capital > 0.0 {
            ((-s.daily_pnl) / self.capital) * 100.0
        } else {
            0.0
        };

        vec![
            CircuitBreakerInfo {
                name: "Daily Loss".to_string(),
                current: daily_loss_pct.max(0.0),
                limit: self.max_daily_loss_pct * 100.0,
                tripped: daily_loss_pct >= self.max_daily_loss_pct * 100.0,
            },
            CircuitBreakerInfo {
                name: "Consecutive Losses".to_string(),
                current: s.consecutive_losses as f64,
                limit: self.max_consecutive_losses as f64,
                tripped: s.consecutive_losses >= self.max_consecutive_losses,
            },
            CircuitBreakerInfo {
                name: "Max Drawdown".to_string(),
                current: s.max_drawdown_today * 100.0,
                limit: self.max_drawdown_pct * 100.0,
                tripped: s.max_drawdown_today >= self.max_drawdown_pct,
            },
            CircuitBreakerInfo {
                name: "Trade Limit".to_string(),
                current: s.daily_trades_count as f64,
                limit: self.max_daily_trades as f64,
                tripped: s.daily_trades_count >= self.max_daily_trades,
            },
        ]
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("capital", &self.capital)
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .field("max_consecutive_losses", &self.max_consecutive_losses)
            .field("max_drawdown_pct", &self.max_drawdown_pct)
            .field("max_daily_trades", &self.max_daily_trades)
            .finish()
    }
}
