// =============================================================================
// Backtest — bar-replay simulation over historical daily candles
// =============================================================================
//
// Not a live trading path. Runs a single long-only RSI(14) strategy against
// cached daily candles for one symbol over a synthetic clock, bounded to
// `[5, 365]` days. Reuses the same sizing/PnL shape as the live position
// lifecycle (entry, stop-loss, take-profit, fractional quantity) without
// touching the broker, risk engine, or watchlist.

use serde::{Deserialize, Serialize};

use crate::indicators::rsi::calculate_rsi;
use crate::indicators::stats::standard_deviation;
use crate::market_data::candle_buffer::{CandleBuffer, CandleKey};

pub const MIN_DAYS: u32 = 5;
pub const MAX_DAYS: u32 = 365;

#[derive(Debug, Deserialize)]
pub struct BacktestRequest {
    pub symbol: String,
    pub days: u32,
    pub capital: f64,
    #[serde(rename = "takeProfitPct")]
    pub take_profit_pct: f64,
    #[serde(rename = "stopLossPct")]
    pub stop_loss_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestTrade {
    pub entry_time: i64,
    pub exit_time: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub exit_reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub days: u32,
    pub initial_capital: f64,
    pub final_value: f64,
    pub total_return_pct: f64,
    pub sharpe: f64,
    pub max_drawdown_pct: f64,
    pub win_rate: f64,
    pub trade_count: usize,
    pub trades: Vec<BacktestTrade>,
    pub equity_curve: Vec<f64>,
}

#[derive(Debug)]
pub struct BacktestError(pub String);

impl std::fmt::Display for BacktestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const RSI_PERIOD: usize = 14;
const RSI_OVERSOLD: f64 = 30.0;

/// Replay `req.days` of daily candles for `req.symbol` through a long-only
/// RSI(14) mean-reversion strategy: enter on oversold, exit on take-profit,
/// stop-loss, or end of data.
pub fn run(candle_buffer: &CandleBuffer, req: &BacktestRequest) -> Result<BacktestResult, BacktestError> {
    let days = req.days.clamp(MIN_DAYS, MAX_DAYS);
    if req.capital <= 0.0 {
        return Err(BacktestError("capital must be positive".to_string()));
    }

    let key = CandleKey {
        symbol: req.symbol.clone(),
        interval: "1d".to_string(),
    };
    // Pull extra lookback so the RSI warm-up period doesn't eat into the
    // requested backtest window.
    let candles = candle_buffer.get_closed_candles(&key, days as usize + RSI_PERIOD + 1);
    if candles.len() < RSI_PERIOD + 2 {
        return Err(BacktestError(format!(
            "insufficient history for {}: need at least {} closed daily candles, have {}",
            req.symbol,
            RSI_PERIOD + 2,
            candles.len()
        )));
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let rsi_series = calculate_rsi(&closes, RSI_PERIOD);
    // rsi_series[i] corresponds to closes[i + RSI_PERIOD].
    let offset = RSI_PERIOD;

    let mut cash = req.capital;
    let mut position: Option<(f64, f64, i64)> = None; // (qty, entry_price, entry_time)
    let mut trades: Vec<BacktestTrade> = Vec::new();
    let mut equity_curve: Vec<f64> = Vec::with_capacity(rsi_series.len());
    let mut peak_equity = req.capital;
    let mut max_drawdown_pct: f64 = 0.0;

    for (i, &rsi) in rsi_series.iter().enumerate() {
        let candle_idx = i + offset;
        if candle_idx >= candles.len() {
            break;
        }
        let candle = &candles[candle_idx];
        let price = candle.close;

        if let Some((qty, entry_price, entry_time)) = position {
            let tp_price = entry_price * (1.0 + req.take_profit_pct / 100.0);
            let sl_price = entry_price * (1.0 - req.stop_loss_pct / 100.0);

            let exit = if candle.high >= tp_price {
                Some((tp_price, "TakeProfit"))
            } else if candle.low <= sl_price {
                Some((sl_price, "StopLoss"))
            } else {
                None
            };

            if let Some((exit_price, reason)) = exit {
                let pnl = (exit_price - entry_price) * qty;
                cash += qty * exit_price;
                trades.push(BacktestTrade {
                    entry_time,
                    exit_time: candle.close_time,
                    entry_price,
                    exit_price,
                    quantity: qty,
                    pnl,
                    exit_reason: reason,
                });
                position = None;
            }
        } else if rsi < RSI_OVERSOLD && cash > 0.0 {
            let qty = cash / price;
            position = Some((qty, price, candle.close_time));
            cash = 0.0;
        }

        let mark_to_market = match position {
            Some((qty, _, _)) => cash + qty * price,
            None => cash,
        };
        equity_curve.push(mark_to_market);

        if mark_to_market > peak_equity {
            peak_equity = mark_to_market;
        }
        let drawdown = (peak_equity - mark_to_market) / peak_equity * 100.0;
        if drawdown > max_drawdown_pct {
            max_drawdown_pct = drawdown;
        }
    }

    // Liquidate any still-open position at the last observed close.
    if let Some((qty, entry_price, entry_time)) = position {
        let last = candles.last().expect("checked non-empty above");
        let pnl = (last.close - entry_price) * qty;
        let final_cash = qty * last.close;
        trades.push(BacktestTrade {
            entry_time,
            exit_time: last.close_time,
            entry_price,
            exit_price: last.close,
            quantity: qty,
            pnl,
            exit_reason: "EndOfData",
        });
        if let Some(last_equity) = equity_curve.last_mut() {
            *last_equity = final_cash;
        }
    }

    let final_value = equity_curve.last().copied().unwrap_or(req.capital);
    let total_return_pct = (final_value - req.capital) / req.capital * 100.0;

    let daily_returns: Vec<f64> = equity_curve
        .windows(2)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    let sharpe = sharpe_ratio(&daily_returns);

    let winning = trades.iter().filter(|t| t.pnl > 0.0).count();
    let win_rate = if trades.is_empty() {
        0.0
    } else {
        winning as f64 / trades.len() as f64
    };

    Ok(BacktestResult {
        symbol: req.symbol.clone(),
        days,
        initial_capital: req.capital,
        final_value,
        total_return_pct,
        sharpe,
        max_drawdown_pct,
        win_rate,
        trade_count: trades.len(),
        trades,
        equity_curve,
    })
}

/// Annualized Sharpe ratio (assuming 252 trading days, zero risk-free rate).
fn sharpe_ratio(daily_returns: &[f64]) -> f64 {
    if daily_returns.len() < 2 {
        return 0.0;
    }
    let mean = daily_returns.iter().sum::<f64>() / daily_returns.len() as f64;
    let stdev = match standard_deviation(daily_returns) {
        Some(s) if s > 0.0 => s,
        _ => return 0.0,
    };
    (mean / stdev) * (252.0_f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::candle_buffer::Candle;

    fn push_candle(buf: &CandleBuffer, key: &CandleKey, t: i64, close: f64, high: f64, low: f64) {
        buf.update(
            key.clone(),
            Candle {
                open_time: t - 86_400_000,
                close_time: t,
                open: close,
                high,
                low,
                close,
                volume: 100.0,
                quote_volume: 100.0 * close,
                trades_count: 10,
                taker_buy_volume: 50.0,
                taker_buy_quote_volume: 50.0 * close,
                is_closed: true,
            },
        );
    }

    #[test]
    fn insufficient_history_is_an_error() {
        let buf = CandleBuffer::new(1000);
        let req = BacktestRequest {
            symbol: "BTCUSDT".to_string(),
            days: 30,
            capital: 1000.0,
            take_profit_pct: 4.0,
            stop_loss_pct: 2.0,
        };
        assert!(run(&buf, &req).is_err());
    }

    #[test]
    fn days_parameter_is_clamped_into_range() {
        assert_eq!(0u32.clamp(MIN_DAYS, MAX_DAYS), MIN_DAYS);
        assert_eq!(9999u32.clamp(MIN_DAYS, MAX_DAYS), MAX_DAYS);
    }

    #[test]
    fn replay_produces_an_equity_curve_and_finite_result() {
        let buf = CandleBuffer::new(1000);
        let key = CandleKey {
            symbol: "BTCUSDT".to_string(),
            interval: "1d".to_string(),
        };
        let mut price = 100.0;
        for i in 0..60 {
            // Oscillate price so RSI dips below 30 at least once.
            price += if i % 5 == 0 { -8.0 } else { 1.5 };
            push_candle(
                &buf,
                &key,
                1_700_000_000_000 + i as i64 * 86_400_000,
                price,
                price + 2.0,
                price - 2.0,
            );
        }

        let req = BacktestRequest {
            symbol: "BTCUSDT".to_string(),
            days: 40,
            capital: 1000.0,
            take_profit_pct: 4.0,
            stop_loss_pct: 2.0,
        };
        let result = run(&buf, &req).expect("backtest should run with enough history");
        assert!(!result.equity_curve.is_empty());
        assert!(result.final_value.is_finite());
        assert!(result.sharpe.is_finite());
    }
}
