// =============================================================================
// Order Guard — duplicate-order cooldown and bracket feasibility validation
// =============================================================================
//
// Keyed by `(symbol, side)`, a sliding-window set rejects a second accepted
// order within `cooldown` of the last one. Also validates the basic order
// shape (positive quantity, consistent stop/limit ordering, whole-share
// bracket feasibility) before anything reaches the brokerage gateway. On
// reject, returns a typed reason; it never panics.
//
// Mirrors the gate-chain shape of `trade_insurance.rs` — every check must
// pass or the order is blocked — backed by `binance/rate_limit.rs`'s atomic
// counter style for the cooldown clock itself.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::debug;

/// Default cooldown between accepted orders for the same `(symbol, side)`.
pub const DEFAULT_COOLDOWN_SECS: u64 = 5;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Tracks the last-accepted timestamp per `(symbol, side)` key.
pub struct OrderGuard {
    cooldown_secs: u64,
    last_accepted: RwLock<HashMap<(String, String), AtomicU64>>,
}

impl OrderGuard {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            cooldown_secs,
            last_accepted: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and, if accepted, record the order against its cooldown
    /// window. Returns `None` if the order may proceed, or `Some(reason)` if
    /// it was rejected.
    pub fn check(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        stop_price: Option<f64>,
        limit_price: Option<f64>,
        is_bracket: bool,
    ) -> Option<String> {
        if quantity <= 0.0 {
            return Some(format!("invalid quantity {quantity} — must be positive"));
        }

        if let (Some(stop), Some(limit)) = (stop_price, limit_price) {
            let consistent = match side {
                "BUY" => stop < limit,
                "SELL" => stop > limit,
                _ => true,
            };
            if !consistent {
                return Some(format!(
                    "inconsistent stop/limit for {side}: stop={stop} limit={limit}"
                ));
            }
        }

        if is_bracket && quantity.fract().abs() > 1e-9 {
            return Some(format!(
                "fractional quantity {quantity} cannot carry a bracket order"
            ));
        }

        let key = (symbol.to_string(), side.to_string());
        let now = now_secs();

        {
            let map = self.last_accepted.read();
            if let Some(last) = map.get(&key) {
                let elapsed = now.saturating_sub(last.load(Ordering::SeqCst));
                if elapsed < self.cooldown_secs {
                    debug!(
                        symbol,
                        side,
                        elapsed,
                        cooldown = self.cooldown_secs,
                        "order rejected — within de-dup cooldown window"
                    );
                    return Some(format!(
                        "duplicate order for {symbol}/{side} within {}s cooldown ({elapsed}s elapsed)",
                        self.cooldown_secs
                    ));
                }
            }
        }

        // Accepted — record (or insert) the acceptance timestamp.
        {
            let map = self.last_accepted.read();
            if let Some(last) = map.get(&key) {
                last.store(now, Ordering::SeqCst);
                return None;
            }
        }
        self.last_accepted
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(now))
            .store(now, Ordering::SeqCst);
        None
    }
}

impl Default for OrderGuard {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_quantity() {
        let guard = OrderGuard::new(5);
        assert!(guard.check("BTCUSDT", "BUY", 0.0, None, None, false).is_some());
        assert!(guard.check("BTCUSDT", "BUY", -1.0, None, None, false).is_some());
    }

    #[test]
    fn rejects_inconsistent_stop_limit_for_buy() {
        let guard = OrderGuard::new(5);
        // Buy-stop-limit requires stop < limit.
        let rejection = guard.check("BTCUSDT", "BUY", 1.0, Some(105.0), Some(100.0), false);
        assert!(rejection.is_some());
    }

    #[test]
    fn rejects_fractional_bracket() {
        let guard = OrderGuard::new(5);
        let rejection = guard.check("BTCUSDT", "BUY", 0.73, None, None, true);
        assert!(rejection.is_some());
    }

    #[test]
    fn second_order_within_cooldown_is_rejected() {
        let guard = OrderGuard::new(5);
        assert!(guard.check("ETHUSDT", "SELL", 1.0, None, None, false).is_none());
        let rejection = guard.check("ETHUSDT", "SELL", 1.0, None, None, false);
        assert!(rejection.is_some());
    }

    #[test]
    fn different_symbol_or_side_is_independent() {
        let guard = OrderGuard::new(5);
        assert!(guard.check("ETHUSDT", "SELL", 1.0, None, None, false).is_none());
        assert!(guard.check("ETHUSDT", "BUY", 1.0, None, None, false).is_none());
        assert!(guard.check("BTCUSDT", "SELL", 1.0, None, None, false).is_none());
    }
}
