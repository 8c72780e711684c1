// =============================================================================
// Emergency Protocol — kill switch and full position flatten
// =============================================================================
//
// Triggered by the heartbeat monitor on a component timeout, or directly via
// the `POST /api/v1/control/panic` control-surface endpoint. Idempotent: once
// armed -> triggered, a second `trigger()` call is a no-op that reports the
// original reason, matching `reconcile.rs`'s warn-don't-correct posture
// (emergency flatten issues real closing orders, but it never re-fires once
// tripped).
//
// On trigger: cancel every open exchange order, then issue a closing order
// (opposite side, market) for every internally tracked open position via the
// same demo/live dispatch `execution.rs` uses, recording a per-position
// outcome regardless of individual failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::binance::client::BinanceClient;
use crate::position_engine::PositionManager;
use crate::types::{AccountMode, EmergencyResult, VenueFlattenOutcome};

const VENUE: &str = "binance";

/// Coordinates the one-shot kill switch.
pub struct EmergencyProtocol {
    client: Arc<BinanceClient>,
    position_manager: Arc<PositionManager>,
    triggered: AtomicBool,
    last_result: RwLock<Option<EmergencyResult>>,
}

impl EmergencyProtocol {
    pub fn new(client: Arc<BinanceClient>, position_manager: Arc<PositionManager>) -> Arc<Self> {
        Arc::new(Self {
            client,
            position_manager,
            triggered: AtomicBool::new(false),
            last_result: RwLock::new(None),
        })
    }

    /// Whether the protocol has already fired and not yet been reset.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Fire the emergency stop. Idempotent — a second call while already
    /// triggered returns the result of the *original* trigger unchanged and
    /// issues no further orders.
    pub async fn trigger(&self, reason: &str, account_mode: AccountMode) -> EmergencyResult {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(reason, "emergency already triggered -- ignoring duplicate trigger");
            return self
                .last_result
                .read()
                .clone()
                .unwrap_or_else(|| EmergencyResult {
                    status: "ALREADY_TRIGGERED".to_string(),
                    reason: reason.to_string(),
                    timestamp: Utc::now().to_rfc3339(),
                    per_venue: Vec::new(),
                });
        }

        error!(reason, "EMERGENCY PROTOCOL TRIGGERED -- flattening all positions");

        if account_mode == AccountMode::Live {
            self.cancel_all_orders().await;
        }

        let outcomes = self.flatten_all_positions(account_mode).await;

        let result = EmergencyResult {
            status: "TRIGGERED".to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            per_venue: outcomes,
        };

        *self.last_result.write() = Some(result.clone());
        result
    }

    /// Clear the triggered latch, allowing a fresh `trigger()` to fire again.
    /// Does not reopen positions; an operator calls this only after manually
    /// confirming the account is in a safe state.
    pub fn reset(&self) {
        self.triggered.store(false, Ordering::SeqCst);
        *self.last_result.write() = None;
        info!("emergency protocol reset -- entries may resume once unpaused");
    }

    async fn cancel_all_orders(&self) {
        match self.client.get_open_orders(None).await {
            Ok(orders) => {
                for order in &orders {
                    let symbol = order["symbol"].as_str().unwrap_or("").to_string();
                    let order_id = order.get("orderId").and_then(|v| v.as_u64()).unwrap_or(0);
                    if symbol.is_empty() || order_id == 0 {
                        continue;
                    }
                    if let Err(e) = self.client.cancel_order(&symbol, order_id).await {
                        warn!(symbol = %symbol, order_id, error = %e, "failed to cancel order during emergency stop");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch open orders during emergency stop");
            }
        }
    }

    async fn flatten_all_positions(&self, account_mode: AccountMode) -> Vec<VenueFlattenOutcome> {
        let positions = self.position_manager.get_open_positions();
        let mut outcomes = Vec::with_capacity(positions.len());

        for pos in positions {
            let closing_side = if pos.side == "BUY" { "SELL" } else { "BUY" };

            let outcome = if account_mode == AccountMode::Demo {
                self.position_manager
                    .close_position(&pos.id, "EmergencyStop", pos.current_price);
                VenueFlattenOutcome {
                    symbol: pos.symbol.clone(),
                    qty: pos.quantity,
                    venue: VENUE.to_string(),
                    status: "SIMULATED_CLOSE".to_string(),
                    error: None,
                }
            } else {
                match self
                    .client
                    .place_order(&pos.symbol, closing_side, "MARKET", pos.quantity, None, None, None)
                    .await
                {
                    Ok(_) => {
                        self.position_manager
                            .close_position(&pos.id, "EmergencyStop", pos.current_price);
                        VenueFlattenOutcome {
                            symbol: pos.symbol.clone(),
                            qty: pos.quantity,
                            venue: VENUE.to_string(),
                            status: "CLOSED".to_string(),
                            error: None,
                        }
                    }
                    Err(e) => {
                        error!(symbol = %pos.symbol, error = %e, "failed to flatten position during emergency stop");
                        VenueFlattenOutcome {
                            symbol: pos.symbol.clone(),
                            qty: pos.quantity,
                            venue: VENUE.to_string(),
                            status: "FAILED".to_string(),
                            error: Some(e.to_string()),
                        }
                    }
                }
            };

            outcomes.push(outcome);
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::client::BinanceClient;

    fn demo_client() -> Arc<BinanceClient> {
        Arc::new(BinanceClient::new("key", "secret"))
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let manager = Arc::new(PositionManager::new());
        manager.open_position("BTCUSDT", "BUY", 100.0, 1.0, 90.0, 110.0, 120.0);
        let protocol = EmergencyProtocol::new(demo_client(), manager.clone());

        let first = protocol.trigger("heartbeat timeout", AccountMode::Demo).await;
        assert_eq!(first.status, "TRIGGERED");
        assert_eq!(first.per_venue.len(), 1);
        assert!(manager.get_open_positions().is_empty());

        let second = protocol.trigger("different reason", AccountMode::Demo).await;
        assert_eq!(second.reason, "heartbeat timeout");
    }

    #[tokio::test]
    async fn reset_allows_retrigger() {
        let manager = Arc::new(PositionManager::new());
        let protocol = EmergencyProtocol::new(demo_client(), manager);

        protocol.trigger("first", AccountMode::Demo).await;
        assert!(protocol.is_triggered());

        protocol.reset();
        assert!(!protocol.is_triggered());

        let again = protocol.trigger("second", AccountMode::Demo).await;
        assert_eq!(again.reason, "second");
    }

    #[tokio::test]
    async fn flatten_with_no_positions_is_empty() {
        let manager = Arc::new(PositionManager::new());
        let protocol = EmergencyProtocol::new(demo_client(), manager);
        let result = protocol.trigger("no positions", AccountMode::Demo).await;
        assert!(result.per_venue.is_empty());
    }
}
