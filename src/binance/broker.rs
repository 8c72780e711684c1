// =============================================================================
// Broker trait — typed, idempotent, resilient venue operations
// =============================================================================
//
// Generalizes `BinanceClient` behind a venue-agnostic interface so the rest
// of the engine (execution, reconciliation, emergency flatten) depends on
// typed operations and typed errors instead of a concrete REST client and
// `anyhow::Error` strings. `BinanceBroker` is the only implementation today;
// it wraps a `BinanceClient` with the resilience chain (rate limiter, retry,
// circuit breaker) from `binance::resilience`.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::binance::client::BinanceClient;
use crate::binance::resilience::ResilienceChain;
use crate::market_data::Candle;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Category of brokerage failure. Only `TransientNetwork` and `RateLimited`
/// are retried; `CircuitOpen` and `VenueReject` are surfaced immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerErrorKind {
    TransientNetwork,
    RateLimited,
    CircuitOpen,
    VenueReject,
}

impl BrokerErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientNetwork | Self::RateLimited)
    }
}

/// A typed brokerage failure. Every external error is converted to this at
/// the broker boundary; nothing above it should see a raw `anyhow::Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BrokerError {}

/// Classify an `anyhow::Error` surfaced by `BinanceClient` into a typed
/// kind. Client-error HTTP statuses (4xx) embedded in the message by
/// `client.rs`'s `bail!` calls are treated as non-retryable venue rejections;
/// everything else (timeouts, transport failures, 5xx) is transient.
fn classify_binance_error(err: &anyhow::Error) -> BrokerError {
    let message = err.to_string();
    let is_client_rejection = message.contains("returned 4");
    let kind = if is_client_rejection {
        BrokerErrorKind::VenueReject
    } else {
        BrokerErrorKind::TransientNetwork
    };
    BrokerError::new(kind, message)
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Snapshot of the venue's trading clock. Spot markets trade continuously,
/// so `is_open` is always `true` today; kept as a field rather than assumed
/// so a future venue with trading hours can populate it honestly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketClock {
    pub timestamp_ms: u64,
    pub is_open: bool,
}

/// Outcome of placing a single order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: String,
    pub raw: serde_json::Value,
}

fn order_result_from_json(raw: serde_json::Value) -> OrderResult {
    let order_id = raw
        .get("orderId")
        .and_then(|v| v.as_u64())
        .map(|id| id.to_string())
        .unwrap_or_default();
    let status = raw
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("UNKNOWN")
        .to_string();
    OrderResult { order_id, status, raw }
}

/// Outcome of a bracket-order request. A fractional quantity can never carry
/// a venue-side bracket on this exchange, so `entry` alone is filled and
/// `needs_client_side_monitoring` is set so the exit engine takes over the
/// stop-loss/take-profit duties the venue couldn't attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketOrderResult {
    pub success: bool,
    pub has_bracket_protection: bool,
    pub needs_client_side_monitoring: bool,
    pub entry: Option<OrderResult>,
    pub take_profit: Option<OrderResult>,
    pub stop_loss: Option<OrderResult>,
    #[serde(default)]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Typed, idempotent operations against a trading venue. Every method
/// returns a `BrokerError` rather than panicking or bubbling a raw
/// transport error — rejection is data, not a fault.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn latest_bar(&self, symbol: &str) -> Result<Candle, BrokerError>;
    async fn history_bars(&self, symbol: &str, n: u32, timeframe: &str) -> Result<Vec<Candle>, BrokerError>;
    async fn clock(&self) -> Result<MarketClock, BrokerError>;
    async fn account(&self) -> Result<serde_json::Value, BrokerError>;
    async fn positions(&self) -> Result<Vec<serde_json::Value>, BrokerError>;
    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<serde_json::Value>, BrokerError>;
    async fn place_market(&self, symbol: &str, qty: f64, side: &str) -> Result<OrderResult, BrokerError>;
    async fn place_limit(&self, symbol: &str, qty: f64, side: &str, limit: f64, tif: &str) -> Result<OrderResult, BrokerError>;
    async fn place_bracket(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        tp: f64,
        sl: f64,
        sl_limit: Option<f64>,
        entry_limit: Option<f64>,
    ) -> Result<BracketOrderResult, BrokerError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), BrokerError>;
    async fn cancel_all(&self, symbol: &str) -> Result<(), BrokerError>;
    async fn close_all(&self, symbol: &str, cancel_pending: bool) -> Result<(), BrokerError>;
}

// ---------------------------------------------------------------------------
// BinanceBroker
// ---------------------------------------------------------------------------

/// `Broker` implementation backed by `BinanceClient`, every call routed
/// through a `ResilienceChain`.
pub struct BinanceBroker {
    client: Arc<BinanceClient>,
    chain: ResilienceChain,
}

impl BinanceBroker {
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self { client, chain: ResilienceChain::new() }
    }

    /// Best-effort base asset for a `{BASE}{QUOTE}` spot symbol, stripping
    /// the common quote-asset suffixes. Used only by `close_all`'s balance
    /// lookup; an unrecognized quote falls back to the whole symbol.
    fn base_asset(symbol: &str) -> &str {
        for quote in ["USDT", "BUSD", "USDC", "USD", "BTC", "ETH"] {
            if let Some(base) = symbol.strip_suffix(quote) {
                if !base.is_empty() {
                    return base;
                }
            }
        }
        symbol
    }
}

#[async_trait]
impl Broker for BinanceBroker {
    async fn latest_bar(&self, symbol: &str) -> Result<Candle, BrokerError> {
        let symbol = symbol.to_string();
        let client = self.client.clone();
        self.chain
            .call("latest_bar", || {
                let client = client.clone();
                let symbol = symbol.clone();
                async move {
                    client
                        .get_klines(&symbol, "1m", 1)
                        .await
                        .map_err(|e| classify_binance_error(&e))
                }
            })
            .await
            .and_then(|mut candles| {
                candles.pop().ok_or_else(|| {
                    BrokerError::new(BrokerErrorKind::TransientNetwork, "no candles returned")
                })
            })
    }

    async fn history_bars(&self, symbol: &str, n: u32, timeframe: &str) -> Result<Vec<Candle>, BrokerError> {
        let symbol = symbol.to_string();
        let timeframe = timeframe.to_string();
        let client = self.client.clone();
        self.chain
            .call("history_bars", || {
                let client = client.clone();
                let symbol = symbol.clone();
                let timeframe = timeframe.clone();
                async move {
                    client
                        .get_klines(&symbol, &timeframe, n)
                        .await
                        .map_err(|e| classify_binance_error(&e))
                }
            })
            .await
    }

    async fn clock(&self) -> Result<MarketClock, BrokerError> {
        Ok(MarketClock {
            timestamp_ms: BinanceClient::timestamp_ms(),
            is_open: true,
        })
    }

    async fn account(&self) -> Result<serde_json::Value, BrokerError> {
        let client = self.client.clone();
        self.chain
            .call("account", || {
                let client = client.clone();
                async move { client.get_account().await.map_err(|e| classify_binance_error(&e)) }
            })
            .await
    }

    async fn positions(&self) -> Result<Vec<serde_json::Value>, BrokerError> {
        // Spot has no leveraged "positions" endpoint; non-zero balances are
        // the closest analogue.
        let account = self.account().await?;
        let balances = account["balances"].as_array().cloned().unwrap_or_default();
        let held = balances
            .into_iter()
            .filter(|b| {
                let free: f64 = b["free"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                let locked: f64 = b["locked"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                free > 0.0 || locked > 0.0
            })
            .collect();
        Ok(held)
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<serde_json::Value>, BrokerError> {
        let symbol = symbol.map(|s| s.to_string());
        let client = self.client.clone();
        self.chain
            .call("open_orders", || {
                let client = client.clone();
                let symbol = symbol.clone();
                async move {
                    client
                        .get_open_orders(symbol.as_deref())
                        .await
                        .map_err(|e| classify_binance_error(&e))
                }
            })
            .await
    }

    async fn place_market(&self, symbol: &str, qty: f64, side: &str) -> Result<OrderResult, BrokerError> {
        let symbol = symbol.to_string();
        let side = side.to_string();
        let client = self.client.clone();
        self.chain
            .call("place_market", || {
                let client = client.clone();
                let symbol = symbol.clone();
                let side = side.clone();
                async move {
                    client
                        .place_order(&symbol, &side, "MARKET", qty, None, None, None)
                        .await
                        .map(order_result_from_json)
                        .map_err(|e| classify_binance_error(&e))
                }
            })
            .await
    }

    async fn place_limit(&self, symbol: &str, qty: f64, side: &str, limit: f64, tif: &str) -> Result<OrderResult, BrokerError> {
        let symbol = symbol.to_string();
        let side = side.to_string();
        let tif = tif.to_string();
        let client = self.client.clone();
        self.chain
            .call("place_limit", || {
                let client = client.clone();
                let symbol = symbol.clone();
                let side = side.clone();
                let tif = tif.clone();
                async move {
                    client
                        .place_order(&symbol, &side, "LIMIT", qty, Some(limit), Some(&tif), None)
                        .await
                        .map(order_result_from_json)
                        .map_err(|e| classify_binance_error(&e))
                }
            })
            .await
    }

    async fn place_bracket(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        tp: f64,
        sl: f64,
        sl_limit: Option<f64>,
        entry_limit: Option<f64>,
    ) -> Result<BracketOrderResult, BrokerError> {
        let is_fractional = qty.fract().abs() > 1e-9;

        let entry = match entry_limit {
            Some(limit) => self.place_limit(symbol, qty, side, limit, "GTC").await?,
            None => self.place_market(symbol, qty, side).await?,
        };

        if is_fractional {
            warn!(
                symbol,
                qty,
                "fractional quantity cannot carry a venue bracket — routing to client-side monitoring"
            );
            return Ok(BracketOrderResult {
                success: true,
                has_bracket_protection: false,
                needs_client_side_monitoring: true,
                entry: Some(entry),
                take_profit: None,
                stop_loss: None,
                reason: Some("fractional quantity; exit engine manages stop/target".to_string()),
            });
        }

        let opposite = if side == "BUY" { "SELL" } else { "BUY" };
        let tp_result = self.place_limit(symbol, qty, opposite, tp, "GTC").await;
        let sl_result = self.place_limit(symbol, qty, opposite, sl_limit.unwrap_or(sl), "GTC").await;

        match (tp_result, sl_result) {
            (Ok(tp_order), Ok(sl_order)) => Ok(BracketOrderResult {
                success: true,
                has_bracket_protection: true,
                needs_client_side_monitoring: false,
                entry: Some(entry),
                take_profit: Some(tp_order),
                stop_loss: Some(sl_order),
                reason: None,
            }),
            (tp_result, sl_result) => {
                warn!(symbol, "one or both bracket legs were rejected — falling back to client-side monitoring");
                Ok(BracketOrderResult {
                    success: true,
                    has_bracket_protection: false,
                    needs_client_side_monitoring: true,
                    entry: Some(entry),
                    take_profit: tp_result.ok(),
                    stop_loss: sl_result.ok(),
                    reason: Some("bracket leg rejected by venue".to_string()),
                })
            }
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), BrokerError> {
        let id: u64 = order_id.parse().map_err(|_| {
            BrokerError::new(BrokerErrorKind::VenueReject, format!("invalid order id: {order_id}"))
        })?;
        let symbol = symbol.to_string();
        let client = self.client.clone();
        self.chain
            .call("cancel_order", || {
                let client = client.clone();
                let symbol = symbol.clone();
                async move {
                    client
                        .cancel_order(&symbol, id)
                        .await
                        .map(|_| ())
                        .map_err(|e| classify_binance_error(&e))
                }
            })
            .await
    }

    async fn cancel_all(&self, symbol: &str) -> Result<(), BrokerError> {
        let open = self.open_orders(Some(symbol)).await?;
        for order in open {
            if let Some(id) = order.get("orderId").and_then(|v| v.as_u64()) {
                if let Err(e) = self.cancel_order(symbol, &id.to_string()).await {
                    warn!(symbol, order_id = id, error = %e, "failed to cancel order during cancel_all");
                }
            }
        }
        Ok(())
    }

    async fn close_all(&self, symbol: &str, cancel_pending: bool) -> Result<(), BrokerError> {
        if cancel_pending {
            self.cancel_all(symbol).await?;
        }

        let asset = Self::base_asset(symbol);
        let client = self.client.clone();
        let free = client
            .get_balance(asset)
            .await
            .map_err(|e| classify_binance_error(&e))?;

        if free > 0.0 {
            self.place_market(symbol, free, "SELL").await?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for BinanceBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceBroker").field("client", &"<BinanceClient>").finish()
    }
}
