// =============================================================================
// Aurora Spot Nexus — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Users must explicitly
// switch to Live mode via the dashboard or API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod absorption_detector;
mod api;
mod app_state;
mod backtest;
mod binance;
mod cusum_detector;
mod decision_envelope;
mod emergency;
mod event_bus;
mod execution;
mod exit;
mod futures_intel;
mod heartbeat;
mod htf_analysis;
mod indicators;
mod market_data;
mod order_guard;
mod position_engine;
mod reconcile;
mod regime;
mod risk;
mod runtime_config;
mod signals;
mod smart_filters;
mod strategy;
mod trade_insurance;
mod types;
mod watchlist;

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{
    AppState, HEARTBEAT_EXIT_MONITOR, HEARTBEAT_MARKET_DATA, HEARTBEAT_RECONCILE,
    HEARTBEAT_STRATEGY_LOOP,
};
use crate::execution::ExecutionEngine;
use crate::exit::micro_trail::MicroTrailState;
use crate::exit::triple_barrier::{BarrierConfig, BarrierState};
use crate::regime::macro_regime::{
    classify_macro_regime, compute_breadth_proxy, vix_from_annualized_stdev, MacroRegimeState,
};
use crate::runtime_config::RuntimeConfig;
use crate::strategy::StrategyEngine;
use crate::types::AccountMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Spot Nexus — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: Force Demo + Paused on startup.
    config.trading_mode = types::TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("AURORA_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec![
            "BTCUSDT".into(),
            "ETHUSDT".into(),
            "BNBUSDT".into(),
            "XRPUSDT".into(),
            "SOLUSDT".into(),
        ];
    }

    info!(symbols = ?config.symbols, "Configured trading pairs");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "Engine starting in SAFE mode (Demo + Paused)"
    );

    // ── 2. Build Binance client ───────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let binance_client = Arc::new(binance::client::BinanceClient::new(api_key, api_secret));
    let binance_broker: Arc<dyn binance::broker::Broker> =
        Arc::new(binance::broker::BinanceBroker::new(binance_client.clone()));

    // ── 3. Build shared state (wires watchlist, heartbeat, emergency) ────
    let state = Arc::new(AppState::new(config, binance_client.clone(), binance_broker.clone()));

    // ── 4. Spawn market data streams ─────────────────────────────────────
    let symbols = state.runtime_config.read().symbols.clone();

    for symbol in &symbols {
        // Kline 1m stream
        let cb = state.candle_buffer.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::candle_buffer::run_kline_stream(&sym, "1m", &cb).await
                {
                    error!(symbol = %sym, error = %e, "Kline 1m stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        // Kline 5m stream
        let cb = state.candle_buffer.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::candle_buffer::run_kline_stream(&sym, "5m", &cb).await
                {
                    error!(symbol = %sym, error = %e, "Kline 5m stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        // Trade stream
        {
            let procs = state.trade_processors.read();
            if let Some(tp) = procs.get(symbol) {
                let processor = tp.clone();
                let sym = symbol.clone();
                tokio::spawn(async move {
                    loop {
                        if let Err(e) =
                            market_data::trade_stream::run_trade_stream(&sym, &processor).await
                        {
                            error!(symbol = %sym, error = %e, "Trade stream error — reconnecting in 5s");
                        }
                        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    }
                });
            }
        }

        // Orderbook stream
        let ob = state.orderbook_manager.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::orderbook::run_depth_stream(&sym, &ob).await {
                    error!(symbol = %sym, error = %e, "Depth stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    info!(count = symbols.len(), "Market data streams launched");

    // Market data liveness ticker — beats once per tick as a proxy for the
    // whole per-symbol stream fan-out above (individual streams reconnect
    // independently and don't share a single loop to hook a beat into).
    {
        let hb_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(10));
            loop {
                interval.tick().await;
                hb_state.heartbeat.beat(HEARTBEAT_MARKET_DATA);
            }
        });
    }

    // ── 5. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("AURORA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    // ── 6. Execution engine ──────────────────────────────────────────────
    let exec_engine = Arc::new(ExecutionEngine::new(
        binance_broker.clone(),
        state.position_manager.clone(),
        state.risk_engine.clone(),
        state.order_guard.clone(),
    ));

    // ── Shared exit state (used by both strategy loop and exit monitor) ──
    let barrier_states = exit::monitor::new_barrier_states();
    let micro_trail_states = exit::monitor::new_micro_trail_states();
    let exit_rule_states = exit::monitor::new_exit_rule_states();

    // ── 7. Strategy loop (every 5 seconds) ───────────────────────────────
    let strat_state = state.clone();
    let strat_exec = exec_engine.clone();
    let strat_barriers = barrier_states.clone();
    let strat_trails = micro_trail_states.clone();
    tokio::spawn(async move {
        // Wait for initial data
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        info!("Strategy loop starting");

        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
        let mut ticks: u64 = 0;
        loop {
            interval.tick().await;
            strat_state.heartbeat.beat(HEARTBEAT_STRATEGY_LOOP);

            // Check emergency + paused/killed state before doing any work.
            if strat_state.emergency.is_triggered() {
                continue;
            }
            let trading_mode = strat_state.runtime_config.read().trading_mode;
            if trading_mode != types::TradingMode::Live {
                continue;
            }

            // Rotate the watchlist roughly once a minute (every 12th 5s tick).
            ticks += 1;
            if ticks % 12 == 0 || strat_state.watchlist.get_active().is_empty() {
                strat_state.watchlist.rotate(&strat_state).await;
            }

            let syms = strat_state.watchlist.get_active();
            let is_demo =
                strat_state.runtime_config.read().account_mode == AccountMode::Demo;

            for symbol in &syms {
                let (envelope, proposal) =
                    StrategyEngine::evaluate_symbol(&strat_state, symbol);
                strat_state.push_decision(envelope);

                if let Some(prop) = proposal {
                    let result = strat_exec
                        .execute_proposal(
                            &prop.symbol,
                            &prop.side,
                            prop.entry_price,
                            prop.quantity,
                            prop.stop_loss,
                            prop.take_profit_1,
                            prop.take_profit_2,
                            is_demo,
                        )
                        .await;
                    info!(symbol = %prop.symbol, side = %prop.side, result = %result, "trade execution result");

                    // Create exit management state for the new position.
                    if matches!(result, crate::execution::ExecutionResult::Simulated(_) | crate::execution::ExecutionResult::Placed(_)) {
                        // Find the position ID (just opened — last in the list).
                        let open = strat_state.position_manager.get_open_positions();
                        if let Some(pos) = open.iter().rev().find(|p| p.symbol == prop.symbol) {
                            let now_secs = std::time::SystemTime::now()
                                .duration_since(std::time::UNIX_EPOCH)
                                .unwrap_or_default()
                                .as_secs();

                            // ATR pct for barrier config.
                            let atr_pct = if prop.entry_price > 0.0 {
                                ((prop.stop_loss - prop.entry_price).abs() / prop.entry_price) * 100.0
                            } else {
                                0.5
                            };

                            // Create BarrierState.
                            let barrier_config = BarrierConfig::from_atr(atr_pct, &prop.regime);
                            let barrier = BarrierState::new(barrier_config, prop.entry_price, &prop.side, now_secs);
                            strat_barriers.write().insert(pos.id.clone(), barrier);

                            // Create MicroTrailState.
                            let atr_price_units = (prop.stop_loss - prop.entry_price).abs();
                            let mut micro = MicroTrailState::new(
                                prop.side == "BUY",
                                prop.entry_price,
                                prop.take_profit_1,
                                atr_price_units,
                            );
                            // Capture CVD at entry time for divergence detection.
                            let cvd_at_entry = strat_state.trade_processors.read()
                                .get(&prop.symbol)
                                .map(|tp| tp.cvd())
                                .unwrap_or(0.0);
                            micro.set_cvd_at_entry(cvd_at_entry);
                            strat_trails.write().insert(pos.id.clone(), micro);

                            info!(
                                position_id = %pos.id,
                                symbol = %prop.symbol,
                                "BarrierState + MicroTrailState created for new position"
                            );
                        }
                    }
                }
            }
        }
    });

    // ── 8. Exit monitor loop (priority exit rules, barrier/trail tighten) ─
    let exit_state = state.clone();
    let exit_barriers = barrier_states.clone();
    let exit_trails = micro_trail_states.clone();
    let exit_rules = exit_rule_states.clone();
    tokio::spawn(async move {
        // Price-update loop runs alongside the barrier/trail monitor.
        let price_state = exit_state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                price_state.heartbeat.beat(HEARTBEAT_EXIT_MONITOR);
                let open_positions = price_state.position_manager.get_open_positions();
                for pos in &open_positions {
                    let procs = price_state.trade_processors.read();
                    if let Some(tp) = procs.get(&pos.symbol) {
                        let price = tp.last_price();
                        if price > 0.0 {
                            price_state.position_manager.update_price(&pos.symbol, price);
                        }
                    }
                }
            }
        });

        exit::monitor::run_exit_monitor(exit_state, exit_barriers, exit_trails, exit_rules).await;
    });

    // ── 9. Reconciliation loop ───────────────────────────────────────────
    let recon_state = state.clone();
    let recon_client = binance_client.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            recon_state.heartbeat.beat(HEARTBEAT_RECONCILE);

            if recon_state.runtime_config.read().account_mode == AccountMode::Demo {
                continue;
            }

            match recon_client.get_account().await {
                Ok(account_info) => {
                    if let Some(balances) =
                        account_info.get("balances").and_then(|v| v.as_array())
                    {
                        let mut new_balances = Vec::new();
                        for b in balances {
                            let asset =
                                b.get("asset").and_then(|v| v.as_str()).unwrap_or("");
                            let free: f64 = b
                                .get("free")
                                .and_then(|v| v.as_str())
                                .and_then(|s| s.parse().ok())
                                .unwrap_or(0.0);
                            let locked: f64 = b
                                .get("locked")
                                .and_then(|v| v.as_str())
                                .and_then(|s| s.parse().ok())
                                .unwrap_or(0.0);
                            if free > 0.0 || locked > 0.0 {
                                new_balances.push(types::BalanceInfo {
                                    asset: asset.to_string(),
                                    free,
                                    locked,
                                });
                            }
                        }
                        *recon_state.balances.write() = new_balances;
                        *recon_state.last_reconcile_ok.write() =
                            Some(std::time::Instant::now());
                        *recon_state.last_reconcile_error.write() = None;
                        recon_state.increment_version();
                    }
                }
                Err(e) => {
                    *recon_state.last_reconcile_error.write() = Some(format!("{e}"));
                    warn!(error = %e, "reconciliation failed");
                }
            }
        }
    });

    // ── 10. Regime detection loop (microstructure + macro) ───────────────
    let regime_state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let syms = regime_state.watchlist.get_active();
            let syms = if syms.is_empty() {
                regime_state.runtime_config.read().symbols.clone()
            } else {
                syms
            };

            if let Some(symbol) = syms.first() {
                // Microstructure regime — teacher's detector, unchanged.
                let key = market_data::CandleKey {
                    symbol: symbol.clone(),
                    interval: "5m".to_string(),
                };
                let candles = regime_state.candle_buffer.get_closed_candles(&key, 100);
                if candles.len() >= 50 {
                    regime_state.regime_detector.write().update(&candles);
                    regime_state.increment_version();
                }

                // Macro regime — drives strategy dispatch (C5).
                let daily_key = market_data::CandleKey {
                    symbol: symbol.clone(),
                    interval: "1d".to_string(),
                };
                let daily_closes: Vec<f64> = regime_state
                    .candle_buffer
                    .get_closed_candles(&daily_key, 220)
                    .iter()
                    .map(|c| c.close)
                    .collect();

                if daily_closes.len() >= 60 {
                    let ma50 = daily_closes[daily_closes.len() - 50..].iter().sum::<f64>() / 50.0;
                    let ma200_window = daily_closes.len().min(200);
                    let ma200 = daily_closes[daily_closes.len() - ma200_window..]
                        .iter()
                        .sum::<f64>()
                        / ma200_window as f64;
                    let price = *daily_closes.last().unwrap();
                    let vix = vix_from_annualized_stdev(&daily_closes);

                    let recent_vol = daily_closes[daily_closes.len() - 20..].to_vec();
                    let prior_vol = if daily_closes.len() >= 40 {
                        daily_closes[daily_closes.len() - 40..daily_closes.len() - 20].to_vec()
                    } else {
                        recent_vol.clone()
                    };
                    let stdev = |xs: &[f64]| -> f64 {
                        let mean = xs.iter().sum::<f64>() / xs.len() as f64;
                        (xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / xs.len() as f64)
                            .sqrt()
                    };
                    let vol_ratio = if stdev(&prior_vol) > 0.0 {
                        stdev(&recent_vol) / stdev(&prior_vol)
                    } else {
                        1.0
                    };

                    let universe = regime_state.runtime_config.read().watchlist_universe.clone();
                    let basket: Vec<String> = universe.into_iter().take(8).collect();
                    let (breadth, breadth_is_proxy) =
                        compute_breadth_proxy(&regime_state.candle_buffer, &basket, "1d");

                    let (regime, confidence) =
                        classify_macro_regime(vix, ma50, ma200, price, vol_ratio, breadth);

                    *regime_state.last_macro_regime.write() = Some(MacroRegimeState {
                        regime,
                        confidence,
                        vix,
                        ma50,
                        ma200,
                        price,
                        vol_ratio,
                        breadth,
                        breadth_is_proxy,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    });
                    regime_state.increment_version();
                }
            }
        }
    });

    // ── 11. Heartbeat check loop — triggers the emergency protocol on any
    //        component that newly crossed into unhealthy ─────────────────
    let hb_check_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            let newly_unhealthy = hb_check_state.heartbeat.check();
            if !newly_unhealthy.is_empty() {
                error!(components = ?newly_unhealthy, "heartbeat timeout — triggering emergency protocol");
                let account_mode = hb_check_state.runtime_config.read().account_mode;
                let reason = format!("heartbeat timeout: {}", newly_unhealthy.join(","));
                let result = hb_check_state.emergency.trigger(&reason, account_mode).await;
                hb_check_state.push_error_with_code(
                    format!("emergency protocol triggered: {}", result.reason),
                    Some("EMERGENCY".to_string()),
                );
                {
                    let mut config = hb_check_state.runtime_config.write();
                    config.trading_mode = types::TradingMode::Killed;
                }
                hb_check_state.increment_version();
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Aurora Spot Nexus shut down complete.");
    Ok(())
}
