// =============================================================================
// Heartbeat Monitor
// =============================================================================
//
// Every long-running loop (market data, strategy tick, reconciliation,
// regime detection) registers itself with a per-component timeout and calls
// `beat()` on each iteration. `check()` is polled on its own interval; the
// first time a component's heartbeat goes stale it flips Healthy -> Unhealthy
// exactly once and returns the component name so the caller can invoke the
// emergency protocol. Subsequent polls while still stale are no-ops — the
// transition, not the staleness, is the trigger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Per-component liveness record.
struct ComponentState {
    last_beat: Instant,
    timeout: Duration,
    /// `false` once this component has already fired its unhealthy
    /// transition, so repeated stale polls do not re-trigger emergencies.
    latched_unhealthy: AtomicBool,
}

/// Snapshot of one component's heartbeat status, for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHeartbeat {
    pub component: String,
    pub healthy: bool,
    pub seconds_since_beat: f64,
    pub timeout_secs: f64,
}

/// Tracks liveness of every registered component.
pub struct HeartbeatMonitor {
    components: RwLock<HashMap<String, ComponentState>>,
}

impl HeartbeatMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            components: RwLock::new(HashMap::new()),
        })
    }

    /// Register a component with its allowed silence window. Re-registering
    /// an existing component resets its clock and unhealthy latch.
    pub fn register(&self, component: &str, timeout: Duration) {
        self.components.write().insert(
            component.to_string(),
            ComponentState {
                last_beat: Instant::now(),
                timeout,
                latched_unhealthy: AtomicBool::new(false),
            },
        );
        info!(component, timeout_secs = timeout.as_secs_f64(), "heartbeat registered");
    }

    /// Record a liveness pulse from `component`. Also clears the unhealthy
    /// latch so a recovered component can re-trigger on a future timeout.
    pub fn beat(&self, component: &str) {
        let map = self.components.read();
        if let Some(state) = map.get(component) {
            state.latched_unhealthy.store(false, Ordering::SeqCst);
        }
        drop(map);
        if let Some(state) = self.components.write().get_mut(component) {
            state.last_beat = Instant::now();
        }
    }

    /// Poll every registered component. Returns the names of components that
    /// *newly* crossed into unhealthy on this call (empty if none did, or if
    /// they were already latched unhealthy from a prior call).
    pub fn check(&self) -> Vec<String> {
        let now = Instant::now();
        let mut newly_unhealthy = Vec::new();

        let map = self.components.read();
        for (name, state) in map.iter() {
            let stale = now.duration_since(state.last_beat) > state.timeout;
            if stale {
                // compare_exchange so concurrent checks only report the
                // transition once even if `check` is somehow called from
                // two tasks at once.
                if state
                    .latched_unhealthy
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    warn!(
                        component = %name,
                        timeout_secs = state.timeout.as_secs_f64(),
                        "component heartbeat timed out"
                    );
                    newly_unhealthy.push(name.clone());
                }
            }
        }
        newly_unhealthy
    }

    /// Full snapshot of all components' current status, for the status
    /// endpoint.
    pub fn snapshot(&self) -> Vec<ComponentHeartbeat> {
        let now = Instant::now();
        self.components
            .read()
            .iter()
            .map(|(name, state)| {
                let elapsed = now.duration_since(state.last_beat);
                ComponentHeartbeat {
                    component: name.clone(),
                    healthy: elapsed <= state.timeout,
                    seconds_since_beat: elapsed.as_secs_f64(),
                    timeout_secs: state.timeout.as_secs_f64(),
                }
            })
            .collect()
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn fresh_component_is_healthy() {
        let monitor = HeartbeatMonitor::new();
        monitor.register("strategy_loop", Duration::from_secs(5));
        assert!(monitor.check().is_empty());
        let snap = monitor.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap[0].healthy);
    }

    #[test]
    fn stale_component_triggers_once() {
        let monitor = HeartbeatMonitor::new();
        monitor.register("reconcile_loop", Duration::from_millis(10));
        sleep(Duration::from_millis(30));

        let first = monitor.check();
        assert_eq!(first, vec!["reconcile_loop".to_string()]);

        // Still stale on a second poll, but already latched -- no re-trigger.
        let second = monitor.check();
        assert!(second.is_empty());
    }

    #[test]
    fn beat_clears_unhealthy_latch() {
        let monitor = HeartbeatMonitor::new();
        monitor.register("market_data_loop", Duration::from_millis(10));
        sleep(Duration::from_millis(30));
        assert_eq!(monitor.check(), vec!["market_data_loop".to_string()]);

        monitor.beat("market_data_loop");
        sleep(Duration::from_millis(30));
        // A fresh timeout after recovery should trigger again.
        assert_eq!(monitor.check(), vec!["market_data_loop".to_string()]);
    }

    #[test]
    fn unregistered_component_never_reported() {
        let monitor = HeartbeatMonitor::new();
        assert!(monitor.check().is_empty());
    }
}
