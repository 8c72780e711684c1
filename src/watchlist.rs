// =============================================================================
// Watchlist Selector — bounded-universe top-N scoring with cooldown rotation
// =============================================================================
//
// Scans a bounded universe of symbols (hundreds), scores each one concurrently
// through the strategy engine, and keeps the top-N active symbols. Fan-out is
// bounded by a semaphore so a large universe cannot spawn unbounded tasks.
// Rotations are serialized by an internal async mutex; `get_active()` never
// blocks on a rotation longer than it takes to clone the active vec.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::strategy::StrategyEngine;

/// Default bound on concurrent per-symbol scoring tasks during a rotation.
const DEFAULT_SCAN_CONCURRENCY: usize = 64;

/// Outcome of a single rotation pass.
#[derive(Debug, Clone, Default)]
pub struct RotationDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

pub struct WatchlistSelector {
    universe: Vec<String>,
    capacity: usize,
    cooldown: Duration,
    active: RwLock<Vec<String>>,
    /// Symbols recently removed from the active set, with the instant they
    /// become eligible for re-entry.
    cooldowns: RwLock<HashMap<String, Instant>>,
    rotation_lock: Mutex<()>,
    scan_permits: Semaphore,
}

impl WatchlistSelector {
    pub fn new(universe: Vec<String>, capacity: usize, cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            universe,
            capacity,
            cooldown,
            active: RwLock::new(Vec::new()),
            cooldowns: RwLock::new(HashMap::new()),
            rotation_lock: Mutex::new(()),
            scan_permits: Semaphore::new(DEFAULT_SCAN_CONCURRENCY),
        })
    }

    /// Immutable copy of the currently active symbol set. Never blocks on a
    /// rotation in progress for longer than the time to clone the vec.
    pub fn get_active(&self) -> Vec<String> {
        self.active.read().clone()
    }

    /// Re-scan the universe, score every symbol, and update the active set
    /// to the top `capacity` scorers not currently in cooldown. Returns the
    /// added/removed diff against the previous active set.
    pub async fn rotate(&self, state: &Arc<AppState>) -> RotationDiff {
        // Serializes concurrent rotation attempts; reads of `active` are
        // unaffected since they go through the separate RwLock above.
        let _guard = self.rotation_lock.lock().await;

        let now = Instant::now();
        let in_cooldown: std::collections::HashSet<String> = {
            let cooldowns = self.cooldowns.read();
            cooldowns
                .iter()
                .filter(|(_, expiry)| **expiry > now)
                .map(|(symbol, _)| symbol.clone())
                .collect()
        };

        let scores = self.score_universe(state).await;

        let mut ranked: Vec<(String, f64)> = scores
            .into_iter()
            .filter(|(symbol, _)| !in_cooldown.contains(symbol))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(self.capacity);

        let new_active: Vec<String> = ranked.into_iter().map(|(symbol, _)| symbol).collect();
        let new_set: std::collections::HashSet<&String> = new_active.iter().collect();

        let previous = self.active.read().clone();
        let previous_set: std::collections::HashSet<&String> = previous.iter().collect();

        let added: Vec<String> = new_active
            .iter()
            .filter(|s| !previous_set.contains(s))
            .cloned()
            .collect();
        let removed: Vec<String> = previous
            .iter()
            .filter(|s| !new_set.contains(s))
            .cloned()
            .collect();

        if !removed.is_empty() {
            let expiry = now + self.cooldown;
            let mut cooldowns = self.cooldowns.write();
            for symbol in &removed {
                cooldowns.insert(symbol.clone(), expiry);
            }
        }

        *self.active.write() = new_active;

        if !added.is_empty() || !removed.is_empty() {
            info!(
                added = added.len(),
                removed = removed.len(),
                active = self.active.read().len(),
                "watchlist rotation complete"
            );
        } else {
            debug!("watchlist rotation complete — no changes");
        }

        RotationDiff { added, removed }
    }

    async fn score_universe(&self, state: &Arc<AppState>) -> Vec<(String, f64)> {
        let mut handles = Vec::with_capacity(self.universe.len());

        for symbol in &self.universe {
            let symbol = symbol.clone();
            let state = state.clone();
            let permits = &self.scan_permits;
            let permit = permits.acquire().await.expect("scan semaphore closed");
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let score = score_symbol(&state, &symbol);
                (symbol, score)
            });
            handles.push(handle);
        }

        let mut scores = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok((symbol, score)) = handle.await {
                scores.push((symbol, score));
            }
        }
        scores
    }
}

/// Score a single symbol via the strategy engine. Blocked/hold evaluations
/// score zero rather than being excluded outright, so a quiet symbol can
/// still surface if the rest of the universe is even quieter.
fn score_symbol(state: &Arc<AppState>, symbol: &str) -> f64 {
    let (_, proposal) = StrategyEngine::evaluate_symbol(state, symbol);
    proposal.map(|p| p.score.abs()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_active_starts_empty() {
        let selector = WatchlistSelector::new(vec!["BTCUSDT".into()], 5, Duration::from_secs(60));
        assert!(selector.get_active().is_empty());
    }

    #[test]
    fn rotation_diff_default_is_empty() {
        let diff = RotationDiff::default();
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
    }
}
