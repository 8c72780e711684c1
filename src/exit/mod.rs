// =============================================================================
// Exit Management Module
// =============================================================================
//
// Implements the Triple Barrier exit strategy and a background exit monitor
// loop that evaluates all open positions every 5 seconds.

pub mod micro_trail;
pub mod monitor;
pub mod rules;
pub mod triple_barrier;
