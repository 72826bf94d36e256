// =============================================================================
// Repository contract
// =============================================================================
//
// Persistence for learned rules, trade outcomes, and runtime-mode selection
// in paper/live mode. Simulator mode runs with no `Repository` configured at
// all — its state lives entirely in the atomic `simulation_state.json` file
// written by the broker (see `broker::simulated`). The trait uses the same
// boxed-future object-safety pattern as `exchange::ExchangeClient`.
// =============================================================================

pub mod memory;

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;
use uuid::Uuid;

use crate::domain::{LearnedRule, TradeOutcome};
use crate::types::RuntimeMode;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait Repository: Send + Sync {
    fn save_rule<'a>(&'a self, rule: &'a LearnedRule) -> BoxFuture<'a, Result<LearnedRule>>;

    fn fetch_active_rules<'a>(&'a self, limit: usize) -> BoxFuture<'a, Result<Vec<LearnedRule>>>;

    fn save_outcome<'a>(&'a self, outcome: &'a TradeOutcome) -> BoxFuture<'a, Result<TradeOutcome>>;

    fn fetch_recent_outcomes<'a>(&'a self, limit: usize) -> BoxFuture<'a, Result<Vec<TradeOutcome>>>;

    fn load_runtime_mode<'a>(&'a self) -> BoxFuture<'a, Result<Option<RuntimeMode>>>;

    fn save_runtime_mode<'a>(&'a self, mode: RuntimeMode) -> BoxFuture<'a, Result<()>>;

    fn record_rule_application<'a>(&'a self, rule_id: Uuid) -> BoxFuture<'a, Result<()>>;
}
