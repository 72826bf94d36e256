// =============================================================================
// BrokerPort contract
// =============================================================================
//
// One interface, two concrete implementations selected by `RuntimeMode`:
// `simulated::SimulatedBroker` (bookkeeping only) and `exchange::ExchangeBroker`
// (wraps `exchange::ExchangeClient`). No shared base struct beyond this trait —
// shared arithmetic (slippage, invalidation parsing) lives as free functions
// here instead.
// =============================================================================

pub mod exchange;
pub mod factory;
pub mod simulated;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::domain::{Portfolio, Symbol};
use crate::types::DecisionAction;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One structured action the LLM proposes for one symbol, per §4.6's exact
/// field list. Unknown JSON fields are ignored by serde's default behavior;
/// `symbol` is normalized by the caller before dispatch, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: Symbol,
    pub action: DecisionAction,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub size_pct: Option<f64>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub max_slippage_bps: Option<f64>,
    #[serde(default)]
    pub invalidation_condition: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    /// Attached post-parse by the pipeline (§4.7 point 7); not part of the
    /// LLM's JSON output.
    #[serde(default)]
    pub chain_of_thought: Option<String>,
}

/// Extra context threaded through `execute` purely for audit logging
/// (`EvaluationLogEntry::{system_prompt,user_payload,tool_payload_json}`).
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub system_prompt: String,
    pub user_payload: String,
    pub tool_payload_json: Option<serde_json::Value>,
}

/// Why a CLOSE was triggered during `mark_to_market`, distinct from the
/// broader `ExitReason` stored on `ClosedPosition` (this carries the
/// formatted message text `execute`'s return value is expected to include).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    StopLoss,
    TakeProfit,
    Invalidation,
}

impl TriggerKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::StopLoss => "Stop-loss",
            Self::TakeProfit => "Take-profit",
            Self::Invalidation => "Invalidation",
        }
    }
}

/// A CLOSE whose feedback-loop side effect (OutcomeTracker → FeedbackEngine)
/// is deferred until `process_pending_feedback` runs (§9).
#[derive(Debug, Clone)]
pub struct PendingExit {
    pub symbol: Symbol,
    pub fill_price: f64,
    pub reason: String,
}

/// Uniform trading surface the scheduler drives without knowing which
/// backend is behind it.
pub trait BrokerPort: Send + Sync {
    /// Execute a batch of decisions against `market_snapshots` (symbol →
    /// last price, only prices `> 0` are usable). Returns one human-readable
    /// message per decision, in input order.
    fn execute<'a>(
        &'a self,
        decisions: &'a [Decision],
        market_snapshots: &'a HashMap<Symbol, f64>,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Re-price open positions and close any that cross a stop-loss,
    /// take-profit, or invalidation trigger.
    fn mark_to_market<'a>(&'a self, market_snapshots: &'a HashMap<Symbol, f64>) -> BoxFuture<'a, Result<()>>;

    /// Drain and process any `PendingExit`s queued by `execute`/
    /// `mark_to_market` since the last call.
    fn process_pending_feedback<'a>(&'a self) -> BoxFuture<'a, Result<()>>;

    /// Release any held exchange sessions. A no-op for `SimulatedBroker`.
    fn close<'a>(&'a self) -> BoxFuture<'a, Result<()>>;

    /// A snapshot of the current portfolio, if one exists.
    fn get_portfolio_snapshot<'a>(&'a self) -> BoxFuture<'a, Result<Option<Portfolio>>>;
}

/// Apply the BUY/SELL slippage convention of §4.8.1 point 2: price moves
/// against the trader, neutral for CLOSE/HOLD/NO_ENTRY.
pub fn apply_slippage(action: DecisionAction, price: f64, max_slippage_bps: f64) -> f64 {
    let factor = max_slippage_bps / 10_000.0;
    match action {
        DecisionAction::Buy => price * (1.0 + factor),
        DecisionAction::Sell => price * (1.0 - factor),
        _ => price,
    }
}

/// Parse and evaluate a natural-language invalidation condition against the
/// current price. Recognizes `"(close|price) (below|under) <n>"` and
/// `"(close|price) (above|over) <n>"`, case-insensitively; any other text
/// returns `false` rather than erroring, per §4.8.1 point 4 and §8's boundary
/// behavior ("unparseable invalidation condition is a no-op, never a
/// failure").
pub fn evaluate_invalidation(condition: &str, current_price: f64) -> bool {
    let lower = condition.to_ascii_lowercase();

    if let Some(threshold) = extract_threshold(&lower, &["below", "under"]) {
        if current_price < threshold {
            return true;
        }
    }
    if let Some(threshold) = extract_threshold(&lower, &["above", "over"]) {
        if current_price > threshold {
            return true;
        }
    }
    false
}

/// Find `(close|price) <verb> <number>` for any of `verbs`, returning the
/// parsed number of the first match.
fn extract_threshold(lower: &str, verbs: &[&str]) -> Option<f64> {
    let words: Vec<&str> = lower.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        if *word != "close" && *word != "price" {
            continue;
        }
        let Some(verb) = words.get(i + 1) else { continue };
        if !verbs.contains(verb) {
            continue;
        }
        if let Some(number) = words.get(i + 2) {
            if let Ok(value) = number.trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.').parse::<f64>() {
                return Some(value);
            }
        }
    }
    None
}
