// =============================================================================
// OutcomeTracker — open-position ledger feeding the feedback loop (§4.9)
// =============================================================================
//
// A plain in-memory `symbol → OpenPosition` table. Entries are registered
// synchronously by the broker when a position opens; exits are registered
// asynchronously (PnL is computed, optionally persisted, then handed to
// `FeedbackEngine`).
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{Symbol, TradeOutcome};
use crate::feedback::engine::FeedbackEngine;
use crate::repository::Repository;
use crate::types::DecisionAction;

#[derive(Debug, Clone)]
struct OpenPosition {
    decision_id: Option<Uuid>,
    action: DecisionAction,
    entry_price: f64,
    quantity: f64,
    entry_timestamp: DateTime<Utc>,
    rationale: Option<String>,
    rule_ids: Vec<Uuid>,
}

pub struct OutcomeTracker {
    open_positions: RwLock<HashMap<Symbol, OpenPosition>>,
    feedback_engine: Arc<FeedbackEngine>,
    repository: Option<Arc<dyn Repository>>,
}

impl OutcomeTracker {
    pub fn new(feedback_engine: Arc<FeedbackEngine>, repository: Option<Arc<dyn Repository>>) -> Self {
        Self { open_positions: RwLock::new(HashMap::new()), feedback_engine, repository }
    }

    /// Record a freshly opened position. Synchronous: no I/O, just a map
    /// insert.
    pub fn register_position_entry(
        &self,
        symbol: Symbol,
        action: DecisionAction,
        entry_price: f64,
        quantity: f64,
        entry_timestamp: DateTime<Utc>,
        rationale: Option<String>,
    ) {
        info!(%symbol, %action, entry_price, "registered position entry");
        self.open_positions.write().insert(
            symbol,
            OpenPosition { decision_id: None, action, entry_price, quantity, entry_timestamp, rationale, rule_ids: Vec::new() },
        );
    }

    /// Compute the outcome of a closed position and run it through the
    /// feedback loop. A symbol with no tracked open position is a no-op
    /// (matches a CLOSE issued for a position the tracker never saw, e.g.
    /// one opened before the tracker existed).
    pub async fn register_position_exit(
        &self,
        symbol: Symbol,
        exit_price: f64,
        _exit_action: DecisionAction,
        _exit_reason: String,
    ) -> Result<()> {
        let Some(position) = self.open_positions.write().remove(&symbol) else {
            warn!(%symbol, "position exit for untracked symbol");
            return Ok(());
        };

        let exit_time = Utc::now();
        let pnl_pct = match position.action {
            DecisionAction::Sell => (position.entry_price - exit_price) / position.entry_price * 100.0,
            _ => (exit_price - position.entry_price) / position.entry_price * 100.0,
        };
        let pnl_usd = (pnl_pct / 100.0) * position.quantity * position.entry_price;
        let duration_seconds = exit_time.signed_duration_since(position.entry_timestamp).num_seconds();

        info!(%symbol, pnl_pct, pnl_usd, duration_seconds, "position closed, computing outcome");

        let mut outcome = TradeOutcome {
            id: None,
            symbol: symbol.clone(),
            action: position.action,
            entry_price: position.entry_price,
            exit_price,
            pnl_usd,
            pnl_pct,
            rationale: position.rationale.clone(),
            rule_ids: position.rule_ids.clone(),
            duration_seconds,
        };

        if let Some(repo) = &self.repository {
            match repo.save_outcome(&outcome).await {
                Ok(saved) => outcome = saved,
                Err(e) => warn!(%symbol, error = %e, "failed to save trade outcome"),
            }
        }

        match self.feedback_engine.process_closed_trade(&outcome).await {
            Ok(Some(rule)) => info!(%symbol, rule = %rule.rule_text, "feedback loop generated new rule"),
            Ok(None) => info!(%symbol, "feedback loop did not generate a new rule"),
            Err(e) => warn!(%symbol, error = %e, "error processing trade outcome through feedback loop"),
        }

        Ok(())
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.open_positions.read().contains_key(symbol)
    }

    pub fn open_position_count(&self) -> usize {
        self.open_positions.read().len()
    }
}
