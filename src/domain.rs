// =============================================================================
// Core data model
// =============================================================================
//
// Every type here is inert: construction, derived-field computation, and
// equity/pnl arithmetic only. Nothing in this module touches I/O, the clock
// (beyond stamping timestamps passed in by the caller), or global state.
// Orchestration lives in `app_state.rs` and the broker/pipeline modules.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{DecisionAction, ExitReason, RuleType};

/// Symbols are opaque identifiers, compared case-insensitively and always
/// stored upper-case. Plain `String` is used as the wire/storage
/// representation rather than a newtype, since no method set beyond
/// normalization is ever attached to it.
pub type Symbol = String;

/// Upper-case a raw symbol string for use as a map key or comparison value.
pub fn normalize_symbol(raw: &str) -> Symbol {
    raw.trim().to_uppercase()
}

/// One OHLCV bar. `timestamp` marks the bar's start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Indicator values for one symbol at one instant, plus trailing series and
/// an optional nested snapshot computed over a longer bar.
///
/// Construction is the caller's responsibility (see `indicators::resample`
/// and the market-data scheduler); this struct is a plain value holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub price: f64,
    pub ema20: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub rsi7: f64,
    pub rsi14: f64,
    pub atr3: f64,
    pub atr14: f64,
    pub volume: f64,
    pub volume_ratio: f64,
    pub volatility: f64,

    pub ema20_series: Vec<f64>,
    pub macd_series: Vec<f64>,
    pub macd_histogram_series: Vec<f64>,
    pub rsi7_series: Vec<f64>,
    pub rsi14_series: Vec<f64>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub higher_timeframe: Option<Box<IndicatorSnapshot>>,
}

/// Derivatives market data for a perpetual swap. Absent fields stay `None`
/// rather than being synthesized — readers must treat them as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivativesSnapshot {
    pub funding_rate: f64,
    pub funding_rate_pct: f64,
    pub funding_rate_annual_pct: f64,
    #[serde(default)]
    pub predicted_funding_rate: Option<f64>,
    #[serde(default)]
    pub next_funding_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub open_interest_usd: Option<f64>,
    #[serde(default)]
    pub open_interest_contracts: Option<f64>,
    #[serde(default)]
    pub open_interest_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mark_price: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

impl DerivativesSnapshot {
    /// Build the derived percentage/annualized fields from a raw funding
    /// rate, under the 8-hour funding-period convention (3 fundings/day).
    pub fn from_funding_rate(funding_rate: f64, fetched_at: DateTime<Utc>) -> Self {
        Self {
            funding_rate,
            funding_rate_pct: funding_rate * 100.0,
            funding_rate_annual_pct: funding_rate * 100.0 * 3.0 * 365.0,
            predicted_funding_rate: None,
            next_funding_time: None,
            open_interest_usd: None,
            open_interest_contracts: None,
            open_interest_timestamp: None,
            mark_price: None,
            fetched_at,
        }
    }
}

/// An exit plan attached to a position: thresholds and an optional
/// natural-language invalidation condition evaluated each mark-to-market.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitPlan {
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub invalidation: Option<String>,
}

/// One open position. At most one per symbol per portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_timestamp: DateTime<Utc>,
    pub mark_price: f64,
    pub confidence: f64,
    pub leverage: u32,
    pub exit_plan: ExitPlan,
}

impl Position {
    pub fn unrealized_pnl(&self) -> f64 {
        self.quantity * (self.mark_price - self.entry_price)
    }

    pub fn unrealized_pnl_pct(&self) -> f64 {
        let denom = (self.quantity * self.entry_price).abs();
        if denom == 0.0 {
            return 0.0;
        }
        self.unrealized_pnl() / denom * 100.0
    }

    pub fn notional(&self) -> f64 {
        self.quantity * self.mark_price
    }

    pub fn margin(&self) -> f64 {
        if self.leverage == 0 {
            return self.notional();
        }
        self.notional() / self.leverage as f64
    }
}

/// Immutable record of a realized trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub symbol: Symbol,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_timestamp: DateTime<Utc>,
    pub exit_timestamp: DateTime<Utc>,
    pub realized_pnl: f64,
    pub leverage: u32,
    pub exit_reason: ExitReason,
}

/// Every LLM decision, executed or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub action: DecisionAction,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub size_pct: Option<f64>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    pub executed: bool,
    #[serde(default)]
    pub chain_of_thought: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub user_payload: Option<String>,
    #[serde(default)]
    pub tool_payload_json: Option<serde_json::Value>,
}

/// One executed order line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLogEntry {
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub action: DecisionAction,
    pub quantity: f64,
    pub price: f64,
    #[serde(default)]
    pub leverage: Option<u32>,
    pub cash_after: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A rule learned from closed-trade feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedRule {
    pub id: Uuid,
    pub rule_text: String,
    pub rule_type: RuleType,
    #[serde(default)]
    pub source_trade_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    pub effectiveness_score: f64,
    pub times_applied: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl LearnedRule {
    pub fn new(rule_text: String, rule_type: RuleType, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_text,
            rule_type,
            source_trade_id: None,
            created_at,
            active: true,
            effectiveness_score: 0.5,
            times_applied: 0,
            metadata: serde_json::Value::Null,
        }
    }
}

/// A closed trade as seen by the feedback loop. `id` is `None` until
/// persisted (always the case in simulator mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub symbol: Symbol,
    pub action: DecisionAction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl_usd: f64,
    pub pnl_pct: f64,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub rule_ids: Vec<Uuid>,
    pub duration_seconds: i64,
}

/// The portfolio: one per running engine. `positions` holds at most one
/// `Position` per symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub portfolio_id: Uuid,
    pub starting_cash: f64,
    pub current_cash: f64,
    pub positions: HashMap<Symbol, Position>,
    pub trade_log: Vec<TradeLogEntry>,
    pub evaluation_log: Vec<EvaluationLogEntry>,
    pub closed_positions: Vec<ClosedPosition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Portfolio {
    /// Create a brand-new portfolio with no positions and no history.
    pub fn create_initial_state(starting_cash: f64, now: DateTime<Utc>) -> Self {
        Self {
            portfolio_id: Uuid::new_v4(),
            starting_cash,
            current_cash: starting_cash,
            positions: HashMap::new(),
            trade_log: Vec::new(),
            evaluation_log: Vec::new(),
            closed_positions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `current_cash + sum(notional(pos))` over all open positions.
    pub fn equity(&self) -> f64 {
        self.current_cash
            + self
                .positions
                .values()
                .map(Position::notional)
                .sum::<f64>()
    }

    /// Stamp `updated_at` to `now`. Called by every mutating operation.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}
