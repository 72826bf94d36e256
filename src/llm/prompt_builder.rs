// =============================================================================
// PromptBuilder — deterministic prompt assembly
// =============================================================================
//
// Output is a single user-message string: session context, one block per
// symbol, the account/positions block, an optional feedback block, and a
// fixed `### TASK ###` instruction block the LLM must follow exactly.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::LearnedRule;
use crate::domain::TradeOutcome;

fn round6(x: f64) -> f64 {
    (x * 1_000_000.0).round() / 1_000_000.0
}

fn fmt_series(values: &[f64]) -> String {
    let rounded: Vec<f64> = values.iter().copied().map(round6).collect();
    serde_json::to_string(&rounded).unwrap_or_else(|_| "[]".to_string())
}

#[derive(Debug, Clone)]
pub struct HigherTimeframeContext {
    pub ema20: f64,
    pub atr3: f64,
    pub atr14: f64,
    pub volume: f64,
    pub volume_ratio: f64,
    pub macd_series: Vec<f64>,
    pub rsi14_series: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SymbolContext {
    pub symbol: String,
    pub current_price: f64,
    pub ema20: f64,
    pub macd: f64,
    pub rsi7: f64,
    pub open_interest_usd: Option<f64>,
    pub open_interest_contracts: Option<f64>,
    pub open_interest_timestamp: Option<DateTime<Utc>>,
    pub funding_rate: f64,
    pub funding_rate_pct: Option<f64>,
    pub funding_rate_annual_pct: Option<f64>,
    pub predicted_funding_rate: Option<f64>,
    pub next_funding_time: Option<DateTime<Utc>>,
    pub ema20_series: Vec<f64>,
    pub macd_series: Vec<f64>,
    pub rsi7_series: Vec<f64>,
    pub rsi14_series: Vec<f64>,
    pub higher_timeframe: Option<HigherTimeframeContext>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionContext {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub invalidation_condition: Option<String>,
    pub confidence: f64,
    pub notional_usd: f64,
}

#[derive(Debug, Clone)]
pub struct RiskSettingsContext {
    pub confidence_entry_threshold: f64,
    pub max_gross_exposure_pct: f64,
    pub min_cash_buffer_pct: f64,
    pub position_size_limit_pct: f64,
}

#[derive(Debug, Clone)]
pub struct AccountContext {
    pub value: f64,
    pub cash: f64,
    pub return_pct: f64,
    pub sharpe: f64,
    pub positions: Vec<PositionContext>,
    pub risk: Option<RiskSettingsContext>,
}

#[derive(Debug, Clone)]
pub struct PromptContext {
    pub minutes_since_start: i64,
    pub invocation_count: u64,
    pub current_timestamp: DateTime<Utc>,
    pub symbols: Vec<SymbolContext>,
    pub account: AccountContext,
}

pub struct PromptBuilder {
    short_timeframe: String,
}

impl PromptBuilder {
    pub fn new(short_timeframe: impl Into<String>) -> Self {
        Self { short_timeframe: short_timeframe.into() }
    }

    /// Assemble the full user prompt. `rules`/`outcomes` are the feedback
    /// lists; when both are empty the feedback block is omitted entirely.
    pub fn build(&self, ctx: &PromptContext, rules: &[LearnedRule], outcomes: &[TradeOutcome]) -> String {
        let mut lines: Vec<String> = Vec::new();

        lines.push("SESSION CONTEXT".to_string());
        lines.push(format!("- Minutes since trading started: {}", ctx.minutes_since_start));
        lines.push(format!("- Invocation count: {}", ctx.invocation_count));
        lines.push(format!("- Current time: {}", ctx.current_timestamp.to_rfc3339()));
        lines.push(String::new());
        lines.push(format!("It has been {} minutes since trading began.", ctx.minutes_since_start));
        lines.push(format!("You are now being invoked for the {}-th time.", ctx.invocation_count));
        lines.push("Below is the full market, indicator, and account state you must use to reason and decide your next actions.".to_string());
        lines.push(String::new());
        lines.push(format!("All intraday data is sampled at {} intervals, ordered OLDEST → NEWEST.", self.short_timeframe));
        lines.push("If a different interval is used for a symbol, it is explicitly stated in that section.".to_string());
        lines.push(String::new());
        lines.push("### CURRENT MARKET STATE".to_string());
        lines.push(String::new());

        for symbol_ctx in &ctx.symbols {
            lines.extend(Self::build_symbol_section(symbol_ctx));
        }

        lines.push("### ACCOUNT INFORMATION & PERFORMANCE ###".to_string());
        lines.push(String::new());
        let account = &ctx.account;
        lines.push(format!("Account Value = {}", round6(account.value)));
        lines.push(format!("Available Cash = {}", round6(account.cash)));
        lines.push(format!("Total Return (%) = {}", round6(account.return_pct)));
        lines.push(format!("Sharpe Ratio = {}", round6(account.sharpe)));
        lines.push(String::new());
        lines.push("Open Positions:".to_string());
        lines.push("[".to_string());
        let last_idx = account.positions.len().saturating_sub(1);
        for (idx, position) in account.positions.iter().enumerate() {
            let json = serde_json::to_string(position).unwrap_or_default();
            let suffix = if idx == last_idx { "" } else { "," };
            lines.push(format!("  {json}{suffix}"));
        }
        lines.push("]".to_string());
        lines.push(String::new());

        if let Some(risk) = &account.risk {
            lines.push("Risk Settings (read-only):".to_string());
            lines.push(format!("- confidence_entry_threshold = {}", risk.confidence_entry_threshold));
            lines.push(format!("- max_gross_exposure_pct = {}", risk.max_gross_exposure_pct));
            lines.push(format!("- min_cash_buffer_pct = {}", risk.min_cash_buffer_pct));
            lines.push(format!("- position_size_limit_pct = {}", risk.position_size_limit_pct));
            lines.push(String::new());
        }

        let feedback_block = Self::build_feedback_block(rules, outcomes);
        if let Some(feedback_block) = feedback_block {
            lines.push(feedback_block);
            lines.push(String::new());
        }

        lines.push("### TASK ###".to_string());
        lines.push(String::new());
        lines.extend(Self::task_instructions().into_iter().map(str::to_string));

        lines.join("\n")
    }

    fn build_symbol_section(ctx: &SymbolContext) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!("## {}", ctx.symbol));
        lines.push(format!("current_price = {}", round6(ctx.current_price)));
        lines.push(format!("current_ema20 = {}", round6(ctx.ema20)));
        lines.push(format!("current_macd = {}", round6(ctx.macd)));
        lines.push(format!("current_rsi7 = {}", round6(ctx.rsi7)));

        if let Some(oi) = ctx.open_interest_usd {
            lines.push(format!("Open Interest (USD): {}", round6(oi)));
        }
        if let Some(contracts) = ctx.open_interest_contracts {
            lines.push(format!("Open Interest (contracts): {}", round6(contracts)));
        }
        if let Some(ts) = ctx.open_interest_timestamp {
            lines.push(format!("Open Interest Timestamp: {}", ts.to_rfc3339()));
        }

        let funding_line = match ctx.funding_rate_pct {
            Some(pct) => format!("Funding Rate: {}% ({})", round6(pct), round6(ctx.funding_rate)),
            None => format!("Funding Rate (decimal): {}", round6(ctx.funding_rate)),
        };
        lines.push(funding_line);
        if let Some(annual) = ctx.funding_rate_annual_pct {
            lines.push(format!("Funding Rate Annualized: {}%", round6(annual)));
        }
        if let Some(predicted) = ctx.predicted_funding_rate {
            lines.push(format!("Predicted Next Funding Rate: {}", round6(predicted)));
        }
        if let Some(next) = ctx.next_funding_time {
            lines.push(format!("Next Funding Time: {}", next.to_rfc3339()));
        }

        lines.push(format!("EMA20 series: {}", fmt_series(&ctx.ema20_series)));
        lines.push(format!("MACD series: {}", fmt_series(&ctx.macd_series)));
        lines.push(format!("RSI7 series: {}", fmt_series(&ctx.rsi7_series)));
        lines.push(format!("RSI14 series: {}", fmt_series(&ctx.rsi14_series)));

        if let Some(htf) = &ctx.higher_timeframe {
            lines.push("Higher timeframe:".to_string());
            lines.push(format!("  ema20 = {}, atr3 = {}, atr14 = {}", round6(htf.ema20), round6(htf.atr3), round6(htf.atr14)));
            lines.push(format!("  volume = {}, volume_ratio = {}", round6(htf.volume), round6(htf.volume_ratio)));
            lines.push(format!("  macd series: {}", fmt_series(&htf.macd_series)));
            lines.push(format!("  rsi14 series: {}", fmt_series(&htf.rsi14_series)));
        }

        lines.push(String::new());
        lines
    }

    /// Built before `### TASK ###` per §4.5: "never after — so the LLM
    /// reads rules before task instructions."
    fn build_feedback_block(rules: &[LearnedRule], outcomes: &[TradeOutcome]) -> Option<String> {
        if rules.is_empty() && outcomes.is_empty() {
            return None;
        }
        let mut lines = vec!["### LEARNED RULES & RECENT OUTCOMES ###".to_string(), String::new()];

        if !rules.is_empty() {
            lines.push("Active rules (apply these unless they conflict with a safety rule):".to_string());
            for rule in rules {
                lines.push(format!("- [{}] {}", rule.rule_type, rule.rule_text));
            }
            lines.push(String::new());
        }

        if !outcomes.is_empty() {
            lines.push("Recent closed-trade outcomes:".to_string());
            for outcome in outcomes {
                lines.push(format!(
                    "- {} {}: entry {} -> exit {}, pnl {} ({}%)",
                    outcome.symbol,
                    outcome.action,
                    round6(outcome.entry_price),
                    round6(outcome.exit_price),
                    round6(outcome.pnl_usd),
                    round6(outcome.pnl_pct)
                ));
            }
            lines.push(String::new());
        }

        Some(lines.join("\n"))
    }

    fn task_instructions() -> [&'static str; 13] {
        [
            "Act on every evaluation cycle and follow all rules below exactly.",
            "",
            "--- 1. EXIT EVALUATION (per open position) ---",
            "For each open position: CLOSE on stop_loss or take_profit breach, or when invalidation_condition is met; otherwise HOLD.",
            "",
            "--- 2. NEW ENTRY CONDITIONS ---",
            "Consider a new entry only when there is no existing position in the symbol, confidence is high enough, and free cash and exposure limits allow it. If entry conditions are not met, output NO_ENTRY with a rationale.",
            "",
            "--- 3. SAFETY RULES ---",
            "Never pyramid into an existing position. Never hold opposite-side exposure in the same symbol. If any required indicator is missing or NaN, default to HOLD.",
            "",
            "--- 4. OUTPUT FORMAT ---",
            "Respond with ONLY the JSON object described in the system prompt: {\"decisions\": [...], \"model_name\": \"...\"}. Include one decision per evaluated symbol, in input order.",
            "End of data.",
        ]
    }
}
