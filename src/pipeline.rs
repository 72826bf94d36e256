// =============================================================================
// DecisionPipeline — one evaluation run, end to end (§4.7)
// =============================================================================
//
// Orchestrates `MarketCache`/`ToolRegistry` (via the tool cache), the
// `PromptBuilder`, and the `LLMAgent`: gathers per-symbol market state,
// builds the prompt, drives the agent loop, parses and validates the
// resulting decisions, and appends an audit-trail line.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{BrokerPort, Decision};
use crate::domain::{normalize_symbol, DerivativesSnapshot, IndicatorSnapshot, Symbol};
use crate::error::AppError;
use crate::llm::agent::LLMAgent;
use crate::llm::chat::{ChatMessage, Role};
use crate::llm::prompt_builder::{
    AccountContext, HigherTimeframeContext, PositionContext, PromptBuilder, PromptContext, RiskSettingsContext,
    SymbolContext,
};
use crate::repository::Repository;
use crate::tools::cache::{ToolCache, ToolCacheRecord};
use crate::tools::registry::ToolRegistry;
use crate::types::DecisionAction;

/// Returned by a completed run.
#[derive(Debug, Clone)]
pub struct DecisionPipelineResult {
    pub prompt: String,
    pub response: Vec<Decision>,
    pub generated_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub tool_cache_snapshot: Vec<ToolCacheRecord>,
    pub agent_trace: Vec<ChatMessage>,
}

/// Top-level shape the LLM is instructed to emit: `{"decisions": [...],
/// "model_name": "..."}`. `model_name` is accepted but not surfaced further.
#[derive(Debug, Deserialize, Serialize)]
struct DecisionEnvelope {
    decisions: Vec<Decision>,
    #[serde(default)]
    #[allow(dead_code)]
    model_name: Option<String>,
}

pub struct DecisionPipeline {
    broker: Arc<dyn BrokerPort>,
    tools: Arc<ToolRegistry>,
    agent: LLMAgent,
    prompt_builder: PromptBuilder,
    repository: Option<Arc<dyn Repository>>,
    symbols: Vec<Symbol>,
    max_rules_in_prompt: usize,
    max_history_trades: usize,
    decision_trace_log_path: Option<PathBuf>,
    risk: RiskSettingsContext,
    started_at: DateTime<Utc>,
    invocation_count: AtomicU64,
}

impl DecisionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        tools: Arc<ToolRegistry>,
        agent: LLMAgent,
        short_timeframe: impl Into<String>,
        repository: Option<Arc<dyn Repository>>,
        symbols: &[String],
        max_rules_in_prompt: usize,
        max_history_trades: usize,
        decision_trace_log_path: Option<PathBuf>,
        risk: RiskSettingsContext,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            broker,
            tools,
            agent,
            prompt_builder: PromptBuilder::new(short_timeframe),
            repository,
            symbols: symbols.iter().map(|s| normalize_symbol(s)).collect(),
            max_rules_in_prompt,
            max_history_trades,
            decision_trace_log_path,
            risk,
            started_at,
            invocation_count: AtomicU64::new(0),
        }
    }

    /// Run one full evaluation cycle. Any failure inside the pipeline is
    /// logged and yields `None` rather than propagating — a skipped cycle is
    /// never fatal to the scheduler (§4.7 "Failure semantics").
    pub async fn run_once(&self) -> Option<DecisionPipelineResult> {
        let portfolio = match self.broker.get_portfolio_snapshot().await {
            Ok(Some(portfolio)) => portfolio,
            Ok(None) => {
                warn!("skipping decision evaluation; portfolio snapshot unavailable");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch portfolio snapshot");
                return None;
            }
        };

        if self.symbols.is_empty() {
            warn!("no symbols configured for decision pipeline");
            return None;
        }

        let run_id = Uuid::new_v4();
        let tool_cache = ToolCache::new();
        let generated_at = Utc::now();

        let mut symbol_contexts = Vec::with_capacity(self.symbols.len());
        let mut market_snapshots: HashMap<Symbol, f64> = HashMap::new();
        for symbol in &self.symbols {
            match self.gather_symbol_context(&tool_cache, symbol).await {
                Ok((ctx, last_price)) => {
                    market_snapshots.insert(symbol.clone(), last_price);
                    symbol_contexts.push(ctx);
                }
                Err(e) => {
                    warn!(%symbol, error = %e, "failed to gather market state; omitting symbol from this cycle");
                }
            }
        }

        let (rules, outcomes) = self.fetch_feedback().await;

        let account = self.build_account_context(&portfolio, &market_snapshots);
        let invocation_count = self.invocation_count.fetch_add(1, Ordering::SeqCst) + 1;
        let minutes_since_start = generated_at.signed_duration_since(self.started_at).num_minutes();

        let ctx = PromptContext {
            minutes_since_start,
            invocation_count,
            current_timestamp: generated_at,
            symbols: symbol_contexts,
            account,
        };
        let prompt = self.prompt_builder.build(&ctx, &rules, &outcomes);

        let agent_result = match self.agent.run(&prompt, &tool_cache).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "decision pipeline agent run failed");
                return None;
            }
        };

        let mut decisions = match parse_decisions(&agent_result.messages) {
            Ok(decisions) => decisions,
            Err(e) => {
                warn!(error = %e, "decision pipeline failed to parse a valid decision set");
                return None;
            }
        };

        let chain_of_thought = extract_chain_of_thought(&agent_result.messages, agent_result.final_text.as_deref());
        for decision in &mut decisions {
            if decision.chain_of_thought.is_none() {
                decision.chain_of_thought = Some(chain_of_thought.clone());
            }
        }

        let tool_cache_snapshot = tool_cache.snapshot(generated_at);
        self.write_trace(run_id, &prompt, &decisions, &tool_cache_snapshot, &agent_result.messages, generated_at);

        info!(run_id = %run_id, decisions = decisions.len(), "decision pipeline run complete");

        Some(DecisionPipelineResult {
            prompt,
            response: decisions,
            generated_at,
            run_id,
            tool_cache_snapshot,
            agent_trace: agent_result.messages,
        })
    }

    /// Fetch `live_market_data`, `indicator_calculator`, and
    /// `derivatives_data` for one symbol through the same `ToolRegistry` and
    /// `ToolCache` the agent itself will use, so the agent's own tool calls
    /// for the same symbol are cache hits.
    async fn gather_symbol_context(&self, tool_cache: &ToolCache, symbol: &str) -> Result<(SymbolContext, f64)> {
        let market = self
            .tools
            .call(tool_cache, "live_market_data", &serde_json::json!({ "symbol": symbol }))
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let last_price = market.get("last_price").and_then(|v| v.as_f64()).unwrap_or(0.0);

        let indicators_value = self
            .tools
            .call(tool_cache, "indicator_calculator", &serde_json::json!({ "symbol": symbol }))
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let indicators: IndicatorSnapshot = serde_json::from_value(indicators_value)?;

        let derivatives_value = self
            .tools
            .call(tool_cache, "derivatives_data", &serde_json::json!({ "symbol": symbol }))
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let derivatives: DerivativesSnapshot = serde_json::from_value(derivatives_value)?;

        let higher_timeframe = indicators.higher_timeframe.as_ref().map(|htf| HigherTimeframeContext {
            ema20: htf.ema20,
            atr3: htf.atr3,
            atr14: htf.atr14,
            volume: htf.volume,
            volume_ratio: htf.volume_ratio,
            macd_series: htf.macd_series.clone(),
            rsi14_series: htf.rsi14_series.clone(),
        });

        let ctx = SymbolContext {
            symbol: symbol.to_string(),
            current_price: last_price,
            ema20: indicators.ema20,
            macd: indicators.macd,
            rsi7: indicators.rsi7,
            open_interest_usd: derivatives.open_interest_usd,
            open_interest_contracts: derivatives.open_interest_contracts,
            open_interest_timestamp: derivatives.open_interest_timestamp,
            funding_rate: derivatives.funding_rate,
            funding_rate_pct: Some(derivatives.funding_rate_pct),
            funding_rate_annual_pct: Some(derivatives.funding_rate_annual_pct),
            predicted_funding_rate: derivatives.predicted_funding_rate,
            next_funding_time: derivatives.next_funding_time,
            ema20_series: indicators.ema20_series,
            macd_series: indicators.macd_series,
            rsi7_series: indicators.rsi7_series,
            rsi14_series: indicators.rsi14_series,
            higher_timeframe,
        };

        Ok((ctx, last_price))
    }

    async fn fetch_feedback(&self) -> (Vec<crate::domain::LearnedRule>, Vec<crate::domain::TradeOutcome>) {
        let Some(repo) = &self.repository else { return (Vec::new(), Vec::new()) };

        let rules = repo.fetch_active_rules(self.max_rules_in_prompt).await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to fetch active rules for prompt");
            Vec::new()
        });
        let outcomes = repo.fetch_recent_outcomes(self.max_history_trades).await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to fetch recent outcomes for prompt");
            Vec::new()
        });
        (rules, outcomes)
    }

    fn build_account_context(
        &self,
        portfolio: &crate::domain::Portfolio,
        market_snapshots: &HashMap<Symbol, f64>,
    ) -> AccountContext {
        let value = portfolio.equity();
        let return_pct = if portfolio.starting_cash > 0.0 {
            (value - portfolio.starting_cash) / portfolio.starting_cash * 100.0
        } else {
            0.0
        };

        let mut positions: Vec<&crate::domain::Position> = portfolio.positions.values().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let positions = positions
            .into_iter()
            .map(|pos| {
                let current_price = market_snapshots.get(&pos.symbol).copied().unwrap_or(pos.mark_price);
                PositionContext {
                    symbol: pos.symbol.clone(),
                    quantity: pos.quantity,
                    entry_price: pos.entry_price,
                    current_price,
                    unrealized_pnl: pos.unrealized_pnl(),
                    leverage: pos.leverage,
                    stop_loss: pos.exit_plan.stop_loss,
                    take_profit: pos.exit_plan.take_profit,
                    invalidation_condition: pos.exit_plan.invalidation.clone(),
                    confidence: pos.confidence,
                    notional_usd: pos.notional(),
                }
            })
            .collect();

        AccountContext {
            value,
            cash: portfolio.current_cash,
            return_pct,
            // TODO: derive from the realized-return series in closed_positions
            // once enough trade history accumulates.
            sharpe: 0.0,
            positions,
            risk: Some(self.risk.clone()),
        }
    }

    fn write_trace(
        &self,
        run_id: Uuid,
        prompt: &str,
        decisions: &[Decision],
        tool_cache_snapshot: &[ToolCacheRecord],
        messages: &[ChatMessage],
        generated_at: DateTime<Utc>,
    ) {
        let Some(path) = &self.decision_trace_log_path else { return };

        let payload = serde_json::json!({
            "run_id": run_id,
            "generated_at": generated_at,
            "prompt": prompt,
            "decisions": decisions,
            "tool_cache_snapshot": tool_cache_snapshot,
            "messages": messages,
        });

        let line = match serde_json::to_string(&payload) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize decision trace line");
                return;
            }
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, path = %path.display(), "failed to create decision trace log directory");
                return;
            }
        }

        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "failed to append decision trace line");
        }
    }
}

/// Scan `messages` from last to first for an assistant message whose content
/// parses as a decision set, per §4.6's parsing rule. Accepts either the
/// `{"decisions": [...], "model_name": "..."}` envelope or a bare array, and
/// falls back to extracting the first balanced `{...}`/`[...]` substring when
/// the model wrapped the JSON in extra prose.
fn parse_decisions(messages: &[ChatMessage]) -> Result<Vec<Decision>, AppError> {
    for message in messages.iter().rev() {
        if message.role != Role::Assistant {
            continue;
        }
        let Some(content) = &message.content else { continue };
        if let Some(decisions) = try_parse_decisions(content) {
            return validate_decisions(decisions);
        }
    }
    Err(AppError::validation("no assistant message contained a parseable decision set"))
}

fn try_parse_decisions(text: &str) -> Option<Vec<Decision>> {
    let trimmed = text.trim();

    if let Ok(envelope) = serde_json::from_str::<DecisionEnvelope>(trimmed) {
        return Some(envelope.decisions);
    }
    if let Ok(decisions) = serde_json::from_str::<Vec<Decision>>(trimmed) {
        return Some(decisions);
    }
    if let Some(object) = extract_balanced(trimmed, '{', '}') {
        if let Ok(envelope) = serde_json::from_str::<DecisionEnvelope>(object) {
            return Some(envelope.decisions);
        }
    }
    if let Some(array) = extract_balanced(trimmed, '[', ']') {
        if let Ok(decisions) = serde_json::from_str::<Vec<Decision>>(array) {
            return Some(decisions);
        }
    }
    None
}

/// Extract the first balanced `open...close` substring, tolerating nested
/// pairs and quoted strings.
fn extract_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn validate_decisions(mut decisions: Vec<Decision>) -> Result<Vec<Decision>, AppError> {
    for decision in &mut decisions {
        decision.symbol = normalize_symbol(&decision.symbol);

        if let Some(pct) = decision.size_pct {
            if !(0.0..=100.0).contains(&pct) {
                return Err(AppError::validation(format!("size_pct {pct} out of range [0,100] for {}", decision.symbol)));
            }
        }
        if let Some(leverage) = decision.leverage {
            if !(1..=20).contains(&leverage) {
                return Err(AppError::validation(format!("leverage {leverage} out of range [1,20] for {}", decision.symbol)));
            }
        }
        if let Some(confidence) = decision.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(AppError::validation(format!(
                    "confidence {confidence} out of range [0,1] for {}",
                    decision.symbol
                )));
            }
        }
        if let Some(bps) = decision.max_slippage_bps {
            if bps < 0.0 {
                return Err(AppError::validation(format!("max_slippage_bps {bps} must be >= 0 for {}", decision.symbol)));
            }
        }
        if matches!(decision.action, DecisionAction::Hold | DecisionAction::Close | DecisionAction::Buy | DecisionAction::Sell | DecisionAction::NoEntry) {
            // Exhaustive match above exists purely so a future new variant
            // fails to compile here rather than slipping through unvalidated.
        }
    }
    Ok(decisions)
}

/// Concatenate every assistant message's content that is not the final
/// decision JSON, matching `_extract_chain_of_thought` in the Python
/// original.
fn extract_chain_of_thought(messages: &[ChatMessage], final_text: Option<&str>) -> String {
    let parts: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .filter_map(|m| m.content.as_deref())
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .filter(|content| Some(*content) != final_text)
        .collect();

    if parts.is_empty() {
        "No explicit chain of thought recorded".to_string()
    } else {
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(content: &str) -> ChatMessage {
        ChatMessage::assistant(Some(content.to_string()), Vec::new())
    }

    #[test]
    fn parses_envelope_form() {
        let messages = vec![assistant(r#"{"decisions":[{"symbol":"btc","action":"HOLD"}],"model_name":"x"}"#)];
        let decisions = parse_decisions(&messages).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].symbol, "BTC");
    }

    #[test]
    fn parses_bare_array_form() {
        let messages = vec![assistant(r#"[{"symbol":"eth","action":"NO_ENTRY"}]"#)];
        let decisions = parse_decisions(&messages).unwrap();
        assert_eq!(decisions[0].action, DecisionAction::NoEntry);
    }

    #[test]
    fn extracts_json_wrapped_in_prose() {
        let messages = vec![assistant("Here is my answer:\n{\"decisions\":[{\"symbol\":\"sol\",\"action\":\"HOLD\"}]}\nThanks.")];
        let decisions = parse_decisions(&messages).unwrap();
        assert_eq!(decisions[0].symbol, "SOL");
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let messages = vec![assistant(r#"{"decisions":[{"symbol":"btc","action":"BUY","confidence":1.5}]}"#)];
        let err = parse_decisions(&messages).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn rejects_out_of_range_leverage() {
        let messages = vec![assistant(r#"{"decisions":[{"symbol":"btc","action":"BUY","leverage":25}]}"#)];
        let err = parse_decisions(&messages).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn picks_last_matching_assistant_message_when_multiple_present() {
        let messages = vec![
            assistant("I am thinking about this."),
            assistant(r#"{"decisions":[{"symbol":"btc","action":"HOLD"}]}"#),
        ];
        let decisions = parse_decisions(&messages).unwrap();
        assert_eq!(decisions.len(), 1);
    }

    #[test]
    fn chain_of_thought_excludes_final_decision_text() {
        let final_text = r#"{"decisions":[]}"#;
        let messages = vec![assistant("Reasoning step one."), assistant(final_text)];
        let cot = extract_chain_of_thought(&messages, Some(final_text));
        assert_eq!(cot, "Reasoning step one.");
    }

    #[test]
    fn chain_of_thought_defaults_when_nothing_to_report() {
        let messages = vec![assistant("{}")];
        let cot = extract_chain_of_thought(&messages, Some("{}"));
        assert_eq!(cot, "No explicit chain of thought recorded");
    }

    #[test]
    fn extract_balanced_ignores_braces_inside_strings() {
        let text = r#"prefix {"a": "}", "b": 1} suffix"#;
        let extracted = extract_balanced(text, '{', '}').unwrap();
        assert_eq!(extracted, r#"{"a": "}", "b": 1}"#);
    }
}
