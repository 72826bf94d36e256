// =============================================================================
// FeedbackEngine — critique, rule generation, validation, dedup (§4.10)
// =============================================================================
//
// Pure in-context self-improvement: no external RL model or fine-tuning. Each
// closed trade is critiqued by the LLM, turned into a candidate rule, run
// through a fixed validation/deduplication/classification pipeline, and
// persisted if a `Repository` is connected. Any step failing returns `None`
// rather than propagating, matching §4.10's "failures are never fatal to the
// broader cycle".
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::domain::{LearnedRule, TradeOutcome};
use crate::llm::chat::{ChatLLM, ChatMessage};
use crate::repository::Repository;
use crate::types::RuleType;

const MIN_RULE_LENGTH: usize = 10;
const MAX_RULE_LENGTH: usize = 200;
/// §4.10 point 4 and §8's testable property both state 0.7.
const DUPLICATE_JACCARD_THRESHOLD: f64 = 0.7;
const RECENT_RULES_LIMIT: usize = 50;

const ACTION_VERBS: &[&str] = &[
    "avoid", "only", "require", "never", "always", "when", "if", "unless", "must", "should", "enter", "exit", "close",
    "hold", "reduce", "increase", "limit", "set", "use", "wait", "skip",
];

const VAGUE_MARKERS: &[&str] =
    &["maybe", "try to", "might want", "could be", "perhaps", "possibly", "potentially", "think about"];

const RULE_PREFIXES: &[&str] = &["New Rule:", "Rule:", "Decision Rule:"];

pub struct FeedbackEngine {
    chat: Arc<dyn ChatLLM>,
    repository: Option<Arc<dyn Repository>>,
}

impl FeedbackEngine {
    pub fn new(chat: Arc<dyn ChatLLM>, repository: Option<Arc<dyn Repository>>) -> Self {
        Self { chat, repository }
    }

    /// Run one closed trade through the full feedback cycle. Returns `None`
    /// if any step rejects the candidate rule, or the LLM/repository fails
    /// outright — the caller (`OutcomeTracker`) treats both the same way.
    pub async fn process_closed_trade(&self, outcome: &TradeOutcome) -> Result<Option<LearnedRule>> {
        info!(symbol = %outcome.symbol, pnl_pct = outcome.pnl_pct, "processing feedback for closed trade");

        let critique = self.generate_critique(outcome).await;

        let Some(rule_text) = self.generate_rule(outcome, &critique).await else {
            info!("no rule generated (LLM returned empty/invalid response)");
            return Ok(None);
        };

        if !validate_rule(&rule_text) {
            warn!(rule = %rule_text, "rule validation failed");
            return Ok(None);
        }

        if self.is_duplicate_rule(&rule_text).await {
            info!(rule = %rule_text, "rule rejected as duplicate");
            return Ok(None);
        }

        let rule_type = classify_rule_type(&rule_text);
        let mut rule = LearnedRule::new(rule_text, rule_type, Utc::now());
        rule.source_trade_id = outcome.id;
        rule.metadata = serde_json::json!({
            "pnl_pct": outcome.pnl_pct,
            "symbol": outcome.symbol,
            "action": outcome.action,
            "duration_seconds": outcome.duration_seconds,
            "critique": critique,
        });

        if let Some(repo) = &self.repository {
            match repo.save_rule(&rule).await {
                Ok(saved) => {
                    info!(rule = %saved.rule_text, rule_type = %saved.rule_type, "new rule generated and saved");
                    return Ok(Some(saved));
                }
                Err(e) => warn!(error = %e, "failed to save learned rule, returning unpersisted"),
            }
        }

        info!(rule = %rule.rule_text, rule_type = %rule.rule_type, "new rule generated (not persisted)");
        Ok(Some(rule))
    }

    /// Ask the LLM for a 1-2 sentence critique; fall back to a templated
    /// string on an empty/too-short response or an outright error.
    async fn generate_critique(&self, outcome: &TradeOutcome) -> String {
        let duration_minutes = outcome.duration_seconds / 60;
        let result_label = if outcome.pnl_pct > 0.0 { "SUCCESS" } else { "LOSS" };
        let outcome_verb = if outcome.pnl_pct > 0.0 { "win" } else { "lose" };
        let rationale = outcome.rationale.as_deref().unwrap_or("none given");

        let prompt = format!(
            "Analyze this completed trade and provide a concise critique (1-2 sentences):\n\n\
             Trade Details:\n\
             - Symbol: {}\n\
             - Action: {}\n\
             - Entry: ${:.2}\n\
             - Exit: ${:.2}\n\
             - PnL: {:+.2}%\n\
             - Duration: {} minutes\n\
             - Original Rationale: {}\n\n\
             Result: {result_label}\n\n\
             Why did this trade {outcome_verb}? Be specific and actionable.\n\n\
             Critique:",
            outcome.symbol, outcome.action, outcome.entry_price, outcome.exit_price, outcome.pnl_pct, duration_minutes, rationale
        );

        let fallback = || format!("Trade resulted in {:+.2}% PnL. Original rationale: {rationale}", outcome.pnl_pct);

        match self.chat.complete(&[ChatMessage::user(prompt)], &[]).await {
            Ok(completion) => {
                let critique = completion.content.unwrap_or_default().trim().to_string();
                if critique.len() < MIN_RULE_LENGTH {
                    fallback()
                } else {
                    critique
                }
            }
            Err(e) => {
                warn!(error = %e, "error generating critique");
                fallback()
            }
        }
    }

    /// Ask the LLM for one new rule derived from the critique; strips known
    /// prefixes and enforces the length bound. Returns `None` on any
    /// failure — this is distinct from `_validate_rule`'s richer checks.
    async fn generate_rule(&self, outcome: &TradeOutcome, critique: &str) -> Option<String> {
        let focus = if outcome.pnl_pct > 0.0 { "reinforcing what made this trade successful" } else { "avoiding this mistake in the future" };

        let prompt = format!(
            "Based on this trade critique, write ONE new decision rule to improve future trading.\n\n\
             Critique: {critique}\n\n\
             Trade Context:\n\
             - Symbol: {}\n\
             - PnL: {:+.2}%\n\
             - Action: {}\n\n\
             Requirements:\n\
             - Be specific and actionable\n\
             - Start with a verb (e.g., \"Avoid\", \"Only\", \"Require\", \"Never\", \"Always\")\n\
             - Keep under 30 words\n\
             - Focus on {focus}\n\n\
             New Rule:",
            outcome.symbol, outcome.pnl_pct, outcome.action
        );

        let completion = match self.chat.complete(&[ChatMessage::user(prompt)], &[]).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "error generating rule");
                return None;
            }
        };

        let mut rule = completion.content.unwrap_or_default().trim().to_string();
        for prefix in RULE_PREFIXES {
            if let Some(stripped) = rule.strip_prefix(prefix) {
                rule = stripped.trim().to_string();
                break;
            }
        }

        if rule.len() < MIN_RULE_LENGTH || rule.len() > MAX_RULE_LENGTH {
            warn!(len = rule.len(), "rule length out of bounds");
            return None;
        }

        Some(rule)
    }

    async fn is_duplicate_rule(&self, candidate: &str) -> bool {
        let Some(repo) = &self.repository else { return false };
        match repo.fetch_active_rules(RECENT_RULES_LIMIT).await {
            Ok(rules) => rules.iter().any(|r| jaccard_similarity(candidate, &r.rule_text) > DUPLICATE_JACCARD_THRESHOLD),
            Err(e) => {
                warn!(error = %e, "error checking duplicates, failing open");
                false
            }
        }
    }
}

/// §4.10 point 3's five validation predicates.
fn validate_rule(rule_text: &str) -> bool {
    if rule_text.len() < MIN_RULE_LENGTH || rule_text.len() > MAX_RULE_LENGTH {
        return false;
    }

    let lower = rule_text.to_ascii_lowercase();

    if !ACTION_VERBS.iter().any(|verb| lower.contains(verb)) {
        return false;
    }

    if VAGUE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return false;
    }

    if lower.contains("consider") && !["if", "when", "unless", "after"].iter().any(|w| lower.contains(w)) {
        return false;
    }

    if rule_text.ends_with('.') {
        let head = &lower[..lower.len().min(20)];
        if !ACTION_VERBS.iter().any(|verb| head.contains(verb)) {
            return false;
        }
    }

    true
}

fn classify_rule_type(rule_text: &str) -> RuleType {
    let lower = rule_text.to_ascii_lowercase();

    if ["stop loss", "stop-loss", "drawdown", "risk more", "invalidation", "protect", "hedge"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return RuleType::RiskManagement;
    }

    if ["exit", "close position", "close all", "take profit", "tp", "scale out", "lock in", "trail"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return RuleType::Exit;
    }

    let mentions_sizing =
        ["size", "position size", "allocation", "capital", "exposure", "leverage", "quantity"].iter().any(|w| lower.contains(w));
    let mentions_exit = lower.contains("exit") || lower.contains("close");
    if mentions_sizing && !mentions_exit {
        return RuleType::PositionSizing;
    }

    if lower.contains('%') || lower.contains("percent") {
        if ["gain", "profit", "reaches"].iter().any(|w| lower.contains(w)) {
            return RuleType::Exit;
        }
        if ["risk", "loss", "stop"].iter().any(|w| lower.contains(w)) {
            return RuleType::RiskManagement;
        }
        return RuleType::PositionSizing;
    }

    RuleType::Entry
}

/// Case-insensitive whitespace-tokenized Jaccard similarity, per §4.10 point 4.
fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let words_a: HashSet<&str> = a.to_ascii_lowercase().split_whitespace().collect::<Vec<_>>().into_iter().collect();
    let words_b: HashSet<String> = b.to_ascii_lowercase().split_whitespace().map(str::to_string).collect();
    let words_b: HashSet<&str> = words_b.iter().map(String::as_str).collect();

    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();

    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vague_rule_is_rejected() {
        assert!(!validate_rule("Maybe consider checking RSI before entry"));
    }

    #[test]
    fn actionable_rule_is_accepted() {
        assert!(validate_rule("Avoid long entries when RSI > 70 on 4h"));
    }

    #[test]
    fn accepted_rule_is_classified_as_entry() {
        assert_eq!(classify_rule_type("Avoid long entries when RSI > 70 on 4h"), RuleType::Entry);
    }

    #[test]
    fn rule_too_short_is_rejected() {
        assert!(!validate_rule("Avoid it"));
    }

    #[test]
    fn rule_without_actionable_verb_is_rejected() {
        assert!(!validate_rule("The market moved sideways for a while today"));
    }

    #[test]
    fn standalone_consider_without_conditional_is_rejected() {
        assert!(!validate_rule("Consider adjusting stop loss after major news events happen"));
    }

    #[test]
    fn consider_inside_conditional_is_allowed() {
        assert!(validate_rule("When volatility spikes, consider reducing position size immediately"));
    }

    #[test]
    fn trailing_period_without_leading_verb_is_rejected() {
        assert!(!validate_rule("This particular trade went quite poorly overall today."));
    }

    #[test]
    fn classification_prioritizes_risk_management() {
        assert_eq!(classify_rule_type("Always use a stop-loss when entering volatile pairs"), RuleType::RiskManagement);
    }

    #[test]
    fn classification_detects_exit_keywords() {
        assert_eq!(classify_rule_type("Always take profit when gains exceed 10 percent"), RuleType::Exit);
    }

    #[test]
    fn classification_detects_position_sizing() {
        assert_eq!(classify_rule_type("Always limit position size when leverage exceeds 5x"), RuleType::PositionSizing);
    }

    #[test]
    fn jaccard_similarity_detects_near_duplicate() {
        let sim = jaccard_similarity("Avoid buying when RSI > 70", "Avoid buying when RSI is above 70");
        assert!(sim > DUPLICATE_JACCARD_THRESHOLD, "similarity was {sim}");
    }

    #[test]
    fn jaccard_similarity_low_for_unrelated_rules() {
        let sim = jaccard_similarity("Avoid buying when RSI > 70", "Always use a stop-loss on leveraged positions");
        assert!(sim < DUPLICATE_JACCARD_THRESHOLD);
    }
}
