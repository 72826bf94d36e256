// =============================================================================
// In-memory Repository — used by tests and as the simulator-mode fallback
// =============================================================================

use anyhow::Result;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::{LearnedRule, TradeOutcome};
use crate::repository::{BoxFuture, Repository};
use crate::types::RuntimeMode;

#[derive(Default)]
pub struct MemoryRepository {
    rules: RwLock<Vec<LearnedRule>>,
    outcomes: RwLock<Vec<TradeOutcome>>,
    runtime_mode: RwLock<Option<RuntimeMode>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryRepository {
    fn save_rule<'a>(&'a self, rule: &'a LearnedRule) -> BoxFuture<'a, Result<LearnedRule>> {
        Box::pin(async move {
            let mut rules = self.rules.write();
            rules.push(rule.clone());
            Ok(rule.clone())
        })
    }

    fn fetch_active_rules<'a>(&'a self, limit: usize) -> BoxFuture<'a, Result<Vec<LearnedRule>>> {
        Box::pin(async move {
            let rules = self.rules.read();
            Ok(rules
                .iter()
                .rev()
                .filter(|r| r.active)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn save_outcome<'a>(&'a self, outcome: &'a TradeOutcome) -> BoxFuture<'a, Result<TradeOutcome>> {
        Box::pin(async move {
            let mut outcomes = self.outcomes.write();
            let mut stored = outcome.clone();
            stored.id = Some(Uuid::new_v4());
            outcomes.push(stored.clone());
            Ok(stored)
        })
    }

    fn fetch_recent_outcomes<'a>(&'a self, limit: usize) -> BoxFuture<'a, Result<Vec<TradeOutcome>>> {
        Box::pin(async move {
            let outcomes = self.outcomes.read();
            Ok(outcomes.iter().rev().take(limit).cloned().collect())
        })
    }

    fn load_runtime_mode<'a>(&'a self) -> BoxFuture<'a, Result<Option<RuntimeMode>>> {
        Box::pin(async move { Ok(*self.runtime_mode.read()) })
    }

    fn save_runtime_mode<'a>(&'a self, mode: RuntimeMode) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            *self.runtime_mode.write() = Some(mode);
            Ok(())
        })
    }

    fn record_rule_application<'a>(&'a self, rule_id: Uuid) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut rules = self.rules.write();
            if let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) {
                rule.times_applied += 1;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RuleType;
    use chrono::Utc;

    #[tokio::test]
    async fn save_and_fetch_active_rules_newest_first() {
        let repo = MemoryRepository::new();
        let r1 = LearnedRule::new("Avoid buying when RSI > 70".into(), RuleType::Entry, Utc::now());
        let r2 = LearnedRule::new("Always use a stop loss".into(), RuleType::RiskManagement, Utc::now());
        repo.save_rule(&r1).await.unwrap();
        repo.save_rule(&r2).await.unwrap();

        let active = repo.fetch_active_rules(10).await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, r2.id);
    }

    #[tokio::test]
    async fn fetch_active_rules_excludes_inactive() {
        let repo = MemoryRepository::new();
        let mut rule = LearnedRule::new("Never pyramid into a loser".into(), RuleType::RiskManagement, Utc::now());
        rule.active = false;
        repo.save_rule(&rule).await.unwrap();
        assert!(repo.fetch_active_rules(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_outcome_assigns_id() {
        let repo = MemoryRepository::new();
        let outcome = TradeOutcome {
            id: None,
            symbol: "BTCUSDT".into(),
            action: crate::types::DecisionAction::Close,
            entry_price: 100.0,
            exit_price: 110.0,
            pnl_usd: 10.0,
            pnl_pct: 10.0,
            rationale: None,
            rule_ids: vec![],
            duration_seconds: 60,
        };
        let stored = repo.save_outcome(&outcome).await.unwrap();
        assert!(stored.id.is_some());
    }

    #[tokio::test]
    async fn runtime_mode_defaults_to_none_then_roundtrips() {
        let repo = MemoryRepository::new();
        assert_eq!(repo.load_runtime_mode().await.unwrap(), None);
        repo.save_runtime_mode(RuntimeMode::Paper).await.unwrap();
        assert_eq!(repo.load_runtime_mode().await.unwrap(), Some(RuntimeMode::Paper));
    }

    #[tokio::test]
    async fn record_rule_application_increments_counter() {
        let repo = MemoryRepository::new();
        let rule = LearnedRule::new("Always honor stop losses".into(), RuleType::RiskManagement, Utc::now());
        repo.save_rule(&rule).await.unwrap();
        repo.record_rule_application(rule.id).await.unwrap();
        let active = repo.fetch_active_rules(10).await.unwrap();
        assert_eq!(active[0].times_applied, 1);
    }
}
