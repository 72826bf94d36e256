// =============================================================================
// DecisionScheduler — slow periodic decision cycle with pause/trigger (§4.11)
// =============================================================================
//
// Drives `DecisionPipeline::run_once` on a timer (default 3-5 minutes),
// independent of `MarketDataScheduler`'s fast loop; the two communicate only
// through `MarketCache`, never share mutable state directly (§5). A
// `tokio::sync::Mutex` around the tick body guarantees no two ticks ever run
// concurrently. `pause`/`resume` only gate the periodic timer path;
// `trigger` always runs regardless of pause state.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::factory::{BrokerFactory, BrokerHandle};
use crate::broker::{BrokerPort, Decision, ExecutionContext};
use crate::domain::Symbol;
use crate::llm::chat::{ChatMessage, Role};
use crate::pipeline::{DecisionPipeline, DecisionPipelineResult};
use crate::runtime_controller::RuntimeController;

/// Bound on how many past `DecisionPipelineResult`s the scheduler keeps
/// in memory for `/decisions` and `/decisions/{id}`.
const DECISION_HISTORY_CAPACITY: usize = 200;

/// Ring buffer of recent decision runs, newest first.
#[derive(Default)]
pub struct DecisionHistory {
    entries: parking_lot::RwLock<VecDeque<Arc<DecisionPipelineResult>>>,
}

impl DecisionHistory {
    fn push(&self, result: Arc<DecisionPipelineResult>) {
        let mut entries = self.entries.write();
        entries.push_front(result);
        entries.truncate(DECISION_HISTORY_CAPACITY);
    }

    /// Newest-first, optionally filtered to one symbol (a run matches if any
    /// of its decisions named that symbol).
    pub fn recent(&self, symbol: Option<&str>, limit: usize) -> Vec<Arc<DecisionPipelineResult>> {
        self.entries
            .read()
            .iter()
            .filter(|r| match symbol {
                Some(s) => r.response.iter().any(|d| d.symbol.eq_ignore_ascii_case(s)),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn by_id(&self, run_id: Uuid) -> Option<Arc<DecisionPipelineResult>> {
        self.entries.read().iter().find(|r| r.run_id == run_id).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub paused: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u64,
    pub total_runs: u64,
}

pub struct DecisionScheduler {
    pipeline: Arc<DecisionPipeline>,
    runtime_controller: Arc<RuntimeController>,
    broker_factory: Arc<dyn BrokerFactory>,
    broker_handle: Arc<BrokerHandle>,
    tick_interval: Duration,
    state: parking_lot::RwLock<SchedulerState>,
    paused: AtomicBool,
    stopped: AtomicBool,
    consecutive_failures: AtomicU64,
    total_runs: AtomicU64,
    evaluations_success: AtomicU64,
    evaluations_failure: AtomicU64,
    last_run_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    wake: Notify,
    run_lock: tokio::sync::Mutex<()>,
    history: DecisionHistory,
}

impl DecisionScheduler {
    pub fn new(
        pipeline: Arc<DecisionPipeline>,
        runtime_controller: Arc<RuntimeController>,
        broker_factory: Arc<dyn BrokerFactory>,
        broker_handle: Arc<BrokerHandle>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            runtime_controller,
            broker_factory,
            broker_handle,
            tick_interval,
            state: parking_lot::RwLock::new(SchedulerState::Idle),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            consecutive_failures: AtomicU64::new(0),
            total_runs: AtomicU64::new(0),
            evaluations_success: AtomicU64::new(0),
            evaluations_failure: AtomicU64::new(0),
            last_run_at: parking_lot::RwLock::new(None),
            wake: Notify::new(),
            run_lock: tokio::sync::Mutex::new(()),
            history: DecisionHistory::default(),
        }
    }

    /// `(success, failure)` cumulative tick counts, surfaced as
    /// `scheduler_evaluations_total{result=…}` on `/metrics`.
    pub fn evaluation_counts(&self) -> (u64, u64) {
        (
            self.evaluations_success.load(Ordering::SeqCst),
            self.evaluations_failure.load(Ordering::SeqCst),
        )
    }

    pub fn recent_decisions(&self, symbol: Option<&str>, limit: usize) -> Vec<Arc<DecisionPipelineResult>> {
        self.history.recent(symbol, limit)
    }

    pub fn decision_by_id(&self, run_id: Uuid) -> Option<Arc<DecisionPipelineResult>> {
        self.history.by_id(run_id)
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: *self.state.read(),
            paused: self.paused.load(Ordering::SeqCst),
            last_run_at: *self.last_run_at.read(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            total_runs: self.total_runs.load(Ordering::SeqCst),
        }
    }

    /// Arm the periodic timer. Idempotent: calling `start` while already
    /// running has no effect beyond clearing a prior `stop`.
    pub fn start(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Suppress tick execution on the periodic timer; the timer itself keeps
    /// counting, so a `resume` does not cause an immediate catch-up run.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Cancel the periodic timer. A tick already in progress runs to
    /// completion; `run` exits its loop once that tick finishes.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Run one tick immediately, ignoring `paused`. Waits for any in-flight
    /// tick to finish first via `run_lock`.
    pub async fn trigger(&self) {
        self.run_tick().await;
    }

    /// Drive the periodic loop until `stop` is called. Intended to be
    /// spawned as its own task for the lifetime of the process.
    pub async fn run(self: Arc<Self>) {
        self.stopped.store(false, Ordering::SeqCst);
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if self.paused.load(Ordering::SeqCst) {
                continue;
            }
            self.run_tick().await;
        }
    }

    async fn run_tick(&self) {
        let _guard = self.run_lock.lock().await;
        *self.state.write() = SchedulerState::Running;
        *self.last_run_at.write() = Some(Utc::now());

        let mode = self.runtime_controller.current();
        let broker = self.broker_factory.build(mode);
        self.broker_handle.swap(broker.clone());

        let result = self.pipeline.run_once().await;
        if let Some(result) = &result {
            self.history.push(Arc::new(result.clone()));
        }
        let outcome = self.execute_against_broker(&broker, result).await;

        match outcome {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.evaluations_success.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                let n = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                self.evaluations_failure.fetch_add(1, Ordering::SeqCst);
                warn!(error = %e, consecutive_failures = n, "decision scheduler tick failed");
            }
        }
        self.total_runs.fetch_add(1, Ordering::SeqCst);
        *self.state.write() = SchedulerState::Idle;
    }

    async fn execute_against_broker(
        &self,
        broker: &Arc<dyn BrokerPort>,
        result: Option<DecisionPipelineResult>,
    ) -> Result<()> {
        let Some(result) = result else {
            // An abstained cycle (no portfolio, no symbols, agent failure) is
            // not itself a scheduler failure — it was already logged by the
            // pipeline.
            return Ok(());
        };

        let market_snapshots = build_market_snapshots(&result.agent_trace, &result.response);
        let context = ExecutionContext {
            system_prompt: String::new(),
            user_payload: result.prompt.clone(),
            tool_payload_json: None,
        };

        let messages = broker.execute(&result.response, &market_snapshots, &context).await?;
        for message in &messages {
            info!(run_id = %result.run_id, "{message}");
        }

        broker.process_pending_feedback().await?;
        broker.mark_to_market(&market_snapshots).await?;
        Ok(())
    }
}

/// Reconstruct symbol → last-price from the agent's tool-calling trace: find
/// each `Role::Tool` message's originating `live_market_data` or
/// `indicator_calculator` call, parse its JSON result, and read
/// `last_price`/`price`. Falls back to the decision's own
/// `take_profit | stop_loss | quantity` (first positive value) when no tool
/// price is found for that symbol, per §4.11 point 4.
fn build_market_snapshots(trace: &[ChatMessage], decisions: &[Decision]) -> HashMap<Symbol, f64> {
    let mut calls: HashMap<&str, &crate::llm::chat::ToolCall> = HashMap::new();
    for message in trace {
        if message.role != Role::Assistant {
            continue;
        }
        for call in &message.tool_calls {
            calls.insert(call.id.as_str(), call);
        }
    }

    let mut snapshots = HashMap::new();
    for message in trace {
        if message.role != Role::Tool {
            continue;
        }
        let Some(call_id) = &message.tool_call_id else { continue };
        let Some(call) = calls.get(call_id.as_str()) else { continue };
        if call.name != "live_market_data" && call.name != "indicator_calculator" {
            continue;
        }
        let Some(symbol) = call.arguments.get("symbol").and_then(|v| v.as_str()) else { continue };
        let symbol = crate::domain::normalize_symbol(symbol);
        if snapshots.contains_key(&symbol) {
            continue;
        }

        let Some(content) = &message.content else { continue };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(content) else { continue };
        let price = value
            .get("last_price")
            .or_else(|| value.get("price"))
            .and_then(|v| v.as_f64());

        if let Some(price) = price {
            snapshots.insert(symbol, price);
        }
    }

    for decision in decisions {
        let symbol = crate::domain::normalize_symbol(&decision.symbol);
        if snapshots.contains_key(&symbol) {
            continue;
        }
        let fallback = [decision.take_profit, decision.stop_loss, decision.quantity]
            .into_iter()
            .flatten()
            .find(|p| *p > 0.0);
        if let Some(price) = fallback {
            snapshots.insert(symbol, price);
        }
    }

    snapshots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::ToolCall;

    fn tool_call(id: &str, name: &str, symbol: &str) -> ChatMessage {
        ChatMessage::assistant(
            None,
            vec![ToolCall { id: id.to_string(), name: name.to_string(), arguments: serde_json::json!({ "symbol": symbol }) }],
        )
    }

    #[test]
    fn extracts_last_price_from_live_market_data_tool_result() {
        let trace = vec![
            tool_call("1", "live_market_data", "BTC-USDT-SWAP"),
            ChatMessage::tool_result("1", r#"{"last_price": 65000.5}"#),
        ];
        let snapshots = build_market_snapshots(&trace, &[]);
        assert_eq!(snapshots.get("BTC-USDT-SWAP"), Some(&65000.5));
    }

    #[test]
    fn extracts_price_field_from_indicator_calculator_tool_result() {
        let trace = vec![
            tool_call("1", "indicator_calculator", "ETH-USDT-SWAP"),
            ChatMessage::tool_result("1", r#"{"price": 3200.0, "rsi14": 55.0}"#),
        ];
        let snapshots = build_market_snapshots(&trace, &[]);
        assert_eq!(snapshots.get("ETH-USDT-SWAP"), Some(&3200.0));
    }

    #[test]
    fn ignores_tool_results_for_unrelated_tools() {
        let trace = vec![
            tool_call("1", "derivatives_data", "BTC-USDT-SWAP"),
            ChatMessage::tool_result("1", r#"{"funding_rate": 0.0001}"#),
        ];
        let snapshots = build_market_snapshots(&trace, &[]);
        assert!(snapshots.is_empty());
    }

    #[test]
    fn first_matching_tool_result_wins_for_a_symbol() {
        let trace = vec![
            tool_call("1", "live_market_data", "BTC-USDT-SWAP"),
            ChatMessage::tool_result("1", r#"{"last_price": 100.0}"#),
            tool_call("2", "indicator_calculator", "BTC-USDT-SWAP"),
            ChatMessage::tool_result("2", r#"{"price": 999.0}"#),
        ];
        let snapshots = build_market_snapshots(&trace, &[]);
        assert_eq!(snapshots.get("BTC-USDT-SWAP"), Some(&100.0));
    }

    fn decision(symbol: &str) -> Decision {
        Decision {
            symbol: symbol.to_string(),
            action: crate::types::DecisionAction::Hold,
            quantity: None,
            size_pct: None,
            leverage: None,
            confidence: None,
            stop_loss: None,
            take_profit: None,
            max_slippage_bps: None,
            invalidation_condition: None,
            rationale: None,
            chain_of_thought: None,
        }
    }

    #[test]
    fn falls_back_to_decision_take_profit_when_no_tool_price_found() {
        let mut d = decision("BTC-USDT-SWAP");
        d.take_profit = Some(55_000.0);
        d.stop_loss = Some(45_000.0);
        let snapshots = build_market_snapshots(&[], &[d]);
        assert_eq!(snapshots.get("BTC-USDT-SWAP"), Some(&55_000.0));
    }

    #[test]
    fn falls_back_to_stop_loss_then_quantity_when_earlier_fields_absent() {
        let mut d = decision("ETH-USDT-SWAP");
        d.quantity = Some(2.5);
        let snapshots = build_market_snapshots(&[], &[d]);
        assert_eq!(snapshots.get("ETH-USDT-SWAP"), Some(&2.5));
    }

    #[test]
    fn tool_derived_price_takes_priority_over_decision_fallback() {
        let trace = vec![
            tool_call("1", "live_market_data", "BTC-USDT-SWAP"),
            ChatMessage::tool_result("1", r#"{"last_price": 50_025.0}"#),
        ];
        let mut d = decision("BTC-USDT-SWAP");
        d.take_profit = Some(55_000.0);
        let snapshots = build_market_snapshots(&trace, &[d]);
        assert_eq!(snapshots.get("BTC-USDT-SWAP"), Some(&50_025.0));
    }

    async fn scheduler() -> DecisionScheduler {
        use crate::broker::factory::ModeBrokerFactory;
        use crate::broker::simulated::SimulatedBroker;
        use crate::exchange::okx::OkxClient;
        use crate::llm::agent::LLMAgent;
        use crate::llm::chat::{DeepSeekClient, DeepSeekConfig};
        use crate::llm::prompt_builder::RiskSettingsContext;
        use crate::market_cache::MarketCache;
        use crate::tools::registry::ToolRegistry;

        let sim_path = std::env::temp_dir().join(format!("autotrade-scheduler-test-{}.json", uuid::Uuid::new_v4()));
        let sim_broker: Arc<dyn BrokerPort> = Arc::new(SimulatedBroker::new(sim_path, 10_000.0, 5.0, 50.0, None));
        let factory: Arc<dyn BrokerFactory> = Arc::new(ModeBrokerFactory::new(sim_broker.clone(), sim_broker.clone()));
        let handle = Arc::new(BrokerHandle::new(sim_broker));

        let exchange = Arc::new(OkxClient::new("k".into(), "s".into(), "p".into(), "https://unused.invalid".into(), true));
        let cache = Arc::new(MarketCache::new(500, Duration::from_secs(3600)));
        let symbols = vec!["BTC-USDT-SWAP".to_string()];
        let tools = Arc::new(ToolRegistry::new(cache, exchange, &symbols, "15m", "1h"));
        let chat = Arc::new(DeepSeekClient::new(DeepSeekConfig::new("unused-key")));
        let agent = LLMAgent::new(chat, tools.clone(), 8);

        let risk = RiskSettingsContext {
            confidence_entry_threshold: 0.6,
            max_gross_exposure_pct: 80.0,
            min_cash_buffer_pct: 15.0,
            position_size_limit_pct: 50.0,
        };

        let pipeline = Arc::new(DecisionPipeline::new(
            handle.clone() as Arc<dyn BrokerPort>,
            tools,
            agent,
            "15m",
            None,
            &symbols,
            8,
            5,
            None,
            risk,
            Utc::now(),
        ));

        let controller = RuntimeController::new(crate::types::RuntimeMode::Simulator, None).await.unwrap();

        DecisionScheduler::new(pipeline, Arc::new(controller), factory, handle, Duration::from_secs(180))
    }

    #[tokio::test]
    async fn starts_idle_and_unpaused() {
        let s = scheduler().await;
        let status = s.status();
        assert_eq!(status.state, SchedulerState::Idle);
        assert!(!status.paused);
        assert_eq!(status.total_runs, 0);
        assert_eq!(s.evaluation_counts(), (0, 0));
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_status() {
        let s = scheduler().await;
        s.pause();
        assert!(s.status().paused);
        s.resume();
        assert!(!s.status().paused);
    }

    #[tokio::test]
    async fn start_and_stop_do_not_panic() {
        let s = scheduler().await;
        s.start();
        s.stop();
    }

    #[tokio::test]
    async fn decision_history_starts_empty() {
        let s = scheduler().await;
        assert!(s.recent_decisions(None, 10).is_empty());
        assert!(s.decision_by_id(Uuid::new_v4()).is_none());
    }
}
