// =============================================================================
// Services — the engine's dependency graph, constructed once at startup (§9)
// =============================================================================
//
// Every shared dependency (schedulers, repositories, LLM client, exchange
// client, runtime controller) is built here and threaded through explicitly,
// so tests can inject fakes at construction instead of reaching for global
// state.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::broker::exchange::ExchangeBroker;
use crate::broker::factory::{BrokerFactory, BrokerHandle, ModeBrokerFactory};
use crate::broker::simulated::SimulatedBroker;
use crate::broker::BrokerPort;
use crate::config::Settings;
use crate::decision_scheduler::DecisionScheduler;
use crate::exchange::okx::OkxClient;
use crate::exchange::ExchangeClient;
use crate::feedback::{FeedbackEngine, OutcomeTracker};
use crate::llm::agent::LLMAgent;
use crate::llm::chat::{ChatLLM, DeepSeekClient, DeepSeekConfig};
use crate::llm::prompt_builder::RiskSettingsContext;
use crate::market_cache::MarketCache;
use crate::market_data_scheduler::MarketDataScheduler;
use crate::pipeline::DecisionPipeline;
use crate::reconcile::ReconcileState;
use crate::repository::memory::MemoryRepository;
use crate::repository::Repository;
use crate::runtime_config::RuntimeConfig;
use crate::runtime_controller::RuntimeController;
use crate::tools::registry::ToolRegistry;

/// Everything the HTTP layer and the two schedulers need, built once and
/// cloned cheaply (every field is an `Arc`).
#[derive(Clone)]
pub struct Services {
    pub settings: Arc<Settings>,
    pub runtime_config_path: Arc<String>,
    pub market_cache: Arc<MarketCache>,
    pub repository: Option<Arc<dyn Repository>>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub runtime_controller: Arc<RuntimeController>,
    pub broker_handle: Arc<BrokerHandle>,
    pub broker_factory: Arc<dyn BrokerFactory>,
    pub exchange_broker: Arc<ExchangeBroker>,
    pub outcome_tracker: Arc<OutcomeTracker>,
    pub market_data_scheduler: Arc<MarketDataScheduler>,
    pub decision_scheduler: Arc<DecisionScheduler>,
    pub reconcile: Arc<ReconcileState>,
    pub cron_trigger_token: Option<Arc<String>>,
    pub started_at: DateTime<Utc>,
}

impl Services {
    /// Wire the full dependency graph from `Settings` and a loaded
    /// `RuntimeConfig`. No connections are made here beyond what each
    /// client's constructor does eagerly (none of them dial out); the first
    /// real network call happens inside a scheduler tick.
    pub async fn build(settings: Settings, runtime_config: RuntimeConfig, runtime_config_path: String) -> Result<Self> {
        let settings = Arc::new(settings);

        let market_cache = Arc::new(MarketCache::new(
            crate::market_cache::DEFAULT_MAX_ENTRIES_PER_SYMBOL,
            Duration::from_secs(3600),
        ));

        let exchange: Arc<dyn ExchangeClient> = Arc::new(OkxClient::new(
            settings.okx_api_key.clone().unwrap_or_default(),
            settings.okx_secret_key.clone().unwrap_or_default(),
            settings.okx_passphrase.clone().unwrap_or_default(),
            settings.okx_base_url.clone(),
            settings.okx_demo_mode,
        ));

        // No database-backed Repository is in scope; MemoryRepository is the
        // only implementation wired in, standing in for whatever durable
        // store a deployment would add later.
        let repository: Option<Arc<dyn Repository>> = Some(Arc::new(MemoryRepository::new()));

        let chat: Arc<dyn ChatLLM> = Arc::new(DeepSeekClient::new(DeepSeekConfig::new(
            settings.deepseek_api_key.clone().unwrap_or_default(),
        )));

        let feedback_engine = Arc::new(FeedbackEngine::new(chat.clone(), repository.clone()));
        let outcome_tracker = Arc::new(OutcomeTracker::new(feedback_engine, repository.clone()));

        let short_timeframe = "15m".to_string();
        let long_timeframe = "1h".to_string();

        let simulator_broker: Arc<dyn BrokerPort> = Arc::new(SimulatedBroker::new(
            settings.simulation_state_path.clone(),
            runtime_config.starting_cash,
            runtime_config.max_slippage_bps,
            runtime_config.position_size_limit_pct,
            Some(outcome_tracker.clone()),
        ));

        let exchange_broker = Arc::new(ExchangeBroker::new(
            exchange.clone(),
            HashMap::new(),
            Some(outcome_tracker.clone()),
            runtime_config.max_slippage_bps,
        ));

        let broker_factory: Arc<dyn BrokerFactory> =
            Arc::new(ModeBrokerFactory::new(simulator_broker.clone(), exchange_broker.clone() as Arc<dyn BrokerPort>));

        let runtime_controller = Arc::new(RuntimeController::new(runtime_config.runtime_mode, repository.clone()).await?);

        let initial_broker = broker_factory.build(runtime_controller.current());
        let broker_handle = Arc::new(BrokerHandle::new(initial_broker));

        let tools = Arc::new(ToolRegistry::new(
            market_cache.clone(),
            exchange.clone(),
            &runtime_config.symbols,
            short_timeframe.clone(),
            long_timeframe.clone(),
        ));

        let agent = LLMAgent::new(chat, tools.clone(), runtime_config.max_tool_iterations);

        let risk = RiskSettingsContext {
            confidence_entry_threshold: runtime_config.confidence_entry_threshold,
            max_gross_exposure_pct: runtime_config.max_gross_exposure_pct,
            min_cash_buffer_pct: runtime_config.min_cash_buffer_pct,
            position_size_limit_pct: runtime_config.position_size_limit_pct,
        };

        let decision_trace_log_path = runtime_config.decision_trace_log_path.clone().map(std::path::PathBuf::from);
        let started_at = Utc::now();

        let pipeline = Arc::new(DecisionPipeline::new(
            broker_handle.clone() as Arc<dyn BrokerPort>,
            tools,
            agent,
            short_timeframe.clone(),
            repository.clone(),
            &runtime_config.symbols,
            runtime_config.max_rules_in_prompt,
            runtime_config.max_history_trades,
            decision_trace_log_path,
            risk,
            started_at,
        ));

        let market_data_scheduler = Arc::new(MarketDataScheduler::new(
            exchange.clone(),
            market_cache.clone(),
            &runtime_config.symbols,
            short_timeframe,
            long_timeframe,
            Duration::from_secs(runtime_config.market_data_interval_seconds),
        ));

        let decision_scheduler = Arc::new(DecisionScheduler::new(
            pipeline,
            runtime_controller.clone(),
            broker_factory.clone(),
            broker_handle.clone(),
            Duration::from_secs(runtime_config.decision_interval_minutes * 60),
        ));

        let reconcile = Arc::new(ReconcileState::default());

        info!(
            mode = %runtime_controller.current(),
            symbols = ?runtime_config.symbols,
            "services assembled"
        );

        Ok(Self {
            settings: settings.clone(),
            runtime_config_path: Arc::new(runtime_config_path),
            market_cache,
            repository,
            exchange,
            runtime_controller,
            broker_handle,
            broker_factory,
            exchange_broker,
            outcome_tracker,
            market_data_scheduler,
            decision_scheduler,
            reconcile,
            cron_trigger_token: settings.cron_trigger_token.clone().map(Arc::new),
            started_at,
        })
    }

    /// Spawn the periodic background workers. Returns immediately; the
    /// tasks run for the life of the process.
    pub fn spawn_schedulers(&self) {
        let market_data = self.market_data_scheduler.clone();
        tokio::spawn(async move { market_data.run().await });

        let decisions = self.decision_scheduler.clone();
        decisions.start();
        tokio::spawn(async move { decisions.run().await });

        let reconcile = self.reconcile.clone();
        let exchange = self.exchange.clone();
        let mode = self.runtime_controller.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if mode.current() == crate::types::RuntimeMode::Simulator {
                    continue;
                }
                let _ = reconcile.reconcile_once(exchange.as_ref()).await;
            }
        });
    }
}
