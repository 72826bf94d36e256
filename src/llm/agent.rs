// =============================================================================
// LLMAgent — tool-calling agent loop
// =============================================================================
//
// Drives one decision run's conversation with the configured `ChatLLM`,
// executing any requested tool calls through the `ToolRegistry` and
// preserving message order for the audit trail. The tool-calling loop is
// explicit rather than delegated to an agent framework.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::AppError;
use crate::llm::chat::{ChatLLM, ChatMessage};
use crate::tools::{ToolCache, ToolRegistry};

/// Fixed system prompt handed to the LLM on every run: gather data via
/// tools, then answer with the decision-array JSON schema only.
pub const SYSTEM_PROMPT: &str = concat!(
    "You are AutoTrader, an LLM portfolio manager. Use the available tools to gather the latest ",
    "market data and technical indicators for each symbol before making any decisions. ",
    "ALWAYS call `live_market_data` and `indicator_calculator` for every symbol you evaluate. ",
    "After you finish reasoning, respond with ONLY a JSON object of the form ",
    "{\"decisions\": [...], \"model_name\": \"...\"} where each decision matches the schema:\n",
    "  {\"symbol\": \"BTC-USDT-SWAP\", \"action\": \"HOLD|CLOSE|BUY|SELL|NO_ENTRY\", \"quantity\": 0.0, ",
    "\"size_pct\": 0.0, \"leverage\": 1, \"confidence\": 0.65, \"stop_loss\": 0.0, \"take_profit\": 0.0, ",
    "\"max_slippage_bps\": 25, \"invalidation_condition\": \"string\", \"rationale\": \"string\"}\n",
    "IMPORTANT: confidence must be a decimal between 0.0 and 1.0 (e.g. 0.65 for 65%, NOT 65.0).\n",
    "IMPORTANT: leverage must be an integer between 1 and 20.\n",
    "IMPORTANT: you MUST return a decision for EVERY symbol in the provided market state.\n",
    "Use BUY to open a long, SELL to open a short, HOLD to keep an existing position, CLOSE to exit one, ",
    "and NO_ENTRY when no position exists and entry conditions are not met.\n",
    "Do not include any extra top-level keys. If a field is not applicable, omit it."
);

/// Per-run bound on agent loop iterations, per §4.6 point 3 ("≤ 8 iterations").
pub const DEFAULT_MAX_ITERATIONS: u32 = 8;

/// The finished conversation: the final assistant text (if any) and the
/// full ordered transcript, preserved for the audit trail.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub final_text: Option<String>,
    pub messages: Vec<ChatMessage>,
}

pub struct LLMAgent {
    chat: Arc<dyn ChatLLM>,
    tools: Arc<ToolRegistry>,
    max_iterations: u32,
}

impl LLMAgent {
    pub fn new(chat: Arc<dyn ChatLLM>, tools: Arc<ToolRegistry>, max_iterations: u32) -> Self {
        Self { chat, tools, max_iterations }
    }

    /// Run the tool-calling loop to completion or until `max_iterations` is
    /// exhausted without a final answer.
    pub async fn run(&self, user_prompt: &str, tool_cache: &ToolCache) -> Result<AgentRunResult, AppError> {
        let specs = self.tools.specs();
        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user_prompt)];

        for iteration in 0..self.max_iterations {
            let completion = self
                .chat
                .complete(&messages, &specs)
                .await
                .map_err(|e| AppError::transient(format!("LLM completion failed: {e}")))?;

            if completion.has_tool_calls() {
                messages.push(ChatMessage::assistant(completion.content.clone(), completion.tool_calls.clone()));

                for call in &completion.tool_calls {
                    info!(iteration, tool = %call.name, "agent invoking tool");
                    let result = self.tools.call(tool_cache, &call.name, &call.arguments).await;
                    let content = match result {
                        Ok(value) => value.to_string(),
                        Err(err) => {
                            warn!(tool = %call.name, error = %err, "tool call failed");
                            serde_json::json!({ "error": err.to_string() }).to_string()
                        }
                    };
                    messages.push(ChatMessage::tool_result(call.id.clone(), content));
                }
                continue;
            }

            messages.push(ChatMessage::assistant(completion.content.clone(), Vec::new()));
            return Ok(AgentRunResult { final_text: completion.content, messages });
        }

        Err(AppError::validation("agent loop exceeded max iterations without a final answer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::okx::OkxClient;
    use crate::llm::chat::{BoxFuture, ChatCompletion, Role, ToolCall};
    use crate::market_cache::MarketCache;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedChat {
        calls: AtomicUsize,
    }

    impl ChatLLM for ScriptedChat {
        fn complete<'a>(
            &'a self,
            _messages: &'a [ChatMessage],
            _tools: &'a [crate::tools::ToolSpec],
        ) -> BoxFuture<'a, Result<ChatCompletion>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Ok(ChatCompletion {
                        content: None,
                        tool_calls: vec![ToolCall {
                            id: "call_1".into(),
                            name: "derivatives_data".into(),
                            arguments: serde_json::json!({"symbol": "BTC"}),
                        }],
                        model_name: "scripted".into(),
                    })
                } else {
                    Ok(ChatCompletion {
                        content: Some(r#"{"decisions":[],"model_name":"scripted"}"#.into()),
                        tool_calls: vec![],
                        model_name: "scripted".into(),
                    })
                }
            })
        }
    }

    struct NeverRespondsChat;
    impl ChatLLM for NeverRespondsChat {
        fn complete<'a>(
            &'a self,
            _messages: &'a [ChatMessage],
            _tools: &'a [crate::tools::ToolSpec],
        ) -> BoxFuture<'a, Result<ChatCompletion>> {
            Box::pin(async move {
                Ok(ChatCompletion {
                    content: None,
                    tool_calls: vec![ToolCall { id: "x".into(), name: "derivatives_data".into(), arguments: serde_json::json!({"symbol": "BTC"}) }],
                    model_name: "scripted".into(),
                })
            })
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new(
            Arc::new(MarketCache::new(500, Duration::from_secs(3600))),
            Arc::new(OkxClient::new("k".into(), "s".into(), "p".into(), "https://unused.invalid".into(), true)),
            &["BTC-USDT-SWAP".to_string()],
            "15m",
            "1h",
        ))
    }

    #[tokio::test]
    async fn run_executes_tool_then_returns_final_text() {
        let agent = LLMAgent::new(Arc::new(ScriptedChat { calls: AtomicUsize::new(0) }), registry(), 8);
        let tool_cache = ToolCache::new();
        let result = agent.run("evaluate BTC", &tool_cache).await.unwrap();
        assert!(result.final_text.unwrap().contains("decisions"));
        // system + user + assistant(tool_call) + tool_result + assistant(final)
        assert_eq!(result.messages.len(), 5);
        assert_eq!(result.messages[2].role, Role::Assistant);
        assert_eq!(result.messages[3].role, Role::Tool);
    }

    #[tokio::test]
    async fn run_fails_after_exhausting_max_iterations() {
        let agent = LLMAgent::new(Arc::new(NeverRespondsChat), registry(), 2);
        let tool_cache = ToolCache::new();
        let err = agent.run("evaluate BTC", &tool_cache).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
