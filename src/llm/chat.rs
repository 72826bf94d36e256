// =============================================================================
// ChatLLM contract + DeepSeek HTTP client
// =============================================================================
//
// The wire format of any particular LLM provider is abstracted behind this
// trait, mirroring how `exchange::ExchangeClient` hides OKX's REST shape.
// `DeepSeekClient` speaks the OpenAI-compatible `/chat/completions` endpoint
// with an attempt-then-backoff retry loop around each call.
// =============================================================================

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tools::ToolSpec;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A pending or completed tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One entry in the agent loop's running transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Set only on a `Role::Tool` message: which call this is the result of.
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: Some(content.into()), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self { role: Role::Assistant, content, tool_calls, tool_call_id: None }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// One completion turn: either final text, or a batch of tool calls to run
/// before the loop continues.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub model_name: String,
}

impl ChatCompletion {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Uniform chat-completion contract any LLM provider can implement.
pub trait ChatLLM: Send + Sync {
    fn complete<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        tools: &'a [ToolSpec],
    ) -> BoxFuture<'a, Result<ChatCompletion>>;
}

#[derive(Debug, Clone)]
pub struct DeepSeekConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
    pub temperature: f64,
    pub top_p: f64,
}

impl DeepSeekConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(60),
            max_retries: 3,
            backoff: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            temperature: 0.2,
            top_p: 0.95,
        }
    }
}

pub struct DeepSeekClient {
    config: DeepSeekConfig,
    client: reqwest::Client,
}

impl DeepSeekClient {
    pub fn new(config: DeepSeekConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build reqwest client");
        Self { config, client }
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let mut obj = serde_json::json!({ "role": role });
                if let Some(content) = &m.content {
                    obj["content"] = serde_json::Value::String(content.clone());
                }
                if !m.tool_calls.is_empty() {
                    obj["tool_calls"] = serde_json::Value::Array(
                        m.tool_calls
                            .iter()
                            .map(|tc| {
                                serde_json::json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments.to_string(),
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = serde_json::Value::String(id.clone());
                }
                obj
            })
            .collect()
    }

    fn wire_tools(tools: &[ToolSpec]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    fn parse_response(model_fallback: &str, body: &serde_json::Value) -> Result<ChatCompletion> {
        let message = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .context("DeepSeek response missing choices[0].message")?;

        let content = message.get("content").and_then(|v| v.as_str()).map(str::to_string);

        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        let id = tc.get("id")?.as_str()?.to_string();
                        let function = tc.get("function")?;
                        let name = function.get("name")?.as_str()?.to_string();
                        let arguments_raw = function.get("arguments")?.as_str().unwrap_or("{}");
                        let arguments = serde_json::from_str(arguments_raw).unwrap_or(serde_json::Value::Null);
                        Some(ToolCall { id, name, arguments })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let model_name = body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(model_fallback)
            .to_string();

        Ok(ChatCompletion { content, tool_calls, model_name })
    }
}

impl ChatLLM for DeepSeekClient {
    fn complete<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        tools: &'a [ToolSpec],
    ) -> BoxFuture<'a, Result<ChatCompletion>> {
        Box::pin(async move {
            if messages.is_empty() {
                bail!("DeepSeek completion requires at least one message");
            }

            let mut payload = serde_json::json!({
                "model": self.config.model,
                "messages": Self::wire_messages(messages),
                "temperature": self.config.temperature,
                "top_p": self.config.top_p,
            });
            if !tools.is_empty() {
                payload["tools"] = serde_json::Value::Array(Self::wire_tools(tools));
            }

            let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
            let mut attempt = 0u32;
            let mut backoff = self.config.backoff;

            loop {
                let result = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.config.api_key)
                    .json(&payload)
                    .send()
                    .await;

                match result {
                    Ok(response) if response.status().is_success() => {
                        let body: serde_json::Value = response.json().await.context("invalid JSON from DeepSeek")?;
                        return Self::parse_response(&self.config.model, &body);
                    }
                    Ok(response) => {
                        let status = response.status();
                        let text = response.text().await.unwrap_or_default();
                        if attempt >= self.config.max_retries || !status.is_server_error() {
                            bail!("DeepSeek request failed ({status}): {text}");
                        }
                    }
                    Err(err) if attempt >= self.config.max_retries => {
                        return Err(err).context("DeepSeek request failed after retries");
                    }
                    Err(_) => {}
                }

                attempt += 1;
                warn!(attempt, max_retries = self.config.max_retries, "DeepSeek request failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.backoff_max);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors_set_expected_roles() {
        assert_eq!(ChatMessage::system("x").role, Role::System);
        assert_eq!(ChatMessage::user("x").role, Role::User);
        assert_eq!(ChatMessage::tool_result("1", "x").role, Role::Tool);
    }

    #[test]
    fn wire_messages_embeds_tool_call_arguments_as_json_string() {
        let msg = ChatMessage::assistant(
            None,
            vec![ToolCall { id: "1".into(), name: "live_market_data".into(), arguments: serde_json::json!({"symbol": "BTC"}) }],
        );
        let wire = DeepSeekClient::wire_messages(&[msg]);
        let args = wire[0]["tool_calls"][0]["function"]["arguments"].as_str().unwrap();
        assert!(args.contains("BTC"));
    }

    #[test]
    fn parse_response_extracts_content_and_tool_calls() {
        let body = serde_json::json!({
            "model": "deepseek-chat",
            "choices": [{
                "message": {
                    "content": "hello",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "derivatives_data", "arguments": "{\"symbol\":\"ETH\"}" }
                    }]
                }
            }]
        });
        let completion = DeepSeekClient::parse_response("fallback", &body).unwrap();
        assert_eq!(completion.content.as_deref(), Some("hello"));
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "derivatives_data");
        assert_eq!(completion.model_name, "deepseek-chat");
    }

    #[test]
    fn parse_response_missing_choices_is_an_error() {
        let body = serde_json::json!({ "model": "x" });
        assert!(DeepSeekClient::parse_response("x", &body).is_err());
    }

    #[test]
    fn has_tool_calls_reflects_nonempty_vec() {
        let completion = ChatCompletion { content: None, tool_calls: vec![], model_name: "x".into() };
        assert!(!completion.has_tool_calls());
    }
}
