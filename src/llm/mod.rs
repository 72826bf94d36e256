// =============================================================================
// LLM integration: chat contract, tool-calling agent, prompt assembly (§4.5–4.6)
// =============================================================================

pub mod agent;
pub mod chat;
pub mod prompt_builder;

pub use agent::LLMAgent;
pub use chat::{ChatLLM, DeepSeekClient, DeepSeekConfig};
pub use prompt_builder::PromptBuilder;
