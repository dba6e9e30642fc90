//! Configuration struct definitions for DynamicConfig sections.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "super::defaults::default_llm_url")]
    pub base_url: String,

    #[serde(default = "super::defaults::default_model")]
    pub model: String,

    #[serde(default = "super::defaults::default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "super::defaults::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Context window budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token budget for conversation history
    #[serde(default = "super::defaults::default_max_history_tokens")]
    pub max_history_tokens: usize,

    /// Token budget for published canon included in the system prompt
    #[serde(default = "super::defaults::default_max_canon_tokens")]
    pub max_canon_tokens: usize,

    /// Messages kept verbatim next to a stored summary
    #[serde(default = "super::defaults::default_recent_message_count")]
    pub recent_message_count: usize,

    /// Summarize dropped history instead of silently truncating it
    #[serde(default = "super::defaults::default_summarization_enabled")]
    pub summarization_enabled: bool,
}

/// Tool call bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolBridgeConfig {
    /// Deadline for a client to answer a tool-execute push, in seconds
    #[serde(default = "super::defaults::default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

impl ToolBridgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Tool-use loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgenticLoopConfig {
    /// Maximum LLM follow-up calls in a single turn
    #[serde(default = "super::defaults::default_max_tool_rounds")]
    pub max_tool_rounds: u32,
}
