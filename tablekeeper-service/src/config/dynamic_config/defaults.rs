//! Default value functions for DynamicConfig.

use super::schemas::{AgenticLoopConfig, ContextConfig, LlmConfig, ToolBridgeConfig};

pub(crate) fn default_llm() -> LlmConfig {
    LlmConfig {
        base_url: default_llm_url(),
        model: default_model(),
        max_tokens: default_max_tokens(),
        request_timeout_secs: default_request_timeout_secs(),
    }
}

pub(crate) fn default_llm_url() -> String {
    "https://api.anthropic.com".to_string()
}

pub(crate) fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

pub(crate) fn default_max_tokens() -> u32 {
    4096
}

pub(crate) fn default_request_timeout_secs() -> u64 {
    120
}

pub(crate) fn default_context() -> ContextConfig {
    ContextConfig {
        max_history_tokens: default_max_history_tokens(),
        max_canon_tokens: default_max_canon_tokens(),
        recent_message_count: default_recent_message_count(),
        summarization_enabled: default_summarization_enabled(),
    }
}

pub(crate) fn default_max_history_tokens() -> usize {
    50_000
}

pub(crate) fn default_max_canon_tokens() -> usize {
    10_000
}

pub(crate) fn default_recent_message_count() -> usize {
    20
}

pub(crate) fn default_summarization_enabled() -> bool {
    true
}

pub(crate) fn default_tool_bridge() -> ToolBridgeConfig {
    ToolBridgeConfig {
        timeout_secs: default_tool_timeout_secs(),
    }
}

pub(crate) fn default_tool_timeout_secs() -> u64 {
    30
}

pub(crate) fn default_agentic_loop() -> AgenticLoopConfig {
    AgenticLoopConfig {
        max_tool_rounds: default_max_tool_rounds(),
    }
}

pub(crate) fn default_max_tool_rounds() -> u32 {
    25
}
