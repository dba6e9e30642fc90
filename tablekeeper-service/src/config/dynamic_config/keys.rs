//! Valid setting keys for DynamicConfig.

use std::collections::HashSet;

/// All valid setting keys for DynamicConfig
pub const VALID_SETTING_KEYS: &[&str] = &[
    "llm.base_url",
    "llm.model",
    "llm.max_tokens",
    "llm.request_timeout_secs",
    "context.max_history_tokens",
    "context.max_canon_tokens",
    "context.recent_message_count",
    "context.summarization_enabled",
    "tool_bridge.timeout_secs",
    "agentic_loop.max_tool_rounds",
];

/// Get all valid setting keys as a HashSet
pub fn valid_keys() -> HashSet<&'static str> {
    VALID_SETTING_KEYS.iter().copied().collect()
}
