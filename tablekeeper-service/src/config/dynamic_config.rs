//! Dynamic configuration that can be updated at runtime via the settings frames.
//! DB values override config file/env defaults.

mod defaults;
mod keys;
mod merging;
mod schemas;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use schemas::{AgenticLoopConfig, ContextConfig, LlmConfig, ToolBridgeConfig};

use defaults::{default_agentic_loop, default_context, default_llm, default_tool_bridge};

/// Dynamic configuration that can be updated at runtime
/// DB values override config file/env defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default = "default_llm")]
    pub llm: LlmConfig,

    #[serde(default = "default_context")]
    pub context: ContextConfig,

    #[serde(default = "default_tool_bridge")]
    pub tool_bridge: ToolBridgeConfig,

    #[serde(default = "default_agentic_loop")]
    pub agentic_loop: AgenticLoopConfig,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            llm: default_llm(),
            context: default_context(),
            tool_bridge: default_tool_bridge(),
            agentic_loop: default_agentic_loop(),
        }
    }
}

impl DynamicConfig {
    /// Get all valid setting keys
    pub fn valid_keys() -> HashSet<&'static str> {
        keys::valid_keys()
    }
}
