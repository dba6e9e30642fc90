//! Key-value conversion and DB merging logic for DynamicConfig.

use std::collections::HashMap;

use super::DynamicConfig;

impl DynamicConfig {
    /// Convert config to key-value map for the settings frame
    pub fn to_key_value_map(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();

        // LLM settings
        map.insert(
            "llm.base_url".to_string(),
            serde_json::Value::String(self.llm.base_url.clone()),
        );
        map.insert(
            "llm.model".to_string(),
            serde_json::Value::String(self.llm.model.clone()),
        );
        map.insert(
            "llm.max_tokens".to_string(),
            serde_json::json!(self.llm.max_tokens),
        );
        map.insert(
            "llm.request_timeout_secs".to_string(),
            serde_json::json!(self.llm.request_timeout_secs),
        );

        // Context settings
        map.insert(
            "context.max_history_tokens".to_string(),
            serde_json::json!(self.context.max_history_tokens),
        );
        map.insert(
            "context.max_canon_tokens".to_string(),
            serde_json::json!(self.context.max_canon_tokens),
        );
        map.insert(
            "context.recent_message_count".to_string(),
            serde_json::json!(self.context.recent_message_count),
        );
        map.insert(
            "context.summarization_enabled".to_string(),
            serde_json::json!(self.context.summarization_enabled),
        );

        map.insert(
            "tool_bridge.timeout_secs".to_string(),
            serde_json::json!(self.tool_bridge.timeout_secs),
        );
        map.insert(
            "agentic_loop.max_tool_rounds".to_string(),
            serde_json::json!(self.agentic_loop.max_tool_rounds),
        );

        map
    }

    /// Apply DB settings as overrides to this config
    pub fn merge_from_db(&mut self, db_settings: &HashMap<String, serde_json::Value>) {
        for (key, value) in db_settings {
            self.apply_setting(key, value);
        }
    }

    fn apply_setting(&mut self, key: &str, value: &serde_json::Value) {
        match key {
            "llm.base_url" => {
                if let Some(v) = value.as_str() {
                    self.llm.base_url = v.to_string();
                }
            }
            "llm.model" => {
                if let Some(v) = value.as_str() {
                    self.llm.model = v.to_string();
                }
            }
            "llm.max_tokens" => {
                if let Some(v) = value.as_u64() {
                    self.llm.max_tokens = v as u32;
                }
            }
            "llm.request_timeout_secs" => {
                if let Some(v) = value.as_u64() {
                    self.llm.request_timeout_secs = v;
                }
            }

            "context.max_history_tokens" => {
                if let Some(v) = value.as_u64() {
                    self.context.max_history_tokens = v as usize;
                }
            }
            "context.max_canon_tokens" => {
                if let Some(v) = value.as_u64() {
                    self.context.max_canon_tokens = v as usize;
                }
            }
            "context.recent_message_count" => {
                if let Some(v) = value.as_u64() {
                    self.context.recent_message_count = v as usize;
                }
            }
            "context.summarization_enabled" => {
                if let Some(v) = value.as_bool() {
                    self.context.summarization_enabled = v;
                }
            }

            "tool_bridge.timeout_secs" => {
                if let Some(v) = value.as_u64() {
                    self.tool_bridge.timeout_secs = v;
                }
            }
            "agentic_loop.max_tool_rounds" => {
                if let Some(v) = value.as_u64() {
                    self.agentic_loop.max_tool_rounds = v as u32;
                }
            }

            _ => {
                tracing::warn!(key = %key, "Unknown setting key in merge_from_db");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_overrides_known_keys() {
        let mut config = DynamicConfig::default();
        let mut settings = HashMap::new();
        settings.insert("tool_bridge.timeout_secs".to_string(), serde_json::json!(5));
        settings.insert("llm.model".to_string(), serde_json::json!("claude-test"));
        settings.insert("bogus.key".to_string(), serde_json::json!(1));

        config.merge_from_db(&settings);

        assert_eq!(config.tool_bridge.timeout_secs, 5);
        assert_eq!(config.llm.model, "claude-test");
    }

    #[test]
    fn test_key_value_map_covers_valid_keys() {
        let map = DynamicConfig::default().to_key_value_map();
        for key in DynamicConfig::valid_keys() {
            assert!(map.contains_key(key), "missing {key}");
        }
        assert_eq!(map["tool_bridge.timeout_secs"], serde_json::json!(30));
    }
}
