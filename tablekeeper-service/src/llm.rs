//! LLM gateway.
//!
//! The orchestration core talks to the model through [`LlmGateway`]. The
//! shipped implementation, [`ClaudeClient`], speaks the Anthropic Messages
//! API; tests substitute a scripted gateway.

use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::{ProviderError, ServiceError, ServiceResult};

#[cfg(test)]
pub(crate) mod testing;

const MESSAGES_PATH: &str = "/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Conversation role on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A content block in a request or response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ApiMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }
}

/// Tool advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(default)]
    pub id: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub usage: Usage,
}

impl LlmResponse {
    /// All text blocks joined by newlines
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn wants_tools(&self) -> bool {
        self.stop_reason == Some(StopReason::ToolUse)
    }
}

/// Anything that can answer an [`LlmRequest`]
pub trait LlmGateway: Send + Sync {
    fn send<'a>(
        &'a self,
        api_key: &'a str,
        request: &'a LlmRequest,
    ) -> BoxFuture<'a, ServiceResult<LlmResponse>>;
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Anthropic Messages API client
pub struct ClaudeClient {
    client: Client,
    config: Arc<RuntimeConfig>,
}

impl ClaudeClient {
    pub fn new(config: Arc<RuntimeConfig>) -> ServiceResult<Self> {
        let base_url = config.dynamic().llm.base_url.clone();
        let client = Client::builder().build().map_err(|e| {
            ServiceError::Provider(ProviderError::Connection {
                url: base_url,
                source: e,
            })
        })?;

        Ok(Self { client, config })
    }

    async fn post_messages(
        &self,
        api_key: &str,
        request: &LlmRequest,
    ) -> ServiceResult<LlmResponse> {
        let llm_config = self.config.dynamic().llm.clone();
        let url = format!(
            "{}{}",
            llm_config.base_url.trim_end_matches('/'),
            MESSAGES_PATH
        );

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending LLM request"
        );

        let response = self
            .client
            .post(&url)
            .timeout(llm_config.request_timeout())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| ProviderError::Connection {
                url: url.clone(),
                source: e,
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            warn!(status = status.as_u16(), error = %message, "LLM request rejected");
            metrics::counter!("tablekeeper_llm_requests_total", "outcome" => "error").increment(1);
            return Err(ServiceError::Provider(ProviderError::Request {
                status: status.as_u16(),
                message,
            }));
        }

        let parsed: LlmResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse { source: e })?;

        metrics::counter!("tablekeeper_llm_requests_total", "outcome" => "ok").increment(1);
        metrics::counter!("tablekeeper_llm_input_tokens_total")
            .increment(parsed.usage.input_tokens);
        metrics::counter!("tablekeeper_llm_output_tokens_total")
            .increment(parsed.usage.output_tokens);

        Ok(parsed)
    }
}

impl LlmGateway for ClaudeClient {
    fn send<'a>(
        &'a self,
        api_key: &'a str,
        request: &'a LlmRequest,
    ) -> BoxFuture<'a, ServiceResult<LlmResponse>> {
        Box::pin(self.post_messages(api_key, request))
    }
}
