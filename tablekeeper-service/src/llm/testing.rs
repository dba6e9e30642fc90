//! Scripted gateway for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use super::{ContentBlock, LlmGateway, LlmRequest, LlmResponse, StopReason, Usage};
use crate::error::{ServiceError, ServiceResult};

/// Replays queued responses in order and records every request it sees
#[derive(Default)]
pub struct ScriptedGateway {
    responses: Mutex<VecDeque<ServiceResult<LlmResponse>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: ServiceResult<LlmResponse>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_text(&self, text: &str) {
        self.push(Ok(text_response(text)));
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmGateway for ScriptedGateway {
    fn send<'a>(
        &'a self,
        _api_key: &'a str,
        request: &'a LlmRequest,
    ) -> BoxFuture<'a, ServiceResult<LlmResponse>> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ServiceError::Internal {
                    message: "scripted gateway exhausted".to_string(),
                })
            });
        Box::pin(async move { next })
    }
}

pub fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        id: "msg_text".to_string(),
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        stop_reason: Some(StopReason::EndTurn),
        usage: Usage::default(),
    }
}

/// A `tool_use` response asking for each `(id, name, input)` call
pub fn tool_use_response(calls: &[(&str, &str, serde_json::Value)]) -> LlmResponse {
    LlmResponse {
        id: "msg_tools".to_string(),
        content: calls
            .iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            })
            .collect(),
        stop_reason: Some(StopReason::ToolUse),
        usage: Usage::default(),
    }
}
