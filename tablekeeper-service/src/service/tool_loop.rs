//! Tool-use resolution loop.
//!
//! While the model stops with `tool_use`, run every requested tool, feed
//! the results back as one user turn and ask again. Tool failures are
//! reported to the model as `is_error` results; gateway failures end the
//! turn.

use std::future::Future;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::llm::{ApiMessage, ContentBlock, LlmGateway, LlmRequest, LlmResponse, Role};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolLoopOutcome {
    /// Text blocks of the final response joined by newlines
    pub text: String,
    pub rounds: u32,
    pub tool_calls: usize,
}

fn tool_result_content(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Drive `initial` to a final text answer.
///
/// `request` is the request that produced `initial`; tool turns are
/// appended to its messages and it is re-sent with the same system prompt
/// and tools each round.
pub async fn resolve_tool_use<F, Fut>(
    gateway: &dyn LlmGateway,
    api_key: &str,
    request: &mut LlmRequest,
    initial: LlmResponse,
    execute: F,
    max_rounds: u32,
) -> ServiceResult<ToolLoopOutcome>
where
    F: Fn(String, serde_json::Value) -> Fut,
    Fut: Future<Output = ServiceResult<serde_json::Value>>,
{
    let mut response = initial;
    let mut rounds = 0;
    let mut tool_calls = 0;

    while response.wants_tools() {
        let calls: Vec<(String, String, serde_json::Value)> = response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect();

        if calls.is_empty() {
            warn!("Model stopped for tool use without requesting any tool");
            break;
        }
        if rounds >= max_rounds {
            return Err(ServiceError::ToolLoopExhausted { rounds });
        }
        rounds += 1;
        tool_calls += calls.len();

        debug!(round = rounds, calls = calls.len(), "Executing tool round");

        request
            .messages
            .push(ApiMessage::blocks(Role::Assistant, response.content.clone()));

        let results = join_all(calls.into_iter().map(|(id, name, input)| {
            let run = execute(name.clone(), input);
            async move {
                match run.await {
                    Ok(value) => ContentBlock::ToolResult {
                        tool_use_id: id,
                        content: tool_result_content(value),
                        is_error: None,
                    },
                    Err(e) => {
                        debug!(tool = %name, error = %e, "Tool call failed");
                        ContentBlock::ToolResult {
                            tool_use_id: id,
                            content: e.to_string(),
                            is_error: Some(true),
                        }
                    }
                }
            }
        }))
        .await;

        request
            .messages
            .push(ApiMessage::blocks(Role::User, results));

        response = gateway.send(api_key, request).await?;
    }

    Ok(ToolLoopOutcome {
        text: response.text(),
        rounds,
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::llm::testing::{ScriptedGateway, text_response, tool_use_response};
    use crate::llm::{MessageContent, StopReason, Usage};

    fn base_request() -> LlmRequest {
        LlmRequest {
            model: "claude-test".to_string(),
            max_tokens: 100,
            system: Some("You are the GM".to_string()),
            messages: vec![ApiMessage::user("I attack the goblin")],
            tools: crate::tools::REGISTRY.definitions(),
        }
    }

    #[tokio::test]
    async fn test_end_turn_returns_text_immediately() {
        let gateway = ScriptedGateway::new();
        let mut request = base_request();

        let outcome = resolve_tool_use(
            &gateway,
            "sk",
            &mut request,
            text_response("The goblin flees."),
            |_, _| async { Ok(serde_json::Value::Null) },
            25,
        )
        .await
        .unwrap();

        assert_eq!(outcome.text, "The goblin flees.");
        assert_eq!(outcome.rounds, 0);
        assert!(gateway.requests().is_empty());
    }

    #[tokio::test]
    async fn test_mixed_success_and_failure_round() {
        let gateway = ScriptedGateway::new();
        gateway.push_text("You hit for 7. The goblin's sheet is unavailable.");
        let mut request = base_request();

        let initial = tool_use_response(&[
            ("t1", "roll_dice", serde_json::json!({"formula": "1d8"})),
            ("t2", "get_actor", serde_json::json!({"name": "Goblin"})),
        ]);

        let outcome = resolve_tool_use(
            &gateway,
            "sk",
            &mut request,
            initial,
            |name, _input| async move {
                if name == "roll_dice" {
                    Ok(serde_json::json!({"total": 7}))
                } else {
                    Err(ServiceError::ToolExecution {
                        tool: name,
                        message: "actor not found".to_string(),
                    })
                }
            },
            25,
        )
        .await
        .unwrap();

        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.tool_calls, 2);
        assert!(outcome.text.starts_with("You hit for 7."));

        let sent = gateway.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].system.as_deref(), Some("You are the GM"));
        assert_eq!(sent[0].tools.len(), request.tools.len());

        let last = sent[0].messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        let MessageContent::Blocks(blocks) = &last.content else {
            panic!("expected tool result blocks");
        };
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0],
            ContentBlock::ToolResult {
                tool_use_id: "t1".to_string(),
                content: r#"{"total":7}"#.to_string(),
                is_error: None,
            }
        );
        assert!(matches!(
            &blocks[1],
            ContentBlock::ToolResult { tool_use_id, is_error: Some(true), content }
                if tool_use_id == "t2" && content.contains("actor not found")
        ));
    }

    #[tokio::test]
    async fn test_tool_use_without_calls_ends_loop() {
        let gateway = ScriptedGateway::new();
        let mut request = base_request();
        let initial = LlmResponse {
            id: "msg".to_string(),
            content: vec![ContentBlock::Text {
                text: "Hmm.".to_string(),
            }],
            stop_reason: Some(StopReason::ToolUse),
            usage: Usage::default(),
        };

        let outcome = resolve_tool_use(
            &gateway,
            "sk",
            &mut request,
            initial,
            |_, _| async { Ok(serde_json::Value::Null) },
            25,
        )
        .await
        .unwrap();

        assert_eq!(outcome.text, "Hmm.");
        assert!(gateway.requests().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_error_propagates() {
        let gateway = ScriptedGateway::new();
        gateway.push(Err(ServiceError::Provider(ProviderError::Request {
            status: 529,
            message: "overloaded".to_string(),
        })));
        let mut request = base_request();

        let err = resolve_tool_use(
            &gateway,
            "sk",
            &mut request,
            tool_use_response(&[("t1", "roll_dice", serde_json::json!({"formula": "1d20"}))]),
            |_, _| async { Ok(serde_json::json!(12)) },
            25,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ServiceError::Provider(ProviderError::Request { status: 529, .. })
        ));
    }

    #[tokio::test]
    async fn test_round_limit() {
        let gateway = ScriptedGateway::new();
        gateway.push(Ok(tool_use_response(&[(
            "t2",
            "roll_dice",
            serde_json::json!({"formula": "1d20"}),
        )])));
        let mut request = base_request();

        let err = resolve_tool_use(
            &gateway,
            "sk",
            &mut request,
            tool_use_response(&[("t1", "roll_dice", serde_json::json!({"formula": "1d20"}))]),
            |_, _| async { Ok(serde_json::json!(12)) },
            1,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ServiceError::ToolLoopExhausted { rounds: 1 }));
    }
}
