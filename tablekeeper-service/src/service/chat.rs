//! Chat turns.
//!
//! Every turn follows the same path: persist the user side, build a bounded
//! history plus canon, call the gateway, resolve tool use through the
//! world's client and persist the assistant reply.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::prompts::{build_summary_prompt, build_system_prompt, to_api_messages};
use super::tool_loop::resolve_tool_use;
use super::{DEFAULT_LOCALE, TablekeeperService};
use crate::batch::BatchRequest;
use crate::context::{ContextMessage, SummarizedHistory};
use crate::db::{Message, MessageRole};
use crate::error::{ProviderError, ServiceError, ServiceResult};
use crate::llm::{ApiMessage, LlmRequest};
use crate::session::Session;
use crate::tools::REGISTRY;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub conversation_id: String,
    pub user_message_id: String,
    pub response: Message,
    pub tool_rounds: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTurn {
    pub conversation_id: String,
    pub batch_id: String,
    pub participant_count: usize,
    pub user_message_id: String,
    pub response: Message,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VetoTurn {
    pub conversation_id: String,
    pub original_batch_id: String,
    pub veto_count: u32,
    pub veto_message_id: String,
    pub response: Message,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateTurn {
    pub conversation_id: String,
    pub batch_id: String,
    pub original_batch_id: String,
    pub response: Message,
}

struct TurnResult {
    response: Message,
    tool_rounds: u32,
}

impl TablekeeperService {
    /// Single-user chat message
    pub async fn chat(
        &self,
        session: &Session,
        message: &str,
        conversation_id: Option<&str>,
        context: Option<&serde_json::Value>,
    ) -> ServiceResult<ChatTurn> {
        if message.trim().is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "message is empty".to_string(),
            });
        }

        let conversation = match conversation_id {
            Some(id) => self.world_conversation(&session.world_id, id)?,
            None => self
                .db
                .get_or_create_conversation(&session.world_id, &self.default_title())?,
        };

        let user_message =
            self.db
                .add_message(&conversation.id, MessageRole::User, message, context)?;
        let turn = self.run_turn(session, &conversation.id).await?;

        Ok(ChatTurn {
            conversation_id: conversation.id,
            user_message_id: user_message.id,
            response: turn.response,
            tool_rounds: turn.tool_rounds,
        })
    }

    /// Simultaneous actions from several participants as one turn
    pub async fn chat_batch(
        &self,
        session: &Session,
        request: BatchRequest,
        context: Option<&serde_json::Value>,
    ) -> ServiceResult<BatchTurn> {
        let processed = self
            .batches
            .process_batch(&session.world_id, request, context)?;

        let turn = self.run_turn(session, &processed.conversation_id).await?;
        self.batches
            .record_response(&processed.batch_id, &turn.response.id)?;

        Ok(BatchTurn {
            conversation_id: processed.conversation_id,
            batch_id: processed.batch_id,
            participant_count: processed.participant_count,
            user_message_id: processed.user_message.id,
            response: turn.response,
        })
    }

    /// GM rejects a batch response and asks again with a correction
    pub async fn veto(
        &self,
        session: &Session,
        batch_id: &str,
        correction: &str,
        context: Option<&serde_json::Value>,
    ) -> ServiceResult<VetoTurn> {
        let veto = self
            .batches
            .process_veto(&session.world_id, batch_id, correction, context)?;

        self.batches.resend(batch_id)?;
        let turn = self.run_turn(session, &veto.conversation_id).await?;
        self.batches.record_response(batch_id, &turn.response.id)?;

        Ok(VetoTurn {
            conversation_id: veto.conversation_id,
            original_batch_id: veto.original_batch_id,
            veto_count: veto.veto_count,
            veto_message_id: veto.veto_message.id,
            response: turn.response,
        })
    }

    /// GM asks for another response to the same batch
    pub async fn regenerate(
        &self,
        session: &Session,
        batch_id: &str,
        context: Option<&serde_json::Value>,
    ) -> ServiceResult<RegenerateTurn> {
        let regen = self
            .batches
            .process_regenerate(&session.world_id, batch_id, context)?;

        let turn = self.run_turn(session, &regen.conversation_id).await?;
        self.batches
            .record_response(&regen.batch_id, &turn.response.id)?;

        Ok(RegenerateTurn {
            conversation_id: regen.conversation_id,
            batch_id: regen.batch_id,
            original_batch_id: regen.original_batch_id,
            response: turn.response,
        })
    }

    async fn run_turn(&self, session: &Session, conversation_id: &str) -> ServiceResult<TurnResult> {
        let world_id = session.world_id.as_str();
        let api_key = self.db.get_api_key(world_id)?.ok_or_else(|| {
            ServiceError::Provider(ProviderError::MissingCredential {
                world_id: world_id.to_string(),
            })
        })?;
        let config = self.runtime_config.dynamic_snapshot();

        let history = if config.context.summarization_enabled {
            self.summarized_history(&api_key, conversation_id).await?
        } else {
            self.context
                .get_messages_for_context(conversation_id, config.context.max_history_tokens)?
        };
        let canon = self
            .context
            .get_canon_for_context(world_id, config.context.max_canon_tokens)?;

        let summary_heading = self
            .i18n
            .get(DEFAULT_LOCALE, "conversation-summary-heading", None);
        let messages = to_api_messages(&history, &summary_heading);
        if messages.is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "no user message fits in the context budget".to_string(),
            });
        }

        let mut request = LlmRequest {
            model: config.llm.model.clone(),
            max_tokens: config.llm.max_tokens,
            system: Some(build_system_prompt(session, &canon)),
            messages,
            tools: REGISTRY.definitions(),
        };

        let initial = self.llm.send(&api_key, &request).await?;
        let bridge = Arc::clone(&self.tool_bridge);
        let outcome = resolve_tool_use(
            self.llm.as_ref(),
            &api_key,
            &mut request,
            initial,
            |name, input| {
                let bridge = bridge.clone();
                let world_id = world_id.to_string();
                async move { bridge.request(&world_id, &name, input).await }
            },
            config.agentic_loop.max_tool_rounds,
        )
        .await?;

        let snapshot = serde_json::json!({
            "historyMessages": history.len(),
            "canonEntries": canon.messages.len(),
            "canonTokens": canon.total_tokens,
            "toolRounds": outcome.rounds,
            "toolCalls": outcome.tool_calls,
        });
        let response = self.db.add_message(
            conversation_id,
            MessageRole::Assistant,
            &outcome.text,
            Some(&snapshot),
        )?;

        info!(
            world_id = %world_id,
            conversation_id = %conversation_id,
            tool_rounds = outcome.rounds,
            tool_calls = outcome.tool_calls,
            "Turn completed"
        );

        Ok(TurnResult {
            response,
            tool_rounds: outcome.rounds,
        })
    }

    /// History with summary fallback; summarizes overflow when asked to
    async fn summarized_history(
        &self,
        api_key: &str,
        conversation_id: &str,
    ) -> ServiceResult<Vec<ContextMessage>> {
        let config = self.runtime_config.dynamic_snapshot();
        let max_tokens = config.context.max_history_tokens;
        let recent = config.context.recent_message_count;

        let SummarizedHistory {
            messages,
            needs_summarization,
            old_messages,
            summarized_through,
        } = self
            .context
            .get_messages_with_summary(conversation_id, max_tokens, recent)?;

        let (Some(old_messages), Some(summarized_through), true) =
            (old_messages, summarized_through, needs_summarization)
        else {
            return Ok(messages);
        };

        let previous_summary = self
            .db
            .get_messages(conversation_id)?
            .into_iter()
            .rev()
            .find(|m| m.role == MessageRole::Summary)
            .map(|m| m.content);

        match self
            .summarize(api_key, &old_messages, previous_summary.as_deref())
            .await
        {
            Ok(summary) => {
                self.context
                    .store_summary(conversation_id, &summary, &summarized_through)?;
                metrics::counter!("tablekeeper_summaries_total", "outcome" => "ok").increment(1);
                info!(
                    conversation_id = %conversation_id,
                    summarized = old_messages.len(),
                    "Stored conversation summary"
                );
                Ok(self
                    .context
                    .get_messages_with_summary(conversation_id, max_tokens, recent)?
                    .messages)
            }
            Err(e) => {
                metrics::counter!("tablekeeper_summaries_total", "outcome" => "error")
                    .increment(1);
                warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "Summarization failed, continuing with recent messages"
                );
                Ok(messages)
            }
        }
    }

    async fn summarize(
        &self,
        api_key: &str,
        old_messages: &[ContextMessage],
        previous_summary: Option<&str>,
    ) -> ServiceResult<String> {
        let config = self.runtime_config.dynamic_snapshot();
        let (system, transcript) = build_summary_prompt(old_messages, previous_summary);

        let request = LlmRequest {
            model: config.llm.model.clone(),
            max_tokens: config.llm.max_tokens,
            system: Some(system),
            messages: vec![ApiMessage::user(transcript)],
            tools: Vec::new(),
        };

        let summary = self.llm.send(api_key, &request).await?.text();
        if summary.trim().is_empty() {
            return Err(ServiceError::Internal {
                message: "summary response was empty".to_string(),
            });
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BatchMessage, BatchStatus};
    use crate::llm::testing::{text_response, tool_use_response};
    use crate::llm::{ContentBlock, MessageContent, Role};
    use crate::service::tests::test_service;
    use crate::session::tests::{fake_connection, identity};
    use crate::websocket::ServerFrame;

    fn batch_request(id: &str) -> BatchRequest {
        BatchRequest {
            batch_id: Some(id.to_string()),
            messages: vec![
                BatchMessage {
                    user_id: "u1".to_string(),
                    user_name: Some("Alice".to_string()),
                    character_name: None,
                    content: "search room".to_string(),
                    timestamp: None,
                },
                BatchMessage {
                    user_id: "u2".to_string(),
                    user_name: Some("Bob".to_string()),
                    character_name: None,
                    content: "attack goblin".to_string(),
                    timestamp: None,
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_chat_persists_both_sides() {
        let (service, gateway) = test_service();
        let (conn, _rx) = fake_connection();
        let session = service
            .sessions
            .authenticate(&conn, "world-1", identity("gm", true), Some("sk"))
            .unwrap();
        gateway.push_text("The tavern is quiet.");

        let turn = service
            .chat(&session, "I look around", None, None)
            .await
            .unwrap();
        assert_eq!(turn.response.content, "The tavern is quiet.");
        assert_eq!(turn.response.role, MessageRole::Assistant);

        let messages = service.db.get_messages(&turn.conversation_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "I look around");

        let sent = gateway.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].system.as_deref().unwrap().contains("world-1"));
        assert_eq!(sent[0].tools.len(), REGISTRY.len());
    }

    #[tokio::test]
    async fn test_chat_resolves_tools_through_client() {
        let (service, gateway) = test_service();
        let (conn, mut rx) = fake_connection();
        let session = service
            .sessions
            .authenticate(&conn, "world-1", identity("gm", true), Some("sk"))
            .unwrap();

        gateway.push(Ok(tool_use_response(&[(
            "t1",
            "roll_dice",
            serde_json::json!({"formula": "1d20"}),
        )])));
        gateway.push_text("You rolled a 15 and find a hidden door.");

        let client = {
            let service = service.clone();
            tokio::spawn(async move {
                let Some(ServerFrame::ToolExecute(push)) = rx.recv().await else {
                    panic!("expected tool-execute push");
                };
                assert_eq!(push.tool_name, "roll_dice");
                service
                    .tool_bridge
                    .deliver(&push.call_id, serde_json::json!({"total": 15}), None);
            })
        };

        let turn = service
            .chat(&session, "I search for secret doors", None, None)
            .await
            .unwrap();
        client.await.unwrap();

        assert_eq!(turn.tool_rounds, 1);
        assert_eq!(turn.response.content, "You rolled a 15 and find a hidden door.");

        let second = &gateway.requests()[1];
        let MessageContent::Blocks(blocks) = &second.messages.last().unwrap().content else {
            panic!("expected tool results");
        };
        assert_eq!(
            blocks[0],
            ContentBlock::ToolResult {
                tool_use_id: "t1".to_string(),
                content: r#"{"total":15}"#.to_string(),
                is_error: None,
            }
        );
    }

    #[tokio::test]
    async fn test_chat_batch_links_response() {
        let (service, gateway) = test_service();
        let (conn, _rx) = fake_connection();
        let session = service
            .sessions
            .authenticate(&conn, "world-1", identity("gm", true), Some("sk"))
            .unwrap();
        gateway.push_text("Alice finds a key while Bob strikes the goblin.");

        let turn = service
            .chat_batch(&session, batch_request("b1"), None)
            .await
            .unwrap();
        assert_eq!(turn.participant_count, 2);

        let batch = service.db.get_batch("b1").unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Sent);
        assert_eq!(batch.response_message_id.as_deref(), Some(turn.response.id.as_str()));

        let first = &gateway.requests()[0];
        assert_eq!(first.messages.len(), 1);
        assert_eq!(first.messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_veto_resends_with_correction() {
        let (service, gateway) = test_service();
        let (conn, _rx) = fake_connection();
        let session = service
            .sessions
            .authenticate(&conn, "world-1", identity("gm", true), Some("sk"))
            .unwrap();
        gateway.push_text("The innkeeper smiles warmly.");
        gateway.push_text("The innkeeper draws a knife.");

        service
            .chat_batch(&session, batch_request("b1"), None)
            .await
            .unwrap();
        let turn = service
            .veto(&session, "b1", "make the NPC hostile", None)
            .await
            .unwrap();

        assert_eq!(turn.veto_count, 1);
        assert_eq!(turn.response.content, "The innkeeper draws a knife.");

        let batch = service.db.get_batch("b1").unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Sent);
        assert_eq!(batch.veto_count, 1);
        assert_eq!(batch.response_message_id.as_deref(), Some(turn.response.id.as_str()));

        let retry = &gateway.requests()[1];
        let last = retry.messages.last().unwrap();
        let MessageContent::Text(text) = &last.content else {
            panic!("expected text message");
        };
        assert!(text.contains("=== GM CORRECTION ==="));
        assert!(text.contains("make the NPC hostile"));
    }

    #[tokio::test]
    async fn test_regenerate_leaves_original_untouched() {
        let (service, gateway) = test_service();
        let (conn, _rx) = fake_connection();
        let session = service
            .sessions
            .authenticate(&conn, "world-1", identity("gm", true), Some("sk"))
            .unwrap();
        gateway.push_text("First take.");
        gateway.push_text("Second take.");

        let first = service
            .chat_batch(&session, batch_request("b1"), None)
            .await
            .unwrap();
        let regen = service.regenerate(&session, "b1", None).await.unwrap();

        assert_eq!(regen.batch_id, "b1-regen-1");
        assert_eq!(regen.response.content, "Second take.");

        let original = service.db.get_batch("b1").unwrap().unwrap();
        assert_eq!(original.veto_count, 0);
        assert_eq!(
            original.response_message_id.as_deref(),
            Some(first.response.id.as_str())
        );
    }

    #[tokio::test]
    async fn test_provider_error_fails_turn_without_reply() {
        let (service, gateway) = test_service();
        let (conn, _rx) = fake_connection();
        let session = service
            .sessions
            .authenticate(&conn, "world-1", identity("gm", true), Some("sk"))
            .unwrap();
        gateway.push(Err(ServiceError::Provider(ProviderError::Request {
            status: 401,
            message: "invalid x-api-key".to_string(),
        })));

        let err = service.chat(&session, "hello", None, None).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Provider(ProviderError::Request { status: 401, .. })
        ));

        let conversation = service
            .db
            .get_current_conversation("world-1")
            .unwrap()
            .unwrap();
        let messages = service.db.get_messages(&conversation.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_overflowing_history_is_summarized() {
        let (service, gateway) = test_service();
        let (conn, _rx) = fake_connection();
        let session = service
            .sessions
            .authenticate(&conn, "world-1", identity("gm", true), Some("sk"))
            .unwrap();

        let mut updates = std::collections::HashMap::new();
        updates.insert("context.max_history_tokens".to_string(), serde_json::json!(30));
        updates.insert("context.recent_message_count".to_string(), serde_json::json!(2));
        service.update_settings(updates).unwrap();

        let conversation = service
            .db
            .get_or_create_conversation("world-1", "Session")
            .unwrap();
        for (role, tag) in [
            (MessageRole::User, 'a'),
            (MessageRole::Assistant, 'b'),
            (MessageRole::User, 'c'),
            (MessageRole::Assistant, 'd'),
        ] {
            let content: String = std::iter::repeat_n(tag, 40).collect();
            service
                .db
                .add_message(&conversation.id, role, &content, None)
                .unwrap();
        }

        gateway.push(Ok(text_response("The party explored the crypt.")));
        gateway.push_text("You descend further.");

        let turn = service
            .chat(&session, "We go down", Some(&conversation.id), None)
            .await
            .unwrap();
        assert_eq!(turn.response.content, "You descend further.");

        let requests = gateway.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].tools.is_empty());

        let stored = service.db.get_messages(&conversation.id).unwrap();
        assert!(stored.iter().any(|m| m.role == MessageRole::Summary
            && m.content == "The party explored the crypt."));

        let MessageContent::Text(first) = &requests[1].messages[0].content else {
            panic!("expected summary text");
        };
        assert!(first.starts_with("[Summary of earlier conversation]"));
    }
}
