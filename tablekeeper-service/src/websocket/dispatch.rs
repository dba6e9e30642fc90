//! Frame dispatch.
//!
//! `auth`, `ping` and `tool-result` are handled inline on the read loop.
//! Everything else is gated on the connection's session and runs on its own
//! task, so a chat turn waiting on a tool never blocks the `tool-result`
//! that answers it.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use super::messages::{
    AuthPayload, CanonIdPayload, ChatBatchPayload, ChatPayload, CompleteBatchPayload,
    ConversationIdPayload, HistoryPayload, ListConversationsPayload, NewConversationPayload,
    Operation, PublishCanonPayload, RawFrame, RegeneratePayload, RenameConversationPayload,
    ServerFrame, ToolResultPayload, UpdateCanonPayload, UpdateSettingsPayload, VetoPayload,
};
use crate::batch::BatchRequest;
use crate::error::{DatabaseError, ServiceError, ServiceResult};
use crate::service::{CanonPublication, DEFAULT_LOCALE, TablekeeperService};
use crate::session::{Connection, ConnectionHandle, Identity, Session};

/// Operations reserved for the game master
fn requires_gm(operation: Operation) -> bool {
    match operation {
        Operation::Veto
        | Operation::Regenerate
        | Operation::CompleteBatch
        | Operation::DeleteConversation
        | Operation::ClearConversation
        | Operation::PublishToCanon
        | Operation::UpdateCanon
        | Operation::DeleteCanon
        | Operation::UpdateSettings => true,
        Operation::Auth
        | Operation::Ping
        | Operation::Chat
        | Operation::ChatBatch
        | Operation::History
        | Operation::ToolResult
        | Operation::NewConversation
        | Operation::ListConversations
        | Operation::GetConversation
        | Operation::RenameConversation
        | Operation::SwitchConversation
        | Operation::ListCanon
        | Operation::GetSettings => false,
    }
}

fn to_data<T: Serialize>(value: T) -> ServiceResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| DatabaseError::Serialization(e).into())
}

fn send_error(
    service: &TablekeeperService,
    handle: &ConnectionHandle,
    request_id: Option<serde_json::Value>,
    error: &ServiceError,
) {
    metrics::counter!("tablekeeper_ws_errors_total", "code" => error.error_code()).increment(1);
    handle.send(ServerFrame::error(
        request_id,
        error.user_message(&service.i18n, DEFAULT_LOCALE),
        error.error_code(),
    ));
}

fn reply(
    service: &TablekeeperService,
    handle: &ConnectionHandle,
    operation: Operation,
    request_id: Option<serde_json::Value>,
    result: ServiceResult<serde_json::Value>,
) {
    match result {
        Ok(data) => {
            handle.send(ServerFrame::response(operation, request_id, data));
        }
        Err(e) => {
            debug!(
                connection_id = %handle.id(),
                operation = %operation,
                error = %e,
                "Operation failed"
            );
            send_error(service, handle, request_id, &e);
        }
    }
}

/// Handle one inbound text frame from `connection`
pub async fn handle_text(service: &Arc<TablekeeperService>, connection: &Connection, text: &str) {
    let handle = connection.handle();

    let frame: RawFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection_id = %connection.id(), error = %e, "Failed to parse frame");
            let error = ServiceError::InvalidRequest {
                message: format!("malformed frame: {e}"),
            };
            send_error(service, handle, None, &error);
            return;
        }
    };
    let request_id = frame.request_id.clone();

    let operation = match frame.operation() {
        Ok(operation) => operation,
        Err(e) => {
            send_error(service, handle, request_id, &e);
            return;
        }
    };
    metrics::counter!("tablekeeper_ws_operations_total", "operation" => operation.as_str())
        .increment(1);

    match operation {
        Operation::Auth => {
            let result = authenticate(service, connection, &frame);
            reply(service, handle, operation, request_id, result);
        }
        Operation::Ping => {
            let data = json!({ "pong": true, "timestamp": chrono::Utc::now().timestamp_millis() });
            reply(service, handle, operation, request_id, Ok(data));
        }
        Operation::ToolResult => {
            // Answers a push; only malformed results get a frame back
            if let Err(e) = deliver_tool_result(service, connection, &frame) {
                send_error(service, handle, request_id, &e);
            }
        }
        _ => {
            let gate = if requires_gm(operation) {
                service.sessions.require_gm(connection, operation.as_str())
            } else {
                service.sessions.require_auth(connection)
            };
            let session = match gate {
                Ok(session) => session,
                Err(e) => {
                    send_error(service, handle, request_id, &e);
                    return;
                }
            };

            let service = Arc::clone(service);
            let handle = handle.clone();
            tokio::spawn(async move {
                let result = execute(&service, &session, operation, &frame).await;
                reply(&service, &handle, operation, request_id, result);
            });
        }
    }
}

fn authenticate(
    service: &TablekeeperService,
    connection: &Connection,
    frame: &RawFrame,
) -> ServiceResult<serde_json::Value> {
    let payload: AuthPayload = frame.payload()?;
    let session = service.authenticate(
        connection,
        &payload.world_id,
        Identity {
            user_id: payload.user_id,
            user_name: payload.user_name,
            display_name: payload.display_name,
            is_gm: payload.is_gm,
        },
        payload.api_key.as_deref(),
    )?;

    Ok(json!({
        "worldId": session.world_id,
        "userId": session.user_id,
        "isGm": session.is_gm,
        "connectionId": connection.id(),
    }))
}

fn deliver_tool_result(
    service: &TablekeeperService,
    connection: &Connection,
    frame: &RawFrame,
) -> ServiceResult<()> {
    service.sessions.require_auth(connection)?;
    let payload: ToolResultPayload = frame.payload()?;
    service
        .tool_bridge
        .deliver(&payload.tool_call_id, payload.result, payload.error);
    Ok(())
}

/// Run an authenticated operation. `Auth`, `Ping` and `ToolResult` never
/// reach here.
async fn execute(
    service: &TablekeeperService,
    session: &Session,
    operation: Operation,
    frame: &RawFrame,
) -> ServiceResult<serde_json::Value> {
    let world_id = session.world_id.as_str();

    match operation {
        Operation::Auth | Operation::Ping | Operation::ToolResult => {
            Err(ServiceError::Internal {
                message: format!("{operation} is handled inline"),
            })
        }
        Operation::Chat => {
            let p: ChatPayload = frame.payload()?;
            to_data(
                service
                    .chat(
                        session,
                        &p.message,
                        p.conversation_id.as_deref(),
                        p.context.as_ref(),
                    )
                    .await?,
            )
        }
        Operation::ChatBatch => {
            let p: ChatBatchPayload = frame.payload()?;
            let request = BatchRequest {
                batch_id: p.batch_id,
                messages: p.messages,
                gm_rulings: p.gm_rulings,
                formatted_prompt: p.formatted_prompt,
                time_window_seconds: p.time_window_seconds,
            };
            to_data(service.chat_batch(session, request, p.context.as_ref()).await?)
        }
        Operation::Veto => {
            let p: VetoPayload = frame.payload()?;
            to_data(
                service
                    .veto(session, &p.batch_id, &p.correction, p.context.as_ref())
                    .await?,
            )
        }
        Operation::Regenerate => {
            let p: RegeneratePayload = frame.payload()?;
            to_data(
                service
                    .regenerate(session, &p.batch_id, p.context.as_ref())
                    .await?,
            )
        }
        Operation::CompleteBatch => {
            let p: CompleteBatchPayload = frame.payload()?;
            to_data(service.batches.complete_batch(
                world_id,
                &p.batch_id,
                p.response_message_id.as_deref(),
            )?)
        }
        Operation::History => {
            let p: HistoryPayload = frame.payload()?;
            to_data(service.history(world_id, p.conversation_id.as_deref(), p.limit)?)
        }
        Operation::NewConversation => {
            let p: NewConversationPayload = frame.payload()?;
            to_data(service.new_conversation(world_id, p.title.as_deref())?)
        }
        Operation::ListConversations => {
            let p: ListConversationsPayload = frame.payload()?;
            to_data(service.list_conversations(world_id, p.limit)?)
        }
        Operation::GetConversation => {
            let p: ConversationIdPayload = frame.payload()?;
            to_data(service.get_conversation(world_id, &p.conversation_id)?)
        }
        Operation::DeleteConversation => {
            let p: ConversationIdPayload = frame.payload()?;
            service.delete_conversation(world_id, &p.conversation_id)?;
            Ok(json!({ "conversationId": p.conversation_id, "deleted": true }))
        }
        Operation::RenameConversation => {
            let p: RenameConversationPayload = frame.payload()?;
            to_data(service.rename_conversation(world_id, &p.conversation_id, &p.title)?)
        }
        Operation::ClearConversation => {
            let p: ConversationIdPayload = frame.payload()?;
            to_data(service.clear_conversation(world_id, &p.conversation_id)?)
        }
        Operation::SwitchConversation => {
            let p: ConversationIdPayload = frame.payload()?;
            to_data(service.switch_conversation(world_id, &p.conversation_id)?)
        }
        Operation::PublishToCanon => {
            let p: PublishCanonPayload = frame.payload()?;
            to_data(service.publish_to_canon(
                session,
                CanonPublication {
                    content: &p.content,
                    conversation_id: p.conversation_id.as_deref(),
                    original_message_id: p.original_message_id.as_deref(),
                    scene_context: p.scene_context.as_deref(),
                },
            )?)
        }
        Operation::ListCanon => to_data(service.list_canon(world_id)?),
        Operation::UpdateCanon => {
            let p: UpdateCanonPayload = frame.payload()?;
            to_data(service.update_canon(world_id, &p.entry_id, &p.content)?)
        }
        Operation::DeleteCanon => {
            let p: CanonIdPayload = frame.payload()?;
            service.delete_canon(world_id, &p.entry_id)?;
            Ok(json!({ "entryId": p.entry_id, "deleted": true }))
        }
        Operation::GetSettings => to_data(service.get_settings()?),
        Operation::UpdateSettings => {
            let p: UpdateSettingsPayload = frame.payload()?;
            to_data(service.update_settings(p.settings)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::test_service;
    use crate::session::tests::fake_connection;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn next_json(rx: &mut UnboundedReceiver<ServerFrame>) -> serde_json::Value {
        serde_json::to_value(rx.recv().await.unwrap()).unwrap()
    }

    async fn auth(
        service: &Arc<TablekeeperService>,
        connection: &Connection,
        rx: &mut UnboundedReceiver<ServerFrame>,
        is_gm: bool,
    ) {
        let frame = json!({
            "type": "auth",
            "requestId": "r-auth",
            "worldId": "world-1",
            "userId": if is_gm { "gm" } else { "p1" },
            "userName": "Dana",
            "isGm": is_gm,
            "apiKey": "sk-test"
        });
        handle_text(service, connection, &frame.to_string()).await;
        let reply = next_json(rx).await;
        assert_eq!(reply["success"], true);
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_without_request_id() {
        let (service, _gateway) = test_service();
        let (conn, mut rx) = fake_connection();

        handle_text(&service, &conn, "{not json").await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["requestId"], serde_json::Value::Null);
        assert_eq!(reply["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let (service, _gateway) = test_service();
        let (conn, mut rx) = fake_connection();

        handle_text(&service, &conn, r#"{"type":"teleport","requestId":"r1"}"#).await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["requestId"], "r1");
        assert_eq!(reply["code"], "unknown_operation");
    }

    #[tokio::test]
    async fn test_operations_require_auth() {
        let (service, _gateway) = test_service();
        let (conn, mut rx) = fake_connection();

        handle_text(&service, &conn, r#"{"type":"list-canon","requestId":"r1"}"#).await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["success"], false);
        assert_eq!(reply["code"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_player_cannot_veto() {
        let (service, _gateway) = test_service();
        let (conn, mut rx) = fake_connection();
        auth(&service, &conn, &mut rx, false).await;

        let frame = json!({"type": "veto", "requestId": "r2", "batchId": "b1", "correction": "no"});
        handle_text(&service, &conn, &frame.to_string()).await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["code"], "forbidden");
    }

    #[tokio::test]
    async fn test_ping_echoes_request_id() {
        let (service, _gateway) = test_service();
        let (conn, mut rx) = fake_connection();

        handle_text(&service, &conn, r#"{"type":"ping","requestId":"p1"}"#).await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "ping");
        assert_eq!(reply["requestId"], "p1");
        assert_eq!(reply["data"]["pong"], true);
    }

    #[tokio::test]
    async fn test_numeric_request_id_is_echoed_unchanged() {
        let (service, _gateway) = test_service();
        let (conn, mut rx) = fake_connection();

        handle_text(&service, &conn, r#"{"type":"ping","requestId":42}"#).await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["success"], true);
        assert_eq!(reply["requestId"], 42);

        handle_text(&service, &conn, r#"{"type":"list-canon","requestId":7}"#).await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["code"], "unauthenticated");
        assert_eq!(reply["requestId"], 7);
    }

    #[tokio::test]
    async fn test_chat_with_tool_round_over_frames() {
        let (service, gateway) = test_service();
        let (conn, mut rx) = fake_connection();
        auth(&service, &conn, &mut rx, true).await;

        gateway.push(Ok(crate::llm::testing::tool_use_response(&[(
            "t1",
            "get_current_scene",
            json!({}),
        )])));
        gateway.push_text("You stand in a moonlit courtyard.");

        let chat = json!({"type": "chat", "requestId": "c1", "message": "Where am I?"});
        handle_text(&service, &conn, &chat.to_string()).await;

        let push = next_json(&mut rx).await;
        assert_eq!(push["type"], "tool-execute");
        assert_eq!(push["toolName"], "get_current_scene");

        let result = json!({
            "type": "tool-result",
            "toolCallId": push["callId"],
            "result": {"name": "Courtyard"}
        });
        handle_text(&service, &conn, &result.to_string()).await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "chat");
        assert_eq!(reply["requestId"], "c1");
        assert_eq!(
            reply["data"]["response"]["content"],
            "You stand in a moonlit courtyard."
        );
        assert_eq!(reply["data"]["toolRounds"], 1);
    }

    #[tokio::test]
    async fn test_gm_settings_round_trip() {
        let (service, _gateway) = test_service();
        let (conn, mut rx) = fake_connection();
        auth(&service, &conn, &mut rx, true).await;

        let update = json!({
            "type": "update-settings",
            "requestId": "s1",
            "settings": {"agentic_loop.max_tool_rounds": 3}
        });
        handle_text(&service, &conn, &update.to_string()).await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["success"], true);
        assert_eq!(reply["data"]["values"]["agentic_loop.max_tool_rounds"], 3);
        assert_eq!(service.runtime_config.dynamic().agentic_loop.max_tool_rounds, 3);
    }
}
