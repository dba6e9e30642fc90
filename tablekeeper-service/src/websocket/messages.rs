//! WebSocket frame types.
//!
//! Inbound frames are `{type, requestId, ...payload}` with camelCase payload
//! fields. The `type` names an [`Operation`]; the remaining fields are
//! decoded into that operation's payload struct.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::db::{BatchMessage, GmRuling};
use crate::error::{ServiceError, ServiceResult};

/// Every operation a client may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Operation {
    Auth,
    Ping,
    Chat,
    ChatBatch,
    Veto,
    Regenerate,
    CompleteBatch,
    History,
    ToolResult,
    NewConversation,
    ListConversations,
    GetConversation,
    DeleteConversation,
    RenameConversation,
    ClearConversation,
    SwitchConversation,
    PublishToCanon,
    ListCanon,
    UpdateCanon,
    DeleteCanon,
    GetSettings,
    UpdateSettings,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Envelope of an inbound frame before the operation is resolved
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Opaque client correlation id, echoed back as sent
    #[serde(rename = "requestId", default)]
    pub request_id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl RawFrame {
    pub fn operation(&self) -> ServiceResult<Operation> {
        self.frame_type
            .parse()
            .map_err(|_| ServiceError::UnknownOperation {
                operation: self.frame_type.clone(),
            })
    }

    /// Decode the payload fields into the operation's request type
    pub fn payload<T: DeserializeOwned>(&self) -> ServiceResult<T> {
        serde_json::from_value(serde_json::Value::Object(self.payload.clone())).map_err(|e| {
            ServiceError::InvalidRequest {
                message: format!("{}: {}", self.frame_type, e),
            }
        })
    }
}

// ==========================================
// Inbound payloads
// ==========================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub world_id: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_gm: bool,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Scene/world snapshot stored with the user message
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBatchPayload {
    #[serde(default)]
    pub batch_id: Option<String>,
    pub messages: Vec<BatchMessage>,
    #[serde(default)]
    pub gm_rulings: Vec<GmRuling>,
    #[serde(default)]
    pub formatted_prompt: Option<String>,
    #[serde(default)]
    pub time_window_seconds: u32,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VetoPayload {
    pub batch_id: String,
    pub correction: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegeneratePayload {
    pub batch_id: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteBatchPayload {
    pub batch_id: String,
    #[serde(default)]
    pub response_message_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPayload {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    pub tool_call_id: String,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversationPayload {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListConversationsPayload {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationIdPayload {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameConversationPayload {
    pub conversation_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishCanonPayload {
    pub content: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub original_message_id: Option<String>,
    #[serde(default)]
    pub scene_context: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCanonPayload {
    pub entry_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonIdPayload {
    pub entry_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSettingsPayload {
    pub settings: HashMap<String, serde_json::Value>,
}

// ==========================================
// Outbound frames
// ==========================================

/// Frames written to a client socket
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Response(ResponseFrame),
    Error(ErrorFrame),
    ToolExecute(ToolExecuteFrame),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub request_id: Option<serde_json::Value>,
    pub success: bool,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub request_id: Option<serde_json::Value>,
    pub success: bool,
    pub error: String,
    pub code: &'static str,
}

/// Server push asking the client to run a tool
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecuteFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub call_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
}

impl ServerFrame {
    pub fn response(
        operation: Operation,
        request_id: Option<serde_json::Value>,
        data: serde_json::Value,
    ) -> Self {
        ServerFrame::Response(ResponseFrame {
            frame_type: operation.as_str(),
            request_id,
            success: true,
            data,
        })
    }

    pub fn error(
        request_id: Option<serde_json::Value>,
        error: String,
        code: &'static str,
    ) -> Self {
        ServerFrame::Error(ErrorFrame {
            frame_type: "error",
            request_id,
            success: false,
            error,
            code,
        })
    }

    pub fn tool_execute(call_id: String, tool_name: String, tool_input: serde_json::Value) -> Self {
        ServerFrame::ToolExecute(ToolExecuteFrame {
            frame_type: "tool-execute",
            call_id,
            tool_name,
            tool_input,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names_are_kebab_case() {
        assert_eq!(Operation::ChatBatch.as_str(), "chat-batch");
        assert_eq!(Operation::PublishToCanon.as_str(), "publish-to-canon");
        assert_eq!("tool-result".parse::<Operation>().unwrap(), Operation::ToolResult);
        assert!("chat_batch".parse::<Operation>().is_err());
    }

    #[test]
    fn test_raw_frame_splits_envelope_and_payload() {
        let frame: RawFrame = serde_json::from_str(
            r#"{"type":"veto","requestId":"r-1","batchId":"b1","correction":"make the NPC hostile"}"#,
        )
        .unwrap();

        assert_eq!(frame.operation().unwrap(), Operation::Veto);
        assert_eq!(frame.request_id, Some(serde_json::json!("r-1")));

        let veto: VetoPayload = frame.payload().unwrap();
        assert_eq!(veto.batch_id, "b1");
        assert_eq!(veto.correction, "make the NPC hostile");
        assert!(veto.context.is_none());
    }

    #[test]
    fn test_unknown_operation_and_bad_payload() {
        let frame: RawFrame =
            serde_json::from_str(r#"{"type":"summon-dragon","requestId":"r-2"}"#).unwrap();
        assert!(matches!(
            frame.operation().unwrap_err(),
            ServiceError::UnknownOperation { operation } if operation == "summon-dragon"
        ));

        let frame: RawFrame = serde_json::from_str(r#"{"type":"veto"}"#).unwrap();
        assert!(frame.request_id.is_none());
        assert!(matches!(
            frame.payload::<VetoPayload>().unwrap_err(),
            ServiceError::InvalidRequest { .. }
        ));
    }

    #[test]
    fn test_outbound_frame_shapes() {
        let ok = serde_json::to_value(ServerFrame::response(
            Operation::Ping,
            Some(serde_json::json!("r-3")),
            serde_json::json!({"timestamp": 1}),
        ))
        .unwrap();
        assert_eq!(ok["type"], "ping");
        assert_eq!(ok["requestId"], "r-3");
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"]["timestamp"], 1);

        let err = serde_json::to_value(ServerFrame::error(
            None,
            "Batch not found".to_string(),
            "batch_not_found",
        ))
        .unwrap();
        assert_eq!(err["type"], "error");
        assert!(err["requestId"].is_null());
        assert_eq!(err["success"], false);
        assert_eq!(err["code"], "batch_not_found");

        let push = serde_json::to_value(ServerFrame::tool_execute(
            "call-1".to_string(),
            "roll_dice".to_string(),
            serde_json::json!({"formula": "1d20"}),
        ))
        .unwrap();
        assert_eq!(push["type"], "tool-execute");
        assert_eq!(push["callId"], "call-1");
        assert_eq!(push["toolName"], "roll_dice");
        assert_eq!(push["toolInput"]["formula"], "1d20");
    }
}
