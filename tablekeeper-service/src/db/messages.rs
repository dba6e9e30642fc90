//! Message storage operations.
//!
//! Messages are append-only. Each insert also adds the message's token
//! estimate to its conversation and makes that conversation current.

use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use super::models::{Message, MessageRole};
use super::{Database, now_timestamp};
use crate::context::estimate_tokens;
use crate::error::{DatabaseError, ServiceError, ServiceResult};

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, token_count, context_snapshot, created_at";

impl Database {
    /// Append a message to a conversation
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        context_snapshot: Option<&serde_json::Value>,
    ) -> ServiceResult<Message> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        let id = Uuid::new_v4().to_string();
        let now = now_timestamp();
        let token_count = estimate_tokens(content);
        let snapshot_json = context_snapshot
            .map(serde_json::to_string)
            .transpose()
            .map_err(DatabaseError::Serialization)?;

        let updated = tx
            .execute(
                "UPDATE conversations SET total_tokens = total_tokens + ?1, updated_at = ?2 \
                 WHERE id = ?3",
                params![token_count as i64, now, conversation_id],
            )
            .map_err(DatabaseError::Query)?;
        if updated == 0 {
            return Err(ServiceError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            });
        }

        tx.execute(
            "INSERT INTO messages (id, conversation_id, role, content, token_count, context_snapshot, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                conversation_id,
                role.as_str(),
                content,
                token_count as i64,
                snapshot_json,
                now,
            ],
        )
        .map_err(DatabaseError::Query)?;

        let message = tx
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                Message::from_row,
            )
            .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(message)
    }

    /// All messages of a conversation in insertion order
    pub fn get_messages(&self, conversation_id: &str) -> ServiceResult<Vec<Message>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY rowid ASC"
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![conversation_id], Message::from_row)
            .map_err(DatabaseError::Query)?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)
            .map_err(Into::into)
    }

    pub fn get_message(&self, id: &str) -> ServiceResult<Option<Message>> {
        let conn = self.lock()?;

        conn.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id],
            Message::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }
}
