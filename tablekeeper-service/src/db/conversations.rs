//! Conversation CRUD operations.
//!
//! The current conversation of a world is whichever one was updated last.

use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use super::models::Conversation;
use super::{Database, now_timestamp};
use crate::error::{DatabaseError, ServiceError, ServiceResult};

const CONVERSATION_COLUMNS: &str = "id, world_id, title, total_tokens, created_at, updated_at";

impl Database {
    /// Create a new conversation, which becomes the world's current one
    pub fn create_conversation(&self, world_id: &str, title: &str) -> ServiceResult<Conversation> {
        let conn = self.lock()?;
        let id = Uuid::new_v4().to_string();
        let now = now_timestamp();

        conn.execute(
            "INSERT INTO conversations (id, world_id, title, total_tokens, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            params![id, world_id, title, now],
        )
        .map_err(DatabaseError::Query)?;

        conn.query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id],
            Conversation::from_row,
        )
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Get a conversation by ID
    pub fn get_conversation(&self, id: &str) -> ServiceResult<Option<Conversation>> {
        let conn = self.lock()?;

        conn.query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id],
            Conversation::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Most recently updated conversation of a world
    pub fn get_current_conversation(&self, world_id: &str) -> ServiceResult<Option<Conversation>> {
        let conn = self.lock()?;

        conn.query_row(
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE world_id = ?1 \
                 ORDER BY updated_at DESC, rowid DESC LIMIT 1"
            ),
            params![world_id],
            Conversation::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Current conversation of a world, creating one when the world has none
    pub fn get_or_create_conversation(
        &self,
        world_id: &str,
        default_title: &str,
    ) -> ServiceResult<Conversation> {
        match self.get_current_conversation(world_id)? {
            Some(conversation) => Ok(conversation),
            None => self.create_conversation(world_id, default_title),
        }
    }

    /// List conversations for a world, newest first
    pub fn list_conversations(
        &self,
        world_id: &str,
        limit: usize,
    ) -> ServiceResult<Vec<Conversation>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE world_id = ?1 \
                 ORDER BY updated_at DESC, rowid DESC LIMIT ?2"
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![world_id, limit as i64], Conversation::from_row)
            .map_err(DatabaseError::Query)?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)
            .map_err(Into::into)
    }

    pub fn rename_conversation(&self, id: &str, title: &str) -> ServiceResult<()> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE conversations SET title = ?1 WHERE id = ?2",
                params![title, id],
            )
            .map_err(DatabaseError::Query)?;

        if rows == 0 {
            return Err(ServiceError::ConversationNotFound {
                conversation_id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Bump `updated_at`, making the conversation current for its world
    pub fn touch_conversation(&self, id: &str) -> ServiceResult<()> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![now_timestamp(), id],
            )
            .map_err(DatabaseError::Query)?;

        if rows == 0 {
            return Err(ServiceError::ConversationNotFound {
                conversation_id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Delete a conversation with its messages and batches
    pub fn delete_conversation(&self, id: &str) -> ServiceResult<bool> {
        let conn = self.lock()?;

        let rows = conn
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Remove every message and batch but keep the conversation itself
    pub fn clear_conversation(&self, id: &str) -> ServiceResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        let rows = tx
            .execute(
                "UPDATE conversations SET total_tokens = 0, updated_at = ?1 WHERE id = ?2",
                params![now_timestamp(), id],
            )
            .map_err(DatabaseError::Query)?;
        if rows == 0 {
            return Err(ServiceError::ConversationNotFound {
                conversation_id: id.to_string(),
            });
        }

        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![id],
        )
        .map_err(DatabaseError::Query)?;
        tx.execute("DELETE FROM batches WHERE conversation_id = ?1", params![id])
            .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(())
    }
}
