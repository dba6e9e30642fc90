//! Canon entry storage.

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::CanonEntry;
use super::{Database, now_timestamp};
use crate::context::estimate_tokens;
use crate::error::{DatabaseError, ServiceError, ServiceResult};

const CANON_COLUMNS: &str = "id, world_id, conversation_id, content, published_by, \
    published_by_name, original_message_id, scene_context, token_count, created_at";

/// Fields supplied when publishing a canon entry
#[derive(Debug, Clone)]
pub struct NewCanonEntry<'a> {
    pub world_id: &'a str,
    pub conversation_id: &'a str,
    pub content: &'a str,
    pub published_by: &'a str,
    pub published_by_name: &'a str,
    pub original_message_id: Option<&'a str>,
    pub scene_context: Option<&'a str>,
}

fn select_entry(conn: &Connection, id: &str) -> ServiceResult<Option<CanonEntry>> {
    conn.query_row(
        &format!("SELECT {CANON_COLUMNS} FROM canon_entries WHERE id = ?1"),
        params![id],
        CanonEntry::from_row,
    )
    .optional()
    .map_err(DatabaseError::Query)
    .map_err(Into::into)
}

impl Database {
    pub fn publish_to_canon(&self, entry: &NewCanonEntry<'_>) -> ServiceResult<CanonEntry> {
        let conn = self.lock()?;
        let id = Uuid::new_v4().to_string();

        conn.execute(
            r#"
            INSERT INTO canon_entries (
                id, world_id, conversation_id, content, published_by, published_by_name,
                original_message_id, scene_context, token_count, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                id,
                entry.world_id,
                entry.conversation_id,
                entry.content,
                entry.published_by,
                entry.published_by_name,
                entry.original_message_id,
                entry.scene_context,
                estimate_tokens(entry.content) as i64,
                now_timestamp(),
            ],
        )
        .map_err(DatabaseError::Query)?;

        select_entry(&conn, &id)?.ok_or(ServiceError::CanonEntryNotFound { entry_id: id })
    }

    pub fn get_canon_entry(&self, id: &str) -> ServiceResult<Option<CanonEntry>> {
        let conn = self.lock()?;
        select_entry(&conn, id)
    }

    /// All canon of a world, oldest first
    pub fn list_canon(&self, world_id: &str) -> ServiceResult<Vec<CanonEntry>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CANON_COLUMNS} FROM canon_entries WHERE world_id = ?1 ORDER BY rowid ASC"
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![world_id], CanonEntry::from_row)
            .map_err(DatabaseError::Query)?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)
            .map_err(Into::into)
    }

    /// Replace an entry's content, re-estimating its token count
    pub fn update_canon_message(&self, id: &str, content: &str) -> ServiceResult<CanonEntry> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE canon_entries SET content = ?1, token_count = ?2 WHERE id = ?3",
                params![content, estimate_tokens(content) as i64, id],
            )
            .map_err(DatabaseError::Query)?;

        if rows == 0 {
            return Err(ServiceError::CanonEntryNotFound {
                entry_id: id.to_string(),
            });
        }

        select_entry(&conn, id)?.ok_or_else(|| ServiceError::CanonEntryNotFound {
            entry_id: id.to_string(),
        })
    }

    pub fn delete_canon_message(&self, id: &str) -> ServiceResult<bool> {
        let conn = self.lock()?;

        let rows = conn
            .execute("DELETE FROM canon_entries WHERE id = ?1", params![id])
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }
}
