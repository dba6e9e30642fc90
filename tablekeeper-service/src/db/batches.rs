//! Batch storage operations.
//!
//! Status changes go through `update_batch_status` or `record_veto`, both of
//! which refuse transitions outside `BatchStatus::can_transition_to`.

use rusqlite::{Connection, OptionalExtension, params};

use super::models::{Batch, BatchMessage, BatchStatus, GmRuling};
use super::{Database, now_timestamp};
use crate::error::{DatabaseError, ServiceError, ServiceResult};

const BATCH_COLUMNS: &str = "id, conversation_id, world_id, messages, gm_rulings, \
    formatted_prompt, status, veto_count, veto_corrections, response_message_id, \
    time_window_seconds, regenerated_from, created_at, sent_at, completed_at";

/// Fields needed to insert a batch in the `collecting` state
#[derive(Debug, Clone)]
pub struct NewBatch<'a> {
    pub id: &'a str,
    pub conversation_id: &'a str,
    pub world_id: &'a str,
    pub messages: &'a [BatchMessage],
    pub gm_rulings: &'a [GmRuling],
    pub formatted_prompt: Option<&'a str>,
    pub time_window_seconds: u32,
    pub regenerated_from: Option<&'a str>,
}

fn select_batch(conn: &Connection, id: &str) -> ServiceResult<Option<Batch>> {
    conn.query_row(
        &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1"),
        params![id],
        Batch::from_row,
    )
    .optional()
    .map_err(DatabaseError::Query)
    .map_err(Into::into)
}

fn require_batch(conn: &Connection, id: &str) -> ServiceResult<Batch> {
    select_batch(conn, id)?.ok_or_else(|| ServiceError::BatchNotFound {
        batch_id: id.to_string(),
    })
}

fn check_transition(batch: &Batch, next: BatchStatus) -> ServiceResult<()> {
    if batch.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(ServiceError::InvalidBatchTransition {
            batch_id: batch.id.clone(),
            from: batch.status.as_str(),
            to: next.as_str(),
        })
    }
}

impl Database {
    pub fn create_batch(&self, batch: &NewBatch<'_>) -> ServiceResult<Batch> {
        let conn = self.lock()?;

        let messages_json =
            serde_json::to_string(batch.messages).map_err(DatabaseError::Serialization)?;
        let rulings_json =
            serde_json::to_string(batch.gm_rulings).map_err(DatabaseError::Serialization)?;

        conn.execute(
            r#"
            INSERT INTO batches (
                id, conversation_id, world_id, messages, gm_rulings, formatted_prompt,
                status, veto_count, veto_corrections, time_window_seconds, regenerated_from,
                created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, '[]', ?8, ?9, ?10)
            "#,
            params![
                batch.id,
                batch.conversation_id,
                batch.world_id,
                messages_json,
                rulings_json,
                batch.formatted_prompt,
                BatchStatus::Collecting.as_str(),
                batch.time_window_seconds as i64,
                batch.regenerated_from,
                now_timestamp(),
            ],
        )
        .map_err(DatabaseError::Query)?;

        require_batch(&conn, batch.id)
    }

    pub fn get_batch(&self, id: &str) -> ServiceResult<Option<Batch>> {
        let conn = self.lock()?;
        select_batch(&conn, id)
    }

    /// Move a batch to `next`, stamping `sent_at` or `completed_at`.
    ///
    /// A `formatted_prompt` replaces the stored prompt when given.
    pub fn update_batch_status(
        &self,
        id: &str,
        next: BatchStatus,
        formatted_prompt: Option<&str>,
    ) -> ServiceResult<Batch> {
        let conn = self.lock()?;
        let batch = require_batch(&conn, id)?;
        check_transition(&batch, next)?;

        let now = now_timestamp();
        let (sent_at, completed_at) = match next {
            BatchStatus::Sent => (Some(now.as_str()), None),
            BatchStatus::Completed => (None, Some(now.as_str())),
            _ => (None, None),
        };

        conn.execute(
            r#"
            UPDATE batches SET
                status = ?1,
                formatted_prompt = COALESCE(?2, formatted_prompt),
                sent_at = COALESCE(?3, sent_at),
                completed_at = COALESCE(?4, completed_at)
            WHERE id = ?5
            "#,
            params![next.as_str(), formatted_prompt, sent_at, completed_at, id],
        )
        .map_err(DatabaseError::Query)?;

        require_batch(&conn, id)
    }

    /// Mark a sent batch as vetoed and record the GM's correction
    pub fn record_veto(&self, id: &str, correction: &str) -> ServiceResult<Batch> {
        let conn = self.lock()?;
        let batch = require_batch(&conn, id)?;
        check_transition(&batch, BatchStatus::Vetoed)?;

        let mut corrections = batch.veto_corrections;
        corrections.push(correction.to_string());
        let corrections_json =
            serde_json::to_string(&corrections).map_err(DatabaseError::Serialization)?;

        conn.execute(
            "UPDATE batches SET status = ?1, veto_count = veto_count + 1, veto_corrections = ?2 \
             WHERE id = ?3",
            params![BatchStatus::Vetoed.as_str(), corrections_json, id],
        )
        .map_err(DatabaseError::Query)?;

        require_batch(&conn, id)
    }

    /// Link the assistant message that answered a batch
    pub fn set_batch_response(&self, id: &str, response_message_id: &str) -> ServiceResult<()> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE batches SET response_message_id = ?1 WHERE id = ?2",
                params![response_message_id, id],
            )
            .map_err(DatabaseError::Query)?;

        if rows == 0 {
            return Err(ServiceError::BatchNotFound {
                batch_id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Batches of a conversation in a given status, oldest first
    pub fn list_batches_by_status(
        &self,
        conversation_id: &str,
        status: BatchStatus,
    ) -> ServiceResult<Vec<Batch>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {BATCH_COLUMNS} FROM batches WHERE conversation_id = ?1 AND status = ?2 \
                 ORDER BY rowid ASC"
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![conversation_id, status.as_str()], Batch::from_row)
            .map_err(DatabaseError::Query)?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)
            .map_err(Into::into)
    }

    /// Number of batches derived from `original_id` by regeneration
    pub fn count_regenerations(&self, original_id: &str) -> ServiceResult<u32> {
        let conn = self.lock()?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM batches WHERE regenerated_from = ?1",
                params![original_id],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;

        Ok(count.max(0) as u32)
    }
}
