//! Per-world LLM credential store.

use rusqlite::{OptionalExtension, params};

use super::{Database, now_timestamp};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Store (or replace) the API key for a world
    pub fn set_api_key(&self, world_id: &str, api_key: &str) -> ServiceResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO world_credentials (world_id, api_key, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(world_id) DO UPDATE SET api_key = excluded.api_key, updated_at = excluded.updated_at",
            params![world_id, api_key, now_timestamp()],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    pub fn get_api_key(&self, world_id: &str) -> ServiceResult<Option<String>> {
        let conn = self.lock()?;

        conn.query_row(
            "SELECT api_key FROM world_credentials WHERE world_id = ?1",
            params![world_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }
}
