//! Database schema migrations.
//!
//! This module contains all database migrations and schema setup.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Run all database migrations.
///
/// This function is called during database initialization to ensure
/// the schema is up to date.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        -- Per-world LLM credentials
        CREATE TABLE IF NOT EXISTS world_credentials (
            world_id TEXT PRIMARY KEY,
            api_key TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Conversations table
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            world_id TEXT NOT NULL,
            title TEXT NOT NULL,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_world ON conversations(world_id);
        CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at);

        -- Messages table (append-only)
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            context_snapshot TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);

        -- Message batches
        CREATE TABLE IF NOT EXISTS batches (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            world_id TEXT NOT NULL,
            messages TEXT NOT NULL DEFAULT '[]',
            gm_rulings TEXT NOT NULL DEFAULT '[]',
            formatted_prompt TEXT,
            status TEXT NOT NULL DEFAULT 'collecting',
            veto_count INTEGER NOT NULL DEFAULT 0,
            veto_corrections TEXT NOT NULL DEFAULT '[]',
            response_message_id TEXT,
            time_window_seconds INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            sent_at TEXT,
            completed_at TEXT,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_batches_conversation ON batches(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_batches_world ON batches(world_id);

        -- Published canon
        CREATE TABLE IF NOT EXISTS canon_entries (
            id TEXT PRIMARY KEY,
            world_id TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            content TEXT NOT NULL,
            published_by TEXT NOT NULL,
            published_by_name TEXT NOT NULL,
            original_message_id TEXT,
            scene_context TEXT,
            token_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_canon_world ON canon_entries(world_id);
    "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: e.to_string(),
    })?;

    run_settings_table_migration(conn)?;
    run_regenerated_from_migration(conn)?;

    Ok(())
}

/// Migration: Add settings table for GM-managed backend configuration
fn run_settings_table_migration(conn: &Connection) -> ServiceResult<()> {
    let has_settings_table: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='settings'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0)
        > 0;

    if !has_settings_table {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )
        .map_err(|e| DatabaseError::Migration {
            message: format!("Failed to create settings table: {}", e),
        })?;
    }

    Ok(())
}

/// Migration: Track which batch a regenerated batch was derived from
fn run_regenerated_from_migration(conn: &Connection) -> ServiceResult<()> {
    // SQLite doesn't have IF NOT EXISTS for ALTER TABLE, so we check if the column exists
    let has_column: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('batches') WHERE name = 'regenerated_from'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0)
        > 0;

    if !has_column {
        conn.execute_batch(
            r#"
            ALTER TABLE batches ADD COLUMN regenerated_from TEXT;
            CREATE INDEX IF NOT EXISTS idx_batches_regenerated_from ON batches(regenerated_from);
            "#,
        )
        .map_err(|e| DatabaseError::Migration {
            message: format!("Failed to add regenerated_from column: {}", e),
        })?;
    }

    Ok(())
}
