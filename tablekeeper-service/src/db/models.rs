//! Database model structs.
//!
//! This module contains the data structures for database records.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_optional_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value.map(|s| parse_timestamp(&s))
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    /// Condensed history produced by the summarization pass
    Summary,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Summary => "summary",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "assistant" => MessageRole::Assistant,
            "summary" => MessageRole::Summary,
            _ => MessageRole::User,
        }
    }
}

/// Conversation record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub world_id: String,
    pub title: String,
    pub total_tokens: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let total_tokens: i64 = row.get(3)?;
        let created_at_str: String = row.get(4)?;
        let updated_at_str: String = row.get(5)?;

        Ok(Self {
            id: row.get(0)?,
            world_id: row.get(1)?,
            title: row.get(2)?,
            total_tokens: total_tokens.max(0) as usize,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

/// Message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub token_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let role_str: String = row.get(2)?;
        let token_count: i64 = row.get(4)?;
        let snapshot_str: Option<String> = row.get(5)?;
        let created_at_str: String = row.get(6)?;

        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: MessageRole::from_str(&role_str),
            content: row.get(3)?,
            token_count: token_count.max(0) as usize,
            context_snapshot: snapshot_str.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_timestamp(&created_at_str),
        })
    }
}

/// Lifecycle status of a message batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Collecting,
    Sent,
    Completed,
    Vetoed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Collecting => "collecting",
            BatchStatus::Sent => "sent",
            BatchStatus::Completed => "completed",
            BatchStatus::Vetoed => "vetoed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "sent" => BatchStatus::Sent,
            "completed" => BatchStatus::Completed,
            "vetoed" => BatchStatus::Vetoed,
            _ => BatchStatus::Collecting,
        }
    }

    /// The only transitions a batch may ever record
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (BatchStatus::Collecting, BatchStatus::Sent)
                | (BatchStatus::Sent, BatchStatus::Completed)
                | (BatchStatus::Sent, BatchStatus::Vetoed)
                | (BatchStatus::Vetoed, BatchStatus::Sent)
        )
    }
}

/// One participant's action inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMessage {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl BatchMessage {
    /// Label used in the combined prompt
    pub fn speaker(&self) -> &str {
        non_blank(&self.character_name)
            .or_else(|| non_blank(&self.user_name))
            .unwrap_or(&self.user_id)
    }
}

fn non_blank(name: &Option<String>) -> Option<&str> {
    name.as_deref().filter(|name| !name.trim().is_empty())
}

/// A GM ruling attached to a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmRuling {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// Batch record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    pub conversation_id: String,
    pub world_id: String,
    pub messages: Vec<BatchMessage>,
    pub gm_rulings: Vec<GmRuling>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_prompt: Option<String>,
    pub status: BatchStatus,
    pub veto_count: u32,
    pub veto_corrections: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_message_id: Option<String>,
    pub time_window_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regenerated_from: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let messages_str: String = row.get(3)?;
        let rulings_str: String = row.get(4)?;
        let status_str: String = row.get(6)?;
        let veto_count: i64 = row.get(7)?;
        let corrections_str: String = row.get(8)?;
        let time_window: i64 = row.get(10)?;
        let created_at_str: String = row.get(12)?;

        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            world_id: row.get(2)?,
            messages: serde_json::from_str(&messages_str).unwrap_or_default(),
            gm_rulings: serde_json::from_str(&rulings_str).unwrap_or_default(),
            formatted_prompt: row.get(5)?,
            status: BatchStatus::from_str(&status_str),
            veto_count: veto_count.max(0) as u32,
            veto_corrections: serde_json::from_str(&corrections_str).unwrap_or_default(),
            response_message_id: row.get(9)?,
            time_window_seconds: time_window.max(0) as u32,
            regenerated_from: row.get(11)?,
            created_at: parse_timestamp(&created_at_str),
            sent_at: parse_optional_timestamp(row.get(13)?),
            completed_at: parse_optional_timestamp(row.get(14)?),
        })
    }
}

/// Published canon entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonEntry {
    pub id: String,
    pub world_id: String,
    pub conversation_id: String,
    pub content: String,
    pub published_by: String,
    pub published_by_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_context: Option<String>,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

impl CanonEntry {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let token_count: i64 = row.get(8)?;
        let created_at_str: String = row.get(9)?;

        Ok(Self {
            id: row.get(0)?,
            world_id: row.get(1)?,
            conversation_id: row.get(2)?,
            content: row.get(3)?,
            published_by: row.get(4)?,
            published_by_name: row.get(5)?,
            original_message_id: row.get(6)?,
            scene_context: row.get(7)?,
            token_count: token_count.max(0) as usize,
            created_at: parse_timestamp(&created_at_str),
        })
    }
}
