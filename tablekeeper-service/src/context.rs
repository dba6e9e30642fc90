//! Context manager.
//!
//! Selects how much conversation history and published canon fits in a
//! token budget. Messages are kept or dropped whole, never truncated, and
//! the newest messages are always preferred.

use std::sync::Arc;

use serde::Serialize;

use crate::db::{CanonEntry, Database, Message, MessageRole};
use crate::error::ServiceResult;

/// Rough token estimate: one token per four characters, rounded up
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// A message as handed to the prompt builder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextMessage {
    pub role: MessageRole,
    pub content: String,
}

impl From<&Message> for ContextMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SummarizedHistory {
    pub messages: Vec<ContextMessage>,
    pub needs_summarization: bool,
    /// Messages that fell out of the window and should be folded into a summary
    pub old_messages: Option<Vec<ContextMessage>>,
    /// Id of the last message in `old_messages`
    pub summarized_through: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonContext {
    pub messages: Vec<String>,
    pub total_tokens: usize,
}

/// Longest suffix of `items` whose token sum stays within `max_tokens`
fn fit_suffix<T>(items: &[T], max_tokens: usize, tokens: impl Fn(&T) -> usize) -> &[T] {
    let mut used = 0;
    let mut start = items.len();
    for (i, item) in items.iter().enumerate().rev() {
        let cost = tokens(item);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        start = i;
    }
    &items[start..]
}

/// Snapshot key naming the last message a summary covers
const SUMMARIZED_THROUGH_KEY: &str = "summarizedThrough";

/// Number of leading non-summary messages covered by `summary`.
///
/// Uses the recorded `summarizedThrough` id; without one, everything
/// stored before the summary counts as covered.
fn covered_count(all: &[Message], history: &[&Message], position: usize, summary: &Message) -> usize {
    let through = summary
        .context_snapshot
        .as_ref()
        .and_then(|s| s.get(SUMMARIZED_THROUGH_KEY))
        .and_then(|v| v.as_str());

    through
        .and_then(|id| history.iter().position(|m| m.id == id))
        .map(|i| i + 1)
        .unwrap_or_else(|| {
            all[..position]
                .iter()
                .filter(|m| m.role != MessageRole::Summary)
                .count()
        })
}

fn message_tokens(message: &Message) -> usize {
    estimate_tokens(&message.content)
}

pub struct ContextManager {
    db: Arc<Database>,
}

impl ContextManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Newest non-summary messages that fit in `max_tokens`, oldest first
    pub fn get_messages_for_context(
        &self,
        conversation_id: &str,
        max_tokens: usize,
    ) -> ServiceResult<Vec<ContextMessage>> {
        let history: Vec<Message> = self
            .db
            .get_messages(conversation_id)?
            .into_iter()
            .filter(|m| m.role != MessageRole::Summary)
            .collect();

        Ok(fit_suffix(&history, max_tokens, message_tokens)
            .iter()
            .map(ContextMessage::from)
            .collect())
    }

    /// History bounded by `max_tokens`, using the latest stored summary when
    /// one exists and flagging when a new one is needed.
    ///
    /// Only messages after the point the latest summary covers are eligible;
    /// when they do not all fit, everything outside the recent window is
    /// returned in `old_messages` for the next summary.
    pub fn get_messages_with_summary(
        &self,
        conversation_id: &str,
        max_tokens: usize,
        recent_count: usize,
    ) -> ServiceResult<SummarizedHistory> {
        let all = self.db.get_messages(conversation_id)?;
        let history: Vec<&Message> = all
            .iter()
            .filter(|m| m.role != MessageRole::Summary)
            .collect();

        let summary = all
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| m.role == MessageRole::Summary);
        let covered = summary
            .map(|(position, s)| covered_count(&all, &history, position, s))
            .unwrap_or(0);
        let summary = summary.map(|(_, s)| s);

        let pending = &history[covered..];
        let summary_tokens = summary.map(message_tokens).unwrap_or(0);
        let pending_tokens: usize = pending.iter().map(|m| message_tokens(m)).sum();

        let with_summary = |kept: &[&Message]| {
            let mut messages = Vec::with_capacity(kept.len() + 1);
            if let Some(summary) = summary.filter(|_| summary_tokens <= max_tokens) {
                messages.push(ContextMessage::from(summary));
            }
            messages.extend(kept.iter().map(|m| ContextMessage::from(*m)));
            messages
        };

        // Nothing would be dropped
        if summary_tokens + pending_tokens <= max_tokens {
            return Ok(SummarizedHistory {
                messages: with_summary(pending),
                ..Default::default()
            });
        }

        // A short history without a summary is trimmed, not summarized
        if summary.is_none() && pending.len() <= recent_count {
            return Ok(SummarizedHistory {
                messages: with_summary(fit_suffix(pending, max_tokens, |m| message_tokens(m))),
                ..Default::default()
            });
        }

        let budget = if summary_tokens <= max_tokens {
            max_tokens - summary_tokens
        } else {
            max_tokens
        };
        let recent = &pending[pending.len().saturating_sub(recent_count)..];
        let kept = fit_suffix(recent, budget, |m| message_tokens(m));
        let old = &pending[..pending.len() - kept.len()];

        Ok(SummarizedHistory {
            messages: with_summary(kept),
            needs_summarization: !old.is_empty(),
            summarized_through: old.last().map(|m| m.id.clone()),
            old_messages: if old.is_empty() {
                None
            } else {
                Some(old.iter().map(|m| ContextMessage::from(*m)).collect())
            },
        })
    }

    /// Append a summary covering history up to and including `summarized_through`
    pub fn store_summary(
        &self,
        conversation_id: &str,
        text: &str,
        summarized_through: &str,
    ) -> ServiceResult<Message> {
        let marker = serde_json::json!({ SUMMARIZED_THROUGH_KEY: summarized_through });
        self.db
            .add_message(conversation_id, MessageRole::Summary, text, Some(&marker))
    }

    /// Newest canon entries that fit in `max_tokens`, oldest first
    pub fn get_canon_for_context(
        &self,
        world_id: &str,
        max_tokens: usize,
    ) -> ServiceResult<CanonContext> {
        let entries = self.db.list_canon(world_id)?;
        let fitted = fit_suffix(&entries, max_tokens, |e: &CanonEntry| {
            estimate_tokens(&e.content)
        });

        Ok(CanonContext {
            total_tokens: fitted.iter().map(|e| estimate_tokens(&e.content)).sum(),
            messages: fitted.iter().map(|e| e.content.clone()).collect(),
        })
    }
}
