//! Batch coordinator.
//!
//! Turns a window of simultaneous player actions into one user message and
//! drives the batch through `collecting -> sent -> completed`, with
//! `sent -> vetoed -> sent` when the GM rejects a response.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::db::{
    Batch, BatchMessage, BatchStatus, Database, GmRuling, Message, MessageRole, NewBatch,
};
use crate::error::{ServiceError, ServiceResult};

const ACTIONS_HEADER: &str = "=== SIMULTANEOUS PLAYER ACTIONS ===";
const ACTIONS_FOOTER: &str = "=== END PLAYER ACTIONS ===";
const RULING_TAG: &str = "[GM RULING - MUST FOLLOW]";
const CORRECTION_HEADER: &str = "=== GM CORRECTION ===";
const CORRECTION_FOOTER: &str = "=== END GM CORRECTION ===";

/// Combine participant messages and GM rulings into one prompt.
///
/// Input order is preserved.
pub fn format_batch_prompt(messages: &[BatchMessage], rulings: &[GmRuling]) -> String {
    let actions = messages
        .iter()
        .map(|m| format!("[{}]\n{}", m.speaker(), m.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut prompt = format!("{ACTIONS_HEADER}\n{actions}\n{ACTIONS_FOOTER}");

    if !rulings.is_empty() {
        let rulings = rulings
            .iter()
            .map(|r| format!("{RULING_TAG} {}", r.content.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        prompt.push_str("\n\n");
        prompt.push_str(&rulings);
    }

    prompt
}

/// The user message sent after a veto
pub fn format_veto_message(correction: &str, original_prompt: &str) -> String {
    format!(
        "{CORRECTION_HEADER}\n\
         The GM rejected the previous response to these actions. \
         Respond again, following this correction:\n\
         {}\n\
         {CORRECTION_FOOTER}\n\n\
         {original_prompt}",
        correction.trim()
    )
}

/// A batch as submitted by the client
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub batch_id: Option<String>,
    pub messages: Vec<BatchMessage>,
    pub gm_rulings: Vec<GmRuling>,
    pub formatted_prompt: Option<String>,
    pub time_window_seconds: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedBatch {
    pub conversation_id: String,
    pub batch_id: String,
    pub user_message: Message,
    pub participant_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedVeto {
    pub conversation_id: String,
    pub veto_message: Message,
    pub original_batch_id: String,
    pub veto_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRegenerate {
    pub conversation_id: String,
    pub batch_id: String,
    pub original_batch_id: String,
    pub user_message: Message,
}

pub struct BatchCoordinator {
    db: Arc<Database>,
    default_title: String,
}

impl BatchCoordinator {
    pub fn new(db: Arc<Database>, default_title: impl Into<String>) -> Self {
        Self {
            db,
            default_title: default_title.into(),
        }
    }

    /// A batch that exists and belongs to `world_id`
    fn world_batch(&self, world_id: &str, batch_id: &str) -> ServiceResult<Batch> {
        self.db
            .get_batch(batch_id)?
            .filter(|b| b.world_id == world_id)
            .ok_or_else(|| ServiceError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })
    }

    /// Persist a new batch and its combined user message, leaving it `sent`
    pub fn process_batch(
        &self,
        world_id: &str,
        request: BatchRequest,
        context: Option<&serde_json::Value>,
    ) -> ServiceResult<ProcessedBatch> {
        let formatted_prompt = request
            .formatted_prompt
            .filter(|p| !p.trim().is_empty());
        if request.messages.is_empty() && formatted_prompt.is_none() {
            return Err(ServiceError::InvalidRequest {
                message: "a batch needs at least one message".to_string(),
            });
        }

        let batch_id = request
            .batch_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.db.get_batch(&batch_id)?.is_some() {
            return Err(ServiceError::InvalidRequest {
                message: format!("batch {batch_id} already exists"),
            });
        }

        let conversation = self
            .db
            .get_or_create_conversation(world_id, &self.default_title)?;

        // The GM moved on without reviewing these; treat them as accepted
        for previous in self
            .db
            .list_batches_by_status(&conversation.id, BatchStatus::Sent)?
            .into_iter()
            .filter(|b| b.response_message_id.is_some())
        {
            self.db
                .update_batch_status(&previous.id, BatchStatus::Completed, None)?;
            metrics::counter!("tablekeeper_batches_total", "event" => "auto_completed")
                .increment(1);
            debug!(batch_id = %previous.id, "Auto-completed earlier batch");
        }

        self.db.create_batch(&NewBatch {
            id: &batch_id,
            conversation_id: &conversation.id,
            world_id,
            messages: &request.messages,
            gm_rulings: &request.gm_rulings,
            formatted_prompt: None,
            time_window_seconds: request.time_window_seconds,
            regenerated_from: None,
        })?;

        let prompt = formatted_prompt
            .unwrap_or_else(|| format_batch_prompt(&request.messages, &request.gm_rulings));
        let user_message =
            self.db
                .add_message(&conversation.id, MessageRole::User, &prompt, context)?;
        self.db
            .update_batch_status(&batch_id, BatchStatus::Sent, Some(&prompt))?;

        metrics::counter!("tablekeeper_batches_total", "event" => "sent").increment(1);
        info!(
            world_id = %world_id,
            batch_id = %batch_id,
            participants = request.messages.len(),
            rulings = request.gm_rulings.len(),
            "Batch sent"
        );

        Ok(ProcessedBatch {
            conversation_id: conversation.id,
            batch_id,
            user_message,
            participant_count: request.messages.len(),
        })
    }

    /// Reject a sent batch's response and persist the correction prompt.
    ///
    /// The batch stays `vetoed` until [`BatchCoordinator::resend`] is called
    /// for the corrected turn.
    pub fn process_veto(
        &self,
        world_id: &str,
        batch_id: &str,
        correction: &str,
        context: Option<&serde_json::Value>,
    ) -> ServiceResult<ProcessedVeto> {
        if correction.trim().is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "a veto needs a correction".to_string(),
            });
        }

        let batch = self.world_batch(world_id, batch_id)?;
        let vetoed = self.db.record_veto(batch_id, correction)?;

        let original_prompt = batch
            .formatted_prompt
            .clone()
            .unwrap_or_else(|| format_batch_prompt(&batch.messages, &batch.gm_rulings));
        let veto_message = self.db.add_message(
            &batch.conversation_id,
            MessageRole::User,
            &format_veto_message(correction, &original_prompt),
            context,
        )?;

        metrics::counter!("tablekeeper_batches_total", "event" => "vetoed").increment(1);
        info!(
            world_id = %world_id,
            batch_id = %batch_id,
            veto_count = vetoed.veto_count,
            "Batch vetoed"
        );

        Ok(ProcessedVeto {
            conversation_id: batch.conversation_id,
            veto_message,
            original_batch_id: batch.id,
            veto_count: vetoed.veto_count,
        })
    }

    /// Mark a vetoed batch as sent again for its corrected turn
    pub fn resend(&self, batch_id: &str) -> ServiceResult<Batch> {
        self.db
            .update_batch_status(batch_id, BatchStatus::Sent, None)
    }

    /// Re-submit a batch's prompt unchanged under a derivative batch id
    pub fn process_regenerate(
        &self,
        world_id: &str,
        batch_id: &str,
        context: Option<&serde_json::Value>,
    ) -> ServiceResult<ProcessedRegenerate> {
        let original = self.world_batch(world_id, batch_id)?;
        let prompt = original
            .formatted_prompt
            .clone()
            .unwrap_or_else(|| format_batch_prompt(&original.messages, &original.gm_rulings));

        let attempt = self.db.count_regenerations(&original.id)? + 1;
        let regen_id = format!("{}-regen-{}", original.id, attempt);

        self.db.create_batch(&NewBatch {
            id: &regen_id,
            conversation_id: &original.conversation_id,
            world_id,
            messages: &original.messages,
            gm_rulings: &original.gm_rulings,
            formatted_prompt: None,
            time_window_seconds: original.time_window_seconds,
            regenerated_from: Some(&original.id),
        })?;
        let user_message = self.db.add_message(
            &original.conversation_id,
            MessageRole::User,
            &prompt,
            context,
        )?;
        self.db
            .update_batch_status(&regen_id, BatchStatus::Sent, Some(&prompt))?;

        metrics::counter!("tablekeeper_batches_total", "event" => "regenerated").increment(1);
        info!(
            world_id = %world_id,
            batch_id = %regen_id,
            original_batch_id = %original.id,
            "Batch regenerated"
        );

        Ok(ProcessedRegenerate {
            conversation_id: original.conversation_id,
            batch_id: regen_id,
            original_batch_id: original.id,
            user_message,
        })
    }

    /// Link the assistant response; the batch stays `sent` awaiting GM review
    pub fn record_response(&self, batch_id: &str, response_message_id: &str) -> ServiceResult<()> {
        self.db.set_batch_response(batch_id, response_message_id)
    }

    /// GM accepts a batch. Completing an already completed batch is a no-op.
    pub fn complete_batch(
        &self,
        world_id: &str,
        batch_id: &str,
        response_message_id: Option<&str>,
    ) -> ServiceResult<Batch> {
        let batch = self.world_batch(world_id, batch_id)?;
        if batch.status == BatchStatus::Completed {
            return Ok(batch);
        }

        if let Some(message_id) = response_message_id {
            self.db.set_batch_response(batch_id, message_id)?;
        }
        let completed = self
            .db
            .update_batch_status(batch_id, BatchStatus::Completed, None)?;

        metrics::counter!("tablekeeper_batches_total", "event" => "completed").increment(1);
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> (Arc<Database>, BatchCoordinator) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        (db.clone(), BatchCoordinator::new(db, "New Conversation"))
    }

    fn action(user_id: &str, user_name: Option<&str>, content: &str) -> BatchMessage {
        BatchMessage {
            user_id: user_id.to_string(),
            user_name: user_name.map(str::to_string),
            character_name: None,
            content: content.to_string(),
            timestamp: None,
        }
    }

    fn two_player_request() -> BatchRequest {
        BatchRequest {
            batch_id: Some("b1".to_string()),
            messages: vec![
                action("u1", Some("Alice"), "search room"),
                action("u2", Some("Bob"), "attack goblin"),
            ],
            gm_rulings: vec![],
            formatted_prompt: None,
            time_window_seconds: 5,
        }
    }

    #[test]
    fn test_format_two_participants() {
        let request = two_player_request();
        let prompt = format_batch_prompt(&request.messages, &[]);

        assert_eq!(
            prompt,
            "=== SIMULTANEOUS PLAYER ACTIONS ===\n\
             [Alice]\nsearch room\n\n\
             [Bob]\nattack goblin\n\
             === END PLAYER ACTIONS ==="
        );
    }

    #[test]
    fn test_blank_character_name_falls_back_to_user_name() {
        let mut alice = action("u1", Some("Alice"), "search room");
        alice.character_name = Some(String::new());
        let prompt = format_batch_prompt(&[alice], &[]);

        assert!(prompt.contains("[Alice]\nsearch room"));
        assert!(!prompt.contains("[u1]"));
    }

    #[test]
    fn test_format_rulings_follow_actions() {
        let rulings = vec![GmRuling {
            content: "The goblin is already wounded".to_string(),
            user_name: None,
        }];
        let prompt = format_batch_prompt(&[action("u1", None, "look around")], &rulings);

        assert!(prompt.starts_with("=== SIMULTANEOUS PLAYER ACTIONS ===\n[u1]\nlook around"));
        assert!(prompt.ends_with(
            "=== END PLAYER ACTIONS ===\n\n[GM RULING - MUST FOLLOW] The goblin is already wounded"
        ));
    }

    #[test]
    fn test_process_batch_persists_prompt_and_sends() {
        let (db, batches) = coordinator();

        let processed = batches
            .process_batch("world-1", two_player_request(), None)
            .unwrap();
        assert_eq!(processed.batch_id, "b1");
        assert_eq!(processed.participant_count, 2);
        assert!(processed.user_message.content.contains("[Bob]\nattack goblin"));

        let batch = db.get_batch("b1").unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Sent);
        assert_eq!(
            batch.formatted_prompt.as_deref(),
            Some(processed.user_message.content.as_str())
        );

        let messages = db.get_messages(&processed.conversation_id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[test]
    fn test_formatted_prompt_overrides_formatting() {
        let (_db, batches) = coordinator();
        let mut request = two_player_request();
        request.formatted_prompt = Some("custom prompt".to_string());

        let processed = batches.process_batch("world-1", request, None).unwrap();
        assert_eq!(processed.user_message.content, "custom prompt");
    }

    #[test]
    fn test_empty_batch_rejected() {
        let (_db, batches) = coordinator();
        let err = batches
            .process_batch("world-1", BatchRequest::default(), None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest { .. }));
    }

    #[test]
    fn test_new_batch_auto_completes_answered_batches() {
        let (db, batches) = coordinator();
        let first = batches
            .process_batch("world-1", two_player_request(), None)
            .unwrap();
        let reply = db
            .add_message(&first.conversation_id, MessageRole::Assistant, "The goblin falls.", None)
            .unwrap();
        batches.record_response("b1", &reply.id).unwrap();
        assert_eq!(db.get_batch("b1").unwrap().unwrap().status, BatchStatus::Sent);

        let mut next = two_player_request();
        next.batch_id = Some("b2".to_string());
        batches.process_batch("world-1", next, None).unwrap();

        assert_eq!(
            db.get_batch("b1").unwrap().unwrap().status,
            BatchStatus::Completed
        );
        assert_eq!(db.get_batch("b2").unwrap().unwrap().status, BatchStatus::Sent);
    }

    #[test]
    fn test_veto_scenario() {
        let (db, batches) = coordinator();
        batches
            .process_batch("world-1", two_player_request(), None)
            .unwrap();

        let veto = batches
            .process_veto("world-1", "b1", "make the NPC hostile", None)
            .unwrap();
        assert_eq!(veto.original_batch_id, "b1");
        assert_eq!(veto.veto_count, 1);
        assert!(veto.veto_message.content.starts_with("=== GM CORRECTION ==="));
        assert!(veto.veto_message.content.contains("make the NPC hostile"));
        assert!(veto.veto_message.content.contains("[Alice]\nsearch room"));

        let batch = db.get_batch("b1").unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Vetoed);
        assert_eq!(batch.veto_count, 1);
        assert_eq!(batch.veto_corrections, vec!["make the NPC hostile"]);

        let resent = batches.resend("b1").unwrap();
        assert_eq!(resent.status, BatchStatus::Sent);
    }

    #[test]
    fn test_veto_unknown_or_foreign_batch() {
        let (_db, batches) = coordinator();
        batches
            .process_batch("world-1", two_player_request(), None)
            .unwrap();

        assert!(matches!(
            batches.process_veto("world-1", "nope", "x", None).unwrap_err(),
            ServiceError::BatchNotFound { .. }
        ));
        assert!(matches!(
            batches.process_veto("world-2", "b1", "x", None).unwrap_err(),
            ServiceError::BatchNotFound { .. }
        ));
    }

    #[test]
    fn test_complete_batch_is_idempotent() {
        let (_db, batches) = coordinator();
        batches
            .process_batch("world-1", two_player_request(), None)
            .unwrap();

        let first = batches.complete_batch("world-1", "b1", None).unwrap();
        assert_eq!(first.status, BatchStatus::Completed);

        let second = batches.complete_batch("world-1", "b1", None).unwrap();
        assert_eq!(second.status, BatchStatus::Completed);
        assert_eq!(second.veto_count, first.veto_count);
        assert_eq!(second.completed_at, first.completed_at);
    }

    #[test]
    fn test_vetoed_batch_cannot_complete() {
        let (_db, batches) = coordinator();
        batches
            .process_batch("world-1", two_player_request(), None)
            .unwrap();
        batches.process_veto("world-1", "b1", "no", None).unwrap();

        assert!(matches!(
            batches.complete_batch("world-1", "b1", None).unwrap_err(),
            ServiceError::InvalidBatchTransition { from: "vetoed", .. }
        ));
    }

    #[test]
    fn test_regenerate_creates_derivative_batches() {
        let (db, batches) = coordinator();
        let processed = batches
            .process_batch("world-1", two_player_request(), None)
            .unwrap();

        let first = batches.process_regenerate("world-1", "b1", None).unwrap();
        let second = batches.process_regenerate("world-1", "b1", None).unwrap();
        assert_eq!(first.batch_id, "b1-regen-1");
        assert_eq!(second.batch_id, "b1-regen-2");
        assert_eq!(first.user_message.content, processed.user_message.content);

        let original = db.get_batch("b1").unwrap().unwrap();
        assert_eq!(original.status, BatchStatus::Sent);
        assert_eq!(original.veto_count, 0);

        let regen = db.get_batch("b1-regen-1").unwrap().unwrap();
        assert_eq!(regen.status, BatchStatus::Sent);
        assert_eq!(regen.regenerated_from.as_deref(), Some("b1"));
    }
}
