//! Conversation management operations.

use serde::Serialize;
use tracing::info;

use super::TablekeeperService;
use crate::db::{Conversation, Message};
use crate::error::{ServiceError, ServiceResult};

const DEFAULT_LIST_LIMIT: usize = 50;

/// A conversation with (part of) its messages
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

impl TablekeeperService {
    /// A conversation that exists and belongs to `world_id`
    pub(crate) fn world_conversation(
        &self,
        world_id: &str,
        conversation_id: &str,
    ) -> ServiceResult<Conversation> {
        self.db
            .get_conversation(conversation_id)?
            .filter(|c| c.world_id == world_id)
            .ok_or_else(|| ServiceError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            })
    }

    pub fn new_conversation(
        &self,
        world_id: &str,
        title: Option<&str>,
    ) -> ServiceResult<Conversation> {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.default_title());

        let conversation = self.db.create_conversation(world_id, &title)?;
        info!(
            world_id = %world_id,
            conversation_id = %conversation.id,
            "Created conversation"
        );
        Ok(conversation)
    }

    pub fn list_conversations(
        &self,
        world_id: &str,
        limit: Option<usize>,
    ) -> ServiceResult<Vec<Conversation>> {
        self.db
            .list_conversations(world_id, limit.unwrap_or(DEFAULT_LIST_LIMIT))
    }

    pub fn get_conversation(
        &self,
        world_id: &str,
        conversation_id: &str,
    ) -> ServiceResult<ConversationView> {
        let conversation = self.world_conversation(world_id, conversation_id)?;
        let messages = self.db.get_messages(&conversation.id)?;
        Ok(ConversationView {
            conversation,
            messages,
        })
    }

    /// Latest `limit` messages of a conversation, or of the current one.
    /// A world with no conversation yet gets a fresh one.
    pub fn history(
        &self,
        world_id: &str,
        conversation_id: Option<&str>,
        limit: Option<usize>,
    ) -> ServiceResult<ConversationView> {
        let conversation = match conversation_id {
            Some(id) => self.world_conversation(world_id, id)?,
            None => self
                .db
                .get_or_create_conversation(world_id, &self.default_title())?,
        };

        let mut messages = self.db.get_messages(&conversation.id)?;
        if let Some(limit) = limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }

        Ok(ConversationView {
            conversation,
            messages,
        })
    }

    pub fn rename_conversation(
        &self,
        world_id: &str,
        conversation_id: &str,
        title: &str,
    ) -> ServiceResult<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "title is empty".to_string(),
            });
        }

        self.world_conversation(world_id, conversation_id)?;
        self.db.rename_conversation(conversation_id, title)?;
        self.world_conversation(world_id, conversation_id)
    }

    pub fn delete_conversation(&self, world_id: &str, conversation_id: &str) -> ServiceResult<()> {
        self.world_conversation(world_id, conversation_id)?;
        self.db.delete_conversation(conversation_id)?;
        info!(
            world_id = %world_id,
            conversation_id = %conversation_id,
            "Deleted conversation"
        );
        Ok(())
    }

    /// Drop all messages and batches, keeping the conversation itself
    pub fn clear_conversation(
        &self,
        world_id: &str,
        conversation_id: &str,
    ) -> ServiceResult<Conversation> {
        self.world_conversation(world_id, conversation_id)?;
        self.db.clear_conversation(conversation_id)?;
        info!(
            world_id = %world_id,
            conversation_id = %conversation_id,
            "Cleared conversation"
        );
        self.world_conversation(world_id, conversation_id)
    }

    /// Make a conversation the world's current one
    pub fn switch_conversation(
        &self,
        world_id: &str,
        conversation_id: &str,
    ) -> ServiceResult<ConversationView> {
        self.world_conversation(world_id, conversation_id)?;
        self.db.touch_conversation(conversation_id)?;
        self.get_conversation(world_id, conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::MessageRole;
    use crate::error::ServiceError;
    use crate::service::tests::test_service;

    #[test]
    fn test_new_conversation_default_title() {
        let (service, _gateway) = test_service();

        let conv = service.new_conversation("world-1", None).unwrap();
        assert_eq!(conv.title, "New Conversation");

        let named = service.new_conversation("world-1", Some("  Heist ")).unwrap();
        assert_eq!(named.title, "Heist");
        assert_eq!(service.list_conversations("world-1", None).unwrap().len(), 2);
    }

    #[test]
    fn test_other_world_conversation_is_not_found() {
        let (service, _gateway) = test_service();
        let conv = service.new_conversation("world-1", None).unwrap();

        let err = service.get_conversation("world-2", &conv.id).unwrap_err();
        assert!(matches!(err, ServiceError::ConversationNotFound { .. }));
        assert!(service.delete_conversation("world-2", &conv.id).is_err());
        assert!(service.db.get_conversation(&conv.id).unwrap().is_some());
    }

    #[test]
    fn test_history_returns_latest_messages() {
        let (service, _gateway) = test_service();
        let conv = service.new_conversation("world-1", None).unwrap();
        for i in 0..5 {
            service
                .db
                .add_message(&conv.id, MessageRole::User, &format!("m{i}"), None)
                .unwrap();
        }

        let view = service.history("world-1", Some(&conv.id), Some(2)).unwrap();
        let contents: Vec<_> = view.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);

        let all = service.history("world-1", None, None).unwrap();
        assert_eq!(all.conversation.id, conv.id);
        assert_eq!(all.messages.len(), 5);
    }

    #[test]
    fn test_switch_makes_conversation_current() {
        let (service, _gateway) = test_service();
        let first = service.new_conversation("world-1", Some("First")).unwrap();
        let _second = service.new_conversation("world-1", Some("Second")).unwrap();

        service.switch_conversation("world-1", &first.id).unwrap();
        let current = service.db.get_current_conversation("world-1").unwrap().unwrap();
        assert_eq!(current.id, first.id);
    }

    #[test]
    fn test_rename_and_clear() {
        let (service, _gateway) = test_service();
        let conv = service.new_conversation("world-1", None).unwrap();
        service
            .db
            .add_message(&conv.id, MessageRole::User, "hello", None)
            .unwrap();

        let renamed = service
            .rename_conversation("world-1", &conv.id, "Dungeon")
            .unwrap();
        assert_eq!(renamed.title, "Dungeon");
        assert!(service.rename_conversation("world-1", &conv.id, " ").is_err());

        let cleared = service.clear_conversation("world-1", &conv.id).unwrap();
        assert_eq!(cleared.total_tokens, 0);
        assert!(service.db.get_messages(&conv.id).unwrap().is_empty());
    }
}
