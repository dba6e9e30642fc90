//! Canon publishing and curation.

use tracing::info;

use super::TablekeeperService;
use crate::db::{CanonEntry, NewCanonEntry};
use crate::error::{ServiceError, ServiceResult};
use crate::session::Session;

/// What the GM wants to publish
#[derive(Debug, Clone, Default)]
pub struct CanonPublication<'a> {
    pub content: &'a str,
    pub conversation_id: Option<&'a str>,
    pub original_message_id: Option<&'a str>,
    pub scene_context: Option<&'a str>,
}

impl TablekeeperService {
    fn world_canon_entry(&self, world_id: &str, entry_id: &str) -> ServiceResult<CanonEntry> {
        self.db
            .get_canon_entry(entry_id)?
            .filter(|e| e.world_id == world_id)
            .ok_or_else(|| ServiceError::CanonEntryNotFound {
                entry_id: entry_id.to_string(),
            })
    }

    /// Publish content to the world's canon, attributed to the session user
    pub fn publish_to_canon(
        &self,
        session: &Session,
        publication: CanonPublication<'_>,
    ) -> ServiceResult<CanonEntry> {
        let content = publication.content.trim();
        if content.is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "canon content is empty".to_string(),
            });
        }

        let conversation = match publication.conversation_id {
            Some(id) => self.world_conversation(&session.world_id, id)?,
            None => self
                .db
                .get_or_create_conversation(&session.world_id, &self.default_title())?,
        };

        let entry = self.db.publish_to_canon(&NewCanonEntry {
            world_id: &session.world_id,
            conversation_id: &conversation.id,
            content,
            published_by: &session.user_id,
            published_by_name: session.display_name(),
            original_message_id: publication.original_message_id,
            scene_context: publication.scene_context,
        })?;

        metrics::counter!("tablekeeper_canon_entries_total", "event" => "published").increment(1);
        info!(
            world_id = %session.world_id,
            entry_id = %entry.id,
            tokens = entry.token_count,
            "Published canon entry"
        );
        Ok(entry)
    }

    pub fn list_canon(&self, world_id: &str) -> ServiceResult<Vec<CanonEntry>> {
        self.db.list_canon(world_id)
    }

    pub fn update_canon(
        &self,
        world_id: &str,
        entry_id: &str,
        content: &str,
    ) -> ServiceResult<CanonEntry> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "canon content is empty".to_string(),
            });
        }

        self.world_canon_entry(world_id, entry_id)?;
        let entry = self.db.update_canon_message(entry_id, content)?;
        metrics::counter!("tablekeeper_canon_entries_total", "event" => "updated").increment(1);
        Ok(entry)
    }

    pub fn delete_canon(&self, world_id: &str, entry_id: &str) -> ServiceResult<()> {
        self.world_canon_entry(world_id, entry_id)?;
        self.db.delete_canon_message(entry_id)?;
        metrics::counter!("tablekeeper_canon_entries_total", "event" => "deleted").increment(1);
        info!(world_id = %world_id, entry_id = %entry_id, "Deleted canon entry");
        Ok(())
    }
}
