//! Orchestration service.
//!
//! Owns the shared components (sessions, tool bridge, batches, context) and
//! implements every operation the dispatcher exposes.

mod canon;
mod chat;
mod conversations;
mod prompts;
pub mod tool_loop;

pub use chat::{BatchTurn, ChatTurn, RegenerateTurn, VetoTurn};
pub use canon::CanonPublication;
pub use conversations::ConversationView;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::batch::BatchCoordinator;
use crate::config::{DynamicConfig, RuntimeConfig};
use crate::context::ContextManager;
use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::i18n::I18n;
use crate::llm::LlmGateway;
use crate::session::{Connection, Identity, Session, SessionRegistry};
use crate::tool_bridge::ToolCallBridge;
use crate::tools::REGISTRY;

/// Locale used for server-generated text
pub const DEFAULT_LOCALE: &str = "en";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub message: String,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub sessions: usize,
    pub pending_tool_calls: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    /// Effective value of every setting
    pub values: HashMap<String, serde_json::Value>,
    /// Keys overridden in the settings table
    pub overrides: HashMap<String, serde_json::Value>,
}

/// Main service coordinator
pub struct TablekeeperService {
    pub runtime_config: Arc<RuntimeConfig>,
    pub db: Arc<Database>,
    pub llm: Arc<dyn LlmGateway>,
    pub i18n: Arc<I18n>,
    pub sessions: Arc<SessionRegistry>,
    pub tool_bridge: Arc<ToolCallBridge>,
    pub batches: Arc<BatchCoordinator>,
    pub context: Arc<ContextManager>,
    started_at: Instant,
}

impl TablekeeperService {
    /// Create a new service instance around an opened database and gateway
    pub fn new(
        db: Arc<Database>,
        runtime_config: Arc<RuntimeConfig>,
        llm: Arc<dyn LlmGateway>,
    ) -> Self {
        info!("Initializing Tablekeeper service");

        let i18n = Arc::new(I18n::new());
        let sessions = Arc::new(SessionRegistry::new(db.clone()));
        let tool_bridge = Arc::new(ToolCallBridge::new(
            sessions.clone(),
            &REGISTRY,
            runtime_config.clone(),
        ));
        let batches = Arc::new(BatchCoordinator::new(
            db.clone(),
            i18n.get(DEFAULT_LOCALE, "conversation-default-title", None),
        ));
        let context = Arc::new(ContextManager::new(db.clone()));

        info!(tools = REGISTRY.len(), "Tool registry loaded");

        Self {
            runtime_config,
            db,
            llm,
            i18n,
            sessions,
            tool_bridge,
            batches,
            context,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn default_title(&self) -> String {
        self.i18n
            .get(DEFAULT_LOCALE, "conversation-default-title", None)
    }

    pub fn get_settings(&self) -> ServiceResult<SettingsView> {
        Ok(SettingsView {
            values: self.runtime_config.dynamic().to_key_value_map(),
            overrides: self.db.get_all_settings()?,
        })
    }

    /// Persist setting overrides and hot-reload the dynamic config.
    /// A null value reverts that key to its file/env default.
    pub fn update_settings(
        &self,
        updates: HashMap<String, serde_json::Value>,
    ) -> ServiceResult<SettingsView> {
        let valid = DynamicConfig::valid_keys();
        if let Some(unknown) = updates.keys().find(|k| !valid.contains(k.as_str())) {
            return Err(ServiceError::InvalidRequest {
                message: format!("unknown setting: {unknown}"),
            });
        }

        self.db.set_settings(&updates)?;
        self.runtime_config.reload_from_db(&self.db)?;
        info!(keys = ?updates.keys().collect::<Vec<_>>(), "Settings updated");

        self.get_settings()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            message: self.i18n.get(DEFAULT_LOCALE, "health-status-healthy", None),
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            sessions: self.sessions.session_count(),
            pending_tool_calls: self.tool_bridge.pending_count(),
        }
    }

    /// Bind `connection` to a world. Calls still waiting on a socket this
    /// replaces fail now instead of at their deadline.
    pub fn authenticate(
        &self,
        connection: &Connection,
        world_id: &str,
        identity: Identity,
        api_key: Option<&str>,
    ) -> ServiceResult<Session> {
        let previous = self.sessions.lookup(world_id);
        let session = self
            .sessions
            .authenticate(connection, world_id, identity, api_key)?;

        if let Some(previous) = previous
            && previous.connection.id() != connection.id()
        {
            self.tool_bridge.cancel_connection(previous.connection.id());
        }
        Ok(session)
    }

    /// Clean up after a socket closes
    pub fn disconnect(&self, world_id: &str, connection_id: &str) {
        if self.sessions.remove(world_id, connection_id) {
            self.tool_bridge.cancel_world(world_id);
        } else {
            // Already replaced; only calls pushed to this socket are dead
            self.tool_bridge.cancel_connection(connection_id);
        }
    }
}
