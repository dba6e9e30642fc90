//! Service configuration.
//!
//! Static settings (server binding, storage) are read once at startup. Dynamic
//! settings (LLM, context budgets, tool timeouts) are loaded from the same
//! sources, overridden by values stored in the settings table, and can be
//! hot-reloaded.

mod dynamic_config;
mod loader;
mod static_config;

use arc_swap::ArcSwap;
use std::sync::Arc;

pub use dynamic_config::{
    AgenticLoopConfig, ContextConfig, DynamicConfig, LlmConfig, ToolBridgeConfig,
};
pub use loader::load_static_config;
pub use static_config::{ServerConfig, StaticConfig, StorageConfig};

use crate::db::Database;
use crate::error::ServiceResult;

/// Runtime configuration manager
/// Combines static config (startup-only) with dynamic config (hot-reloadable via ArcSwap)
pub struct RuntimeConfig {
    /// Static configuration (never changes after startup)
    pub static_config: StaticConfig,
    dynamic: ArcSwap<DynamicConfig>,
}

impl RuntimeConfig {
    pub fn new(static_config: StaticConfig, dynamic: DynamicConfig) -> Self {
        Self {
            static_config,
            dynamic: ArcSwap::from_pointee(dynamic),
        }
    }

    /// Get current dynamic config snapshot (lock-free read)
    pub fn dynamic(&self) -> arc_swap::Guard<Arc<DynamicConfig>> {
        self.dynamic.load()
    }

    /// Owned snapshot for holding across await points
    pub fn dynamic_snapshot(&self) -> Arc<DynamicConfig> {
        self.dynamic.load_full()
    }

    /// Update dynamic config (atomic swap)
    pub fn update_dynamic(&self, new_config: DynamicConfig) {
        self.dynamic.store(Arc::new(new_config));
    }

    /// Load config from all sources with DB overrides
    pub fn load(static_config: StaticConfig, db: &Database) -> ServiceResult<Self> {
        let mut dynamic = loader::load_dynamic_config()?;
        let db_settings = db.get_all_settings()?;
        dynamic.merge_from_db(&db_settings);

        Ok(Self::new(static_config, dynamic))
    }

    /// Rebuild dynamic config from file/env defaults + DB and swap atomically
    pub fn reload_from_db(&self, db: &Database) -> ServiceResult<()> {
        let mut dynamic = loader::load_dynamic_config()?;
        let db_settings = db.get_all_settings()?;
        dynamic.merge_from_db(&db_settings);
        self.update_dynamic(dynamic);
        Ok(())
    }
}
