//! Session registry.
//!
//! A world has at most one live session. Authenticating a second connection
//! for the same world replaces the first; a later disconnect of the replaced
//! connection leaves the newer session alone.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::websocket::ServerFrame;

/// Outbound side of one socket
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: String,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a frame for the socket. Returns false once the socket is gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Per-socket state held by the connection loop
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    world_id: ArcSwapOption<String>,
}

impl Connection {
    pub fn new(tx: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            handle: ConnectionHandle {
                id: uuid::Uuid::new_v4().to_string(),
                tx,
            },
            world_id: ArcSwapOption::empty(),
        }
    }

    pub fn id(&self) -> &str {
        &self.handle.id
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// World this socket last authenticated for
    pub fn world_id(&self) -> Option<Arc<String>> {
        self.world_id.load_full()
    }

    fn set_world_id(&self, world_id: &str) {
        self.world_id.store(Some(Arc::new(world_id.to_string())));
    }
}

/// Who is on the other end of an authenticated connection
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
    pub display_name: Option<String>,
    pub is_gm: bool,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub world_id: String,
    pub connection: ConnectionHandle,
    pub display_name: Option<String>,
    pub user_id: String,
    pub user_name: String,
    pub is_gm: bool,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    /// Name shown for this user in canon and prompts
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.user_name)
    }
}

/// Short, non-reversible tag for an API key, safe to log
pub fn key_fingerprint(api_key: &str) -> String {
    Sha256::digest(api_key.as_bytes())
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    db: Arc<Database>,
}

impl SessionRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            sessions: DashMap::new(),
            db,
        }
    }

    /// Authenticate `connection` for `world_id` and make it the world's session.
    ///
    /// A supplied API key is stored for the world; without one, a key must
    /// already be on file.
    pub fn authenticate(
        &self,
        connection: &Connection,
        world_id: &str,
        identity: Identity,
        api_key: Option<&str>,
    ) -> ServiceResult<Session> {
        if world_id.trim().is_empty() {
            return Err(ServiceError::Auth {
                message: "worldId is required".to_string(),
            });
        }

        match api_key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => {
                self.db.set_api_key(world_id, key)?;
                info!(
                    world_id = %world_id,
                    key = %key_fingerprint(key),
                    "Stored API key for world"
                );
            }
            None => {
                if self.db.get_api_key(world_id)?.is_none() {
                    return Err(ServiceError::Auth {
                        message: format!("no API key on file for world {world_id}"),
                    });
                }
            }
        }

        // Re-authenticating a socket for another world gives up the old one
        if let Some(previous_world) = connection.world_id()
            && previous_world.as_str() != world_id
        {
            self.remove(&previous_world, connection.id());
        }

        let session = Session {
            world_id: world_id.to_string(),
            connection: connection.handle().clone(),
            display_name: identity.display_name,
            user_id: identity.user_id,
            user_name: identity.user_name,
            is_gm: identity.is_gm,
            connected_at: Utc::now(),
        };

        if let Some(replaced) = self.sessions.insert(world_id.to_string(), session.clone())
            && replaced.connection.id() != connection.id()
        {
            warn!(
                world_id = %world_id,
                replaced_connection = %replaced.connection.id(),
                connection_id = %connection.id(),
                "Replaced existing session for world"
            );
        }
        connection.set_world_id(world_id);

        metrics::gauge!("tablekeeper_sessions").set(self.sessions.len() as f64);
        info!(
            world_id = %world_id,
            user_id = %session.user_id,
            is_gm = session.is_gm,
            "Session authenticated"
        );

        Ok(session)
    }

    /// The session owned by this connection
    pub fn require_auth(&self, connection: &Connection) -> ServiceResult<Session> {
        let world_id = connection.world_id().ok_or(ServiceError::Unauthenticated)?;

        self.sessions
            .get(world_id.as_str())
            .filter(|s| s.connection.id() == connection.id())
            .map(|s| s.value().clone())
            .ok_or(ServiceError::Unauthenticated)
    }

    pub fn require_gm(&self, connection: &Connection, action: &str) -> ServiceResult<Session> {
        let session = self.require_auth(connection)?;
        if !session.is_gm {
            return Err(ServiceError::Forbidden {
                action: action.to_string(),
            });
        }
        Ok(session)
    }

    pub fn lookup(&self, world_id: &str) -> Option<Session> {
        self.sessions.get(world_id).map(|s| s.value().clone())
    }

    /// Drop the world's session if it still belongs to `connection_id`
    pub fn remove(&self, world_id: &str, connection_id: &str) -> bool {
        let removed = self
            .sessions
            .remove_if(world_id, |_, s| s.connection.id() == connection_id)
            .is_some();

        if removed {
            metrics::gauge!("tablekeeper_sessions").set(self.sessions.len() as f64);
            debug!(world_id = %world_id, connection_id = %connection_id, "Session removed");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
