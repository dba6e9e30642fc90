//! Tool call bridge.
//!
//! Relays a tool call from the model to the world's connected client and
//! waits for the matching `tool-result` frame. Calls are correlated by a
//! fresh `callId` and every request ends in exactly one outcome: the
//! delivered result, the client's error, a timeout, or a disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::session::SessionRegistry;
use crate::tools::ToolRegistry;
use crate::websocket::ServerFrame;

type ToolOutcome = Result<serde_json::Value, String>;

/// A call pushed to a client and not yet answered
struct PendingToolCall {
    world_id: String,
    connection_id: String,
    tool_name: String,
    tx: oneshot::Sender<ToolOutcome>,
    issued_at: Instant,
}

pub struct ToolCallBridge {
    pending: DashMap<String, PendingToolCall>,
    sessions: Arc<SessionRegistry>,
    tools: &'static ToolRegistry,
    config: Arc<RuntimeConfig>,
}

impl ToolCallBridge {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        tools: &'static ToolRegistry,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            pending: DashMap::new(),
            sessions,
            tools,
            config,
        }
    }

    /// Run a tool on the world's client with the configured deadline
    pub async fn request(
        &self,
        world_id: &str,
        tool_name: &str,
        tool_input: serde_json::Value,
    ) -> ServiceResult<serde_json::Value> {
        let timeout = self.config.dynamic().tool_bridge.timeout();
        self.request_with_timeout(world_id, tool_name, tool_input, timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        world_id: &str,
        tool_name: &str,
        tool_input: serde_json::Value,
        timeout: Duration,
    ) -> ServiceResult<serde_json::Value> {
        self.tools.validate(tool_name)?;

        let session = self
            .sessions
            .lookup(world_id)
            .ok_or_else(|| ServiceError::NoClientConnected {
                world_id: world_id.to_string(),
            })?;

        let call_id = uuid::Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(
            call_id.clone(),
            PendingToolCall {
                world_id: world_id.to_string(),
                connection_id: session.connection.id().to_string(),
                tool_name: tool_name.to_string(),
                tx,
                issued_at: Instant::now(),
            },
        );

        let frame = ServerFrame::tool_execute(call_id.clone(), tool_name.to_string(), tool_input);
        if !session.connection.send(frame) {
            self.pending.remove(&call_id);
            record_outcome(tool_name, "no_client");
            return Err(ServiceError::NoClientConnected {
                world_id: world_id.to_string(),
            });
        }

        debug!(
            world_id = %world_id,
            call_id = %call_id,
            tool = %tool_name,
            "Tool call sent to client"
        );

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped: the world's connection went away
            Ok(Err(_)) => {
                record_outcome(tool_name, "no_client");
                return Err(ServiceError::NoClientConnected {
                    world_id: world_id.to_string(),
                });
            }
            Err(_) => {
                if self.pending.remove(&call_id).is_some() {
                    warn!(
                        world_id = %world_id,
                        call_id = %call_id,
                        tool = %tool_name,
                        "Tool call timed out"
                    );
                    record_outcome(tool_name, "timeout");
                    return Err(ServiceError::ToolTimeout {
                        tool: tool_name.to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
                // A delivery took the entry just before the deadline; its value wins
                match rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        record_outcome(tool_name, "no_client");
                        return Err(ServiceError::NoClientConnected {
                            world_id: world_id.to_string(),
                        });
                    }
                }
            }
        };

        match outcome {
            Ok(value) => {
                record_outcome(tool_name, "ok");
                Ok(value)
            }
            Err(message) => {
                record_outcome(tool_name, "error");
                Err(ServiceError::ToolExecution {
                    tool: tool_name.to_string(),
                    message,
                })
            }
        }
    }

    /// Resolve a pending call from an inbound `tool-result`. Unknown ids are ignored.
    pub fn deliver(&self, call_id: &str, result: serde_json::Value, error: Option<String>) {
        let Some((_, pending)) = self.pending.remove(call_id) else {
            debug!(call_id = %call_id, "Ignoring result for unknown or expired tool call");
            return;
        };

        debug!(
            call_id = %call_id,
            world_id = %pending.world_id,
            tool = %pending.tool_name,
            elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
            "Tool result received"
        );

        let outcome = match error {
            Some(message) => Err(message),
            None => Ok(result),
        };
        // The requester may already be gone; nothing to do then
        let _ = pending.tx.send(outcome);
    }

    /// Fail every pending call for a world after its connection closed
    pub fn cancel_world(&self, world_id: &str) -> usize {
        let cancelled = self.cancel_where(|call| call.world_id == world_id);
        if cancelled > 0 {
            info!(world_id = %world_id, cancelled, "Cancelled pending tool calls");
        }
        cancelled
    }

    /// Fail every call pushed to one socket, e.g. after its session was replaced
    pub fn cancel_connection(&self, connection_id: &str) -> usize {
        let cancelled = self.cancel_where(|call| call.connection_id == connection_id);
        if cancelled > 0 {
            info!(
                connection_id = %connection_id,
                cancelled,
                "Cancelled pending tool calls for connection"
            );
        }
        cancelled
    }

    fn cancel_where(&self, matches: impl Fn(&PendingToolCall) -> bool) -> usize {
        let call_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| matches(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        // Dropping the sender wakes the waiter with NoClientConnected
        call_ids
            .iter()
            .filter(|id| self.pending.remove(id.as_str()).is_some())
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn record_outcome(tool_name: &str, outcome: &'static str) {
    metrics::counter!(
        "tablekeeper_tool_calls_total",
        "tool" => tool_name.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
