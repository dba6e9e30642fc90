//! WebSocket connection handling.
//!
//! Each socket gets a writer task draining an unbounded channel, and a read
//! loop that hands text frames to the dispatcher.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::service::TablekeeperService;
use crate::session::Connection;

use super::dispatch::handle_text;
use super::messages::ServerFrame;

/// Handle a WebSocket connection
///
/// Runs until the client closes the socket or a transport error occurs,
/// then releases the connection's session and any tool calls waiting on it.
pub async fn handle_ws_connection(socket: WebSocket, service: Arc<TablekeeperService>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let connection = Connection::new(frame_tx);
    let connection_id = connection.id().to_string();
    info!(connection_id = %connection_id, "New WebSocket connection");
    metrics::gauge!("tablekeeper_ws_connections").increment(1.0);

    let send_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to serialize WebSocket frame");
                }
            }
        }
        debug!(connection_id = %send_id, "WebSocket send task ended");
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => {
                handle_text(&service, &connection, &text).await;
            }
            Ok(Message::Binary(data)) => {
                if let Ok(text) = String::from_utf8(data.to_vec()) {
                    handle_text(&service, &connection, &text).await;
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(connection_id = %connection_id, "WebSocket connection closed by client");
                break;
            }
            Err(e) => {
                error!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    if let Some(world_id) = connection.world_id() {
        service.disconnect(&world_id, &connection_id);
    }
    send_task.abort();
    metrics::gauge!("tablekeeper_ws_connections").decrement(1.0);
    info!(connection_id = %connection_id, "WebSocket connection closed");
}
