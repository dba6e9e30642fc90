//! WebSocket transport for client connections.
//!
//! Clients authenticate per world, request operations with JSON frames and
//! answer `tool-execute` pushes with `tool-result` frames.

mod dispatch;
mod handlers;
pub mod messages;

pub use handlers::handle_ws_connection;
pub use messages::{Operation, ServerFrame};
