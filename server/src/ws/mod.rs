pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use axum::extract::ws::Message;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sender half of a WebSocket connection's outbound channel.
/// Anything holding a clone can push frames to that client.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// Live connections keyed by device id. One connection per device.
///
/// Liveness here is advisory: a sender whose writer has gone away simply
/// fails to send.
pub type ConnectionRegistry = Arc<DashMap<String, ConnectionSender>>;

/// Create a new empty connection registry.
pub fn new_connection_registry() -> ConnectionRegistry {
    Arc::new(DashMap::new())
}
