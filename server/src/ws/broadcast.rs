use axum::extract::ws::{CloseFrame, Message};

use super::protocol::ServerEvent;
use super::{ConnectionRegistry, ConnectionSender};

/// Encode an event as a JSON text frame and push it to one connection.
/// Returns false if the connection is gone.
pub fn send_event(tx: &ConnectionSender, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => tx.send(Message::Text(json.into())).is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode server event");
            false
        }
    }
}

/// Send an event to a device's live connection, if it has one.
pub fn send_to_device(registry: &ConnectionRegistry, device_id: &str, event: &ServerEvent) -> bool {
    match registry.get(device_id) {
        Some(tx) => send_event(tx.value(), event),
        None => false,
    }
}

/// Force-close a device's connection (ban).
/// Sends a WebSocket Close frame with the given code and reason.
pub fn force_close_device(
    registry: &ConnectionRegistry,
    device_id: &str,
    close_code: u16,
    reason: &str,
) {
    if let Some(tx) = registry.get(device_id) {
        let close_frame = CloseFrame {
            code: close_code,
            reason: reason.into(),
        };
        let _ = tx.send(Message::Close(Some(close_frame)));
    }
}
