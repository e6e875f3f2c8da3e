use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::matching::{engine::CLOSE_BANNED, validate_device_id};
use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for WebSocket connection.
/// The device id is the only identity; there is no account.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub device_id: String,
}

/// WebSocket close codes:
/// 4002 = device id invalid
/// 4003 = banned
/// 4004 = device already connected (sent by the actor)
const CLOSE_DEVICE_INVALID: u16 = 4002;

/// GET /ws?device_id=ID
/// WebSocket upgrade endpoint. Admission is checked before the actor starts:
/// on failure the socket is upgraded and immediately closed with a code.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let device_id = params.device_id;

    let rejection = if validate_device_id(&device_id).is_err() {
        Some((CLOSE_DEVICE_INVALID, "Invalid device_id".to_string()))
    } else {
        state
            .engine
            .ban_status(&device_id)
            .map(|ban| (CLOSE_BANNED, format!("Device banned: {}", ban.reason)))
    };

    match rejection {
        None => {
            tracing::info!(device_id = %device_id, "WebSocket connection admitted");
            ws.on_upgrade(move |socket| actor::run_connection(socket, state, device_id))
        }
        Some((close_code, reason)) => {
            tracing::warn!(
                close_code = close_code,
                reason = %reason,
                "WebSocket admission refused"
            );

            // Upgrade the connection, then immediately close with the error code
            ws.on_upgrade(move |mut socket| async move {
                let close_frame = CloseFrame {
                    code: close_code,
                    reason: reason.into(),
                };
                let _ = socket.send(Message::Close(Some(close_frame))).await;
            })
        }
    }
}
