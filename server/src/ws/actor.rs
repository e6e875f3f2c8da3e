use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::state::AppState;
use crate::ws::broadcast::send_event;
use crate::ws::protocol::{self, ServerEvent};

/// Ping interval: server sends WebSocket ping every 30 seconds.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code for a device id that already has a live connection.
pub const CLOSE_ALREADY_CONNECTED: u16 = 4004;

/// Run the actor-per-connection pattern for an admitted device.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader loop: decodes JSON frames and dispatches them to the engine
///
/// The engine and its peers reach this client by cloning the sender.
/// On exit the device is removed from the queue and its pair exactly once.
pub async fn run_connection(mut socket: WebSocket, state: AppState, device_id: String) {
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    if !state.engine.register_connection(&device_id, tx.clone()) {
        tracing::info!(device_id = %device_id, "Refusing second connection");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_ALREADY_CONNECTED,
                reason: "Device already connected".into(),
            })))
            .await;
        return;
    }

    let (ws_sender, mut ws_receiver) = socket.split();

    tracing::info!(device_id = %device_id, "WebSocket actor started");

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    send_event(
        &tx,
        &ServerEvent::DailyLimits {
            limits: state.engine.remaining_limits(&device_id),
        },
    );

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_device = device_id.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died, connection is gone
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!(device_id = %ping_device, "Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_message(text.as_str(), &tx, &state, &device_id);
                }
                Message::Binary(data) => {
                    tracing::debug!(
                        device_id = %device_id,
                        len = data.len(),
                        "Ignoring binary frame"
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        device_id = %device_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    device_id = %device_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(device_id = %device_id, "WebSocket stream ended");
                break;
            }
        }
    }

    writer_handle.abort();
    ping_handle.abort();

    state.engine.leave(&device_id);
    state.engine.unregister_connection(&device_id, &tx);

    tracing::info!(device_id = %device_id, "WebSocket actor stopped");
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
/// Stops after forwarding a close frame.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
