//! JSON client protocol.
//!
//! Inbound frames are tagged by `action`, outbound frames by `type`.

use serde::{Deserialize, Serialize};

use crate::error::MatchError;
use crate::matching::{Filter, JoinOutcome, PeerProfile, RemainingLimits};
use crate::state::AppState;
use crate::ws::broadcast::send_event;
use crate::ws::ConnectionSender;

const DEFAULT_REPORT_REASON: &str = "Inappropriate behavior";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Join {
        #[serde(default)]
        filter: Filter,
        #[serde(default)]
        nickname: Option<String>,
    },
    Leave,
    Msg {
        text: String,
    },
    Typing,
    Next,
    Report {
        reported: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ClientAction {
    fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave => "leave",
            Self::Msg { .. } => "msg",
            Self::Typing => "typing",
            Self::Next => "next",
            Self::Report { .. } => "report",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    DailyLimits {
        limits: RemainingLimits,
    },
    Queued {
        filter: Filter,
        limits: RemainingLimits,
    },
    Matched {
        peer: String,
        peer_profile: PeerProfile,
        limits: RemainingLimits,
    },
    PeerLeft {
        peer: String,
    },
    Left,
    Reported {
        target: String,
    },
    Msg {
        from: String,
        text: String,
    },
    Typing {
        from: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl From<JoinOutcome> for ServerEvent {
    fn from(outcome: JoinOutcome) -> Self {
        match outcome {
            JoinOutcome::Matched {
                peer,
                peer_profile,
                limits,
            } => Self::Matched {
                peer,
                peer_profile,
                limits,
            },
            JoinOutcome::Queued { filter, limits } => Self::Queued { filter, limits },
        }
    }
}

impl From<&MatchError> for ServerEvent {
    fn from(err: &MatchError) -> Self {
        Self::error(err.to_string())
    }
}

/// Handle one inbound text frame from `device_id`.
///
/// Rate limiting is applied before the frame is even parsed, so malformed
/// frames count against the budget too.
pub fn handle_text_message(text: &str, tx: &ConnectionSender, state: &AppState, device_id: &str) {
    if !state.rate_limiter.allow(device_id) {
        tracing::debug!(device_id = %device_id, "Rate limited");
        send_event(tx, &ServerEvent::from(&MatchError::RateLimited));
        return;
    }

    let action = match serde_json::from_str::<ClientAction>(text) {
        Ok(action) => action,
        Err(e) => {
            tracing::debug!(device_id = %device_id, error = %e, "Failed to decode client frame");
            send_event(tx, &ServerEvent::error("Invalid message format"));
            return;
        }
    };

    tracing::trace!(device_id = %device_id, action = action.name(), "Dispatching");
    dispatch_action(action, tx, state, device_id);
}

/// Dispatch a decoded action to the engine and answer the sender.
fn dispatch_action(action: ClientAction, tx: &ConnectionSender, state: &AppState, device_id: &str) {
    let engine = &state.engine;
    let reply = match action {
        ClientAction::Join { filter, nickname } => engine
            .join(device_id, filter, nickname, tx)
            .map(ServerEvent::from),
        ClientAction::Leave => {
            engine.leave(device_id);
            Ok(ServerEvent::Left)
        }
        ClientAction::Next => {
            engine.next(device_id);
            Ok(ServerEvent::Left)
        }
        ClientAction::Msg { text } => match engine.relay_text(device_id, &text) {
            Ok(_) => return,
            Err(e) => Err(e),
        },
        ClientAction::Typing => {
            engine.relay_typing(device_id);
            return;
        }
        ClientAction::Report { reported, reason } => {
            let reason = reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_REPORT_REASON.to_string());
            engine
                .report(device_id, &reported, &reason)
                .map(|outcome| ServerEvent::Reported {
                    target: outcome.target,
                })
        }
    };

    match reply {
        Ok(event) => {
            send_event(tx, &event);
        }
        Err(e) => {
            tracing::debug!(device_id = %device_id, error = %e, "Action rejected");
            send_event(tx, &ServerEvent::from(&e));
        }
    }
}
