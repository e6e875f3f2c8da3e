use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use super::AdminToken;
use crate::matching::validate_device_id;
use crate::moderation::{BanKind, BanRecord};
use crate::state::AppState;

const DEFAULT_BAN_REASON: &str = "Banned by administrator";

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub device_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Debug, Serialize)]
pub struct BanResponse {
    pub device_id: String,
    #[serde(flatten)]
    pub ban: BanRecord,
}

#[derive(Debug, Deserialize)]
pub struct UnbanRequest {
    pub device_id: String,
}

#[derive(Debug, Serialize)]
pub struct UnbanResponse {
    pub device_id: String,
    /// False when the device had no ban to lift.
    pub lifted: bool,
}

/// POST /api/admin/ban - ban a device and disconnect it.
pub async fn ban_device(
    State(state): State<AppState>,
    _admin: AdminToken,
    Json(req): Json<BanRequest>,
) -> Result<Json<BanResponse>, (StatusCode, String)> {
    validate_device_id(&req.device_id).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let reason = req
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_BAN_REASON.to_string());
    let kind = if req.permanent {
        BanKind::Permanent
    } else {
        BanKind::Temporary
    };

    let ban = state.engine.ban(&req.device_id, &reason, kind);

    Ok(Json(BanResponse {
        device_id: req.device_id,
        ban,
    }))
}

/// POST /api/admin/unban - lift a ban and clear the device's reports.
pub async fn unban_device(
    State(state): State<AppState>,
    _admin: AdminToken,
    Json(req): Json<UnbanRequest>,
) -> Result<Json<UnbanResponse>, (StatusCode, String)> {
    validate_device_id(&req.device_id).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let lifted = state.engine.unban(&req.device_id);

    Ok(Json(UnbanResponse {
        device_id: req.device_id,
        lifted,
    }))
}
