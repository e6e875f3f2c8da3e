use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::AdminToken;
use crate::db::sync::{list_reports as query_reports, ReportRow};
use crate::state::AppState;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

#[derive(Debug, Deserialize)]
pub struct ReportListQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ReportListResponse {
    pub reports: Vec<ReportRow>,
}

/// GET /api/admin/reports?limit=N - newest reports first.
pub async fn list_reports(
    State(state): State<AppState>,
    _admin: AdminToken,
    Query(query): Query<ReportListQuery>,
) -> Result<Json<ReportListResponse>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let db = state.db.clone();

    let reports = tokio::task::spawn_blocking(move || query_reports(&db, limit))
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Task join error: {}", e),
            )
        })?
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(ReportListResponse { reports }))
}
