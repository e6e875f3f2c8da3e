//! Category verification.
//!
//! `classify` is a deterministic placeholder: it validates nothing about the
//! picture itself and buckets the SHA-256 digest of the upload.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::matching::{validate_device_id, Category};
use crate::state::AppState;

/// Uploads smaller than this classify as prefer-not-to-say and are rejected by the endpoint.
pub const MIN_IMAGE_BYTES: usize = 1000;

/// Largest accepted upload (10 MB).
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

const ALLOWED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/webp"];

/// Map an image to a category. Same bytes, same answer.
pub fn classify(image: &[u8]) -> Category {
    if image.len() < MIN_IMAGE_BYTES {
        return Category::PreferNotToSay;
    }
    let digest = Sha256::digest(image);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    match u64::from_be_bytes(head) % 100 {
        0..=44 => Category::Male,
        45..=89 => Category::Female,
        _ => Category::NonBinary,
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub device_id: String,
    pub gender: Category,
    pub verified: bool,
    pub message: String,
}

/// POST /api/verify?device_id=ID
///
/// Raw image body with an image Content-Type. Stores the resulting category
/// on the device profile; the image itself is never kept.
pub async fn verify_device(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<VerifyResponse>, (StatusCode, String)> {
    validate_device_id(&query.device_id)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
        .unwrap_or_default();
    if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
        return Err((
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Invalid file type. Allowed: image/jpeg, image/png, image/webp".to_string(),
        ));
    }

    if body.len() < MIN_IMAGE_BYTES {
        return Err((
            StatusCode::BAD_REQUEST,
            "Image too small (min 1KB)".to_string(),
        ));
    }
    if body.len() > MAX_IMAGE_BYTES {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            "Image too large (max 10MB)".to_string(),
        ));
    }

    let category = classify(&body);
    drop(body);

    state.engine.set_category(&query.device_id, category);

    let verified = category != Category::PreferNotToSay;
    let message = if verified {
        format!("Gender verified as {category}")
    } else {
        "Could not verify gender - defaulting to neutral".to_string()
    };

    tracing::info!(device_id = %query.device_id, category = %category, "Device verified");

    Ok(Json(VerifyResponse {
        device_id: query.device_id,
        gender: category,
        verified,
        message,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_inputs_are_unclassified() {
        assert_eq!(classify(&[]), Category::PreferNotToSay);
        assert_eq!(classify(&[7u8; 999]), Category::PreferNotToSay);
    }

    #[test]
    fn classification_is_deterministic() {
        let image: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
        let first = classify(&image);
        assert_eq!(classify(&image), first);
        assert_ne!(first, Category::PreferNotToSay);
    }

    #[test]
    fn buckets_cover_three_categories() {
        let mut seen = std::collections::HashSet::new();
        for seed in 0..200u32 {
            let image: Vec<u8> = seed.to_be_bytes().iter().copied().cycle().take(1500).collect();
            seen.insert(classify(&image));
        }
        assert!(seen.contains(&Category::Male));
        assert!(seen.contains(&Category::Female));
        assert!(seen.contains(&Category::NonBinary));
        assert!(!seen.contains(&Category::PreferNotToSay));
    }
}
