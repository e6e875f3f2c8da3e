pub mod moderation;
pub mod reports;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};

/// Configured admin token stored in request extensions for the [`AdminToken`] extractor.
#[derive(Clone)]
pub struct AdminSecret(pub Option<String>);

/// Proof that the request carried `Authorization: Bearer <admin_token>`.
///
/// Rejects with 404 when no admin token is configured, so the admin surface
/// is indistinguishable from a missing route, and 401 on a wrong or missing
/// bearer.
#[derive(Debug, Clone, Copy)]
pub struct AdminToken;

impl<S> FromRequestParts<S> for AdminToken
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = parts
            .extensions
            .get::<AdminSecret>()
            .and_then(|secret| secret.0.as_deref())
            .filter(|token| !token.is_empty())
            .ok_or(StatusCode::NOT_FOUND)?;

        let presented = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(StatusCode::UNAUTHORIZED)?;

        if presented != expected {
            return Err(StatusCode::UNAUTHORIZED);
        }
        Ok(AdminToken)
    }
}
