use axum::extract::DefaultBodyLimit;
use axum::{middleware, Router};
use std::sync::Arc;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::admin::{moderation as admin_moderation, reports as admin_reports, AdminSecret};
use crate::state::AppState;
use crate::verify;
use crate::ws::handler as ws_handler;

/// Inject the admin token into request extensions so the AdminToken extractor can find it.
async fn inject_admin_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(AdminSecret(state.admin_token.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Rate limiting: 10 verification uploads per minute per IP
    // Uses PeerIpKeyExtractor which reads from ConnectInfo<SocketAddr>
    let verify_governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(6) // 1 token every 6 seconds = 10 per minute
            .burst_size(10)
            .finish()
            .expect("Failed to build verify governor config"),
    );
    let verify_limiter = verify_governor_config.limiter().clone();

    // Spawn background task to clean up rate limiter state
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            verify_limiter.retain_recent();
        }
    });

    let verify_routes = Router::new()
        .route(
            "/api/verify",
            axum::routing::post(verify::verify_device),
        )
        .layer(DefaultBodyLimit::max(verify::MAX_IMAGE_BYTES))
        .layer(GovernorLayer {
            config: verify_governor_config,
        });

    // Admin routes (bearer token checked by the AdminToken extractor)
    let admin_routes = Router::new()
        .route(
            "/api/admin/reports",
            axum::routing::get(admin_reports::list_reports),
        )
        .route(
            "/api/admin/ban",
            axum::routing::post(admin_moderation::ban_device),
        )
        .route(
            "/api/admin/unban",
            axum::routing::post(admin_moderation::unban_device),
        );

    // WebSocket endpoint (identity via query param)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(verify_routes)
        .merge(admin_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_admin_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
