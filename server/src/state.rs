use std::sync::Arc;

use crate::clock::SharedClock;
use crate::config::MatchingConfig;
use crate::db::{DbPool, PersistSink};
use crate::matching::MatchEngine;
use crate::ratelimit::RateLimiter;
use crate::ws::new_connection_registry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>, read by admin listings
    pub db: DbPool,
    /// Matching engine: queue, pairs, quotas, bans, live connections
    pub engine: Arc<MatchEngine>,
    /// Per-device fixed-window limiter for client actions
    pub rate_limiter: RateLimiter,
    /// Bearer token for /api/admin routes; None disables them
    pub admin_token: Option<String>,
}

impl AppState {
    /// Wire the engine and limiter from the matching config.
    pub fn new(
        db: DbPool,
        matching: MatchingConfig,
        clock: SharedClock,
        sink: PersistSink,
        admin_token: Option<String>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(
            clock.clone(),
            matching.rate_limit_window(),
            matching.rate_limit_max_actions,
        );
        let engine = MatchEngine::new(matching, clock, sink, new_connection_registry());
        Self {
            db,
            engine: Arc::new(engine),
            rate_limiter,
            admin_token,
        }
    }
}
