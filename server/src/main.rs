use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use pairchat_server::clock::{SharedClock, SystemClock};
use pairchat_server::config::{generate_config_template, Config};
use pairchat_server::{db, routes, state};

/// How long shutdown waits for queued persistence writes.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Close code sent to live sockets when the server stops.
const CLOSE_GOING_AWAY: u16 = 1001;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pairchat_server=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter())
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter())
            .init();
    }

    tracing::info!("Pairchat server v{} starting", env!("CARGO_PKG_VERSION"));

    let matching = config.matching.clone().unwrap_or_default();
    tracing::info!(
        daily_quota = matching.daily_quota,
        join_cooldown_secs = matching.join_cooldown_secs,
        report_threshold = matching.report_threshold,
        ban_duration_secs = matching.ban_duration_secs,
        "Matching engine configured"
    );
    if config.admin_token.as_deref().is_none_or(str::is_empty) {
        tracing::info!("No admin token configured, /api/admin routes disabled");
    }

    // Initialize SQLite database and the write-behind writer
    let db = db::init_db(&config.data_dir)?;
    let (sink, writer_handle) =
        db::sync::spawn_writer(db.clone(), matching.persist_queue_capacity);

    let clock: SharedClock = Arc::new(SystemClock);
    let app_state = state::AppState::new(
        db,
        matching,
        clock,
        sink,
        config.admin_token.clone(),
    );

    // Spawn background task to drop elapsed per-device rate windows
    let limiter = app_state.rate_limiter.clone();
    let engine = Arc::downgrade(&app_state.engine);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            limiter.retain_recent();
            let Some(engine) = engine.upgrade() else {
                break;
            };
            let stats = engine.stats();
            tracing::debug!(
                queued = stats.queued,
                paired = stats.paired,
                devices = stats.devices,
                bans = stats.bans,
                connections = stats.connections,
                rate_windows = limiter.tracked_devices(),
                "Engine stats"
            );
        }
    });

    let engine = app_state.engine.clone();

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Upgraded sockets outlive `serve`; ask them to go, then flush the writer.
    let closed = engine.close_all_connections(CLOSE_GOING_AWAY, "Server shutting down");
    tracing::info!(connections = closed, "Closed live connections");
    drop(engine);

    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_handle.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Persistence writer failed"),
        Err(_) => tracing::warn!("Persistence writer did not drain before shutdown"),
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                tracing::info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
