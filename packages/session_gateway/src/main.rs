use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, patch, post},
};
use clap::Parser;
use host_process::{HostManager, StopSignal};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod command;
mod config;
mod error;
mod fanout;
mod handlers;
mod manager;
mod metrics;
mod registry;
mod session;
mod sharing;
#[cfg(test)]
mod test_helpers;
mod timer;
mod transport;
mod update_cache;

use crate::config::{FileConfig, GatewayConfig};
use crate::metrics::GatewayMetrics;
use crate::registry::SessionRegistry;
use crate::transport::HostLauncher;

/// How often terminated sessions are looked at for reaping.
const REAP_INTERVAL: Duration = Duration::from_secs(10);

/// How long shutdown waits for hosts to exit after asking them to close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Remote display session gateway")]
struct Cli {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Custom data directory (defaults to ~/.session-gateway)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<GatewayConfig>,
    /// Gateway metrics for observability
    pub metrics: Arc<GatewayMetrics>,
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        // Session routes
        .route("/api/sessions", post(handlers::create_session))
        .route(
            "/api/sessions/{id}",
            get(handlers::get_session).delete(handlers::close_session),
        )
        // Transports
        .route("/api/sessions/{id}/ws", get(handlers::session_websocket))
        .route("/api/sessions/{id}/events", get(handlers::event_stream))
        .route("/api/sessions/{id}/longpoll", get(handlers::long_poll))
        .route("/api/sessions/{id}/poll", get(handlers::poll))
        .route("/api/sessions/{id}/updates/{idx}", get(handlers::get_update))
        // Sharing
        .route(
            "/api/sessions/{id}/guests",
            post(handlers::invite_guest).get(handlers::list_guests),
        )
        .route(
            "/api/sessions/{id}/guests/{guest}",
            patch(handlers::update_guest).delete(handlers::revoke_guest),
        )
        .route(
            "/api/sessions/{id}/join/{guest}",
            post(handlers::join_session),
        )
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(unix)]
fn host_launcher(config: &GatewayConfig, hosts: Arc<HostManager>) -> Result<Arc<dyn HostLauncher>> {
    let settings = &config.hosts;
    std::fs::create_dir_all(&settings.runtime_dir).with_context(|| {
        format!(
            "failed to create runtime dir {}",
            settings.runtime_dir.display()
        )
    })?;
    Ok(Arc::new(transport::bridge::ProcessLauncher::new(
        hosts,
        settings.rdp_program.clone(),
        settings.ssh_program.clone(),
        settings.runtime_dir.clone(),
        settings.connect_timeout,
    )))
}

#[cfg(not(unix))]
fn host_launcher(_config: &GatewayConfig, _hosts: Arc<HostManager>) -> Result<Arc<dyn HostLauncher>> {
    anyhow::bail!("display hosts are only supported on unix")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "gateway=debug,host_process=debug,tower_http=debug,info"
    } else {
        "gateway=info,host_process=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting session gateway");

    let data_dir = config::resolve_data_dir(cli.data_dir)?;
    let file_config: FileConfig = config::load_config(&data_dir)
        .extract()
        .context("failed to load configuration")?;
    let mut gateway_config = GatewayConfig::from_file(&file_config, &data_dir);
    if let Some(host) = cli.host {
        gateway_config.host = host;
    }
    if let Some(port) = cli.port {
        gateway_config.port = port;
    }
    info!(
        "Session config: max_guests={}, resize_settle={:?}, idle_timeout={:?}",
        gateway_config.session.max_active_guests,
        gateway_config.session.resize_settle,
        gateway_config.session.idle_timeout,
    );

    let hosts = Arc::new(HostManager::new());
    let launcher = host_launcher(&gateway_config, hosts.clone())?;
    let metrics = Arc::new(GatewayMetrics::new());
    let registry = Arc::new(SessionRegistry::new(
        gateway_config.session_policy(),
        launcher,
        metrics.clone(),
    ));

    let cancel = CancellationToken::new();
    let reaper = registry
        .clone()
        .spawn_reaper(REAP_INTERVAL, gateway_config.linger, cancel.clone());

    let config = Arc::new(gateway_config);
    let app_state = AppState {
        registry: registry.clone(),
        config: config.clone(),
        metrics,
    };
    let app = build_router(app_state);

    let addr = format!("{}:{}", config.host, config.port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Session gateway listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /api/sessions                 - Open a session");
    info!("  GET    /api/sessions/:id             - Session details");
    info!("  DELETE /api/sessions/:id             - Close a session");
    info!("  GET    /api/sessions/:id/ws          - WebSocket transport");
    info!("  GET    /api/sessions/:id/events      - Event stream transport");
    info!("  GET    /api/sessions/:id/longpoll    - Long-poll transport");
    info!("  GET    /api/sessions/:id/poll        - Plain poll transport");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    cancel.cancel();
    if let Err(e) = reaper.await {
        warn!("Reaper task failed: {}", e);
    }

    info!("Closing sessions...");
    registry.shutdown_all(SHUTDOWN_GRACE).await;
    hosts.stop_all(StopSignal::Kill).await;

    info!("Shutdown complete");
    server_result
}
