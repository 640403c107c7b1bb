// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! HTTP control surface for both download backends.
//!
//! # Endpoints
//!
//! - `POST /aria2/start` - Submit a URL to the aria2 daemon
//! - `GET /aria2/status?gid=` - Byte-level progress of a daemon job
//! - `POST /aria2/stop` - Remove a daemon job
//! - `POST /hf/start` - Start an in-process hub download
//! - `GET /hf/status?gid=` - Coarse state of a hub job
//! - `POST /hf/stop` - Mark a hub job stopped
//! - `GET /health` - Health check
//! - `GET /fs/listdir?path=` - Browse destination folders
//! - `POST /fs/upload` - Save a multipart upload into a folder
//!
//! Status polls are routed by endpoint; a gid is only meaningful to the
//! backend that issued it.
//!
//! # Example
//!
//! ```no_run
//! use fetchhub::config::Config;
//! use fetchhub::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::new(Config::default());
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        multipart::MultipartRejection,
        DefaultBodyLimit, Multipart, Query, State,
    },
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::browse::{self, DirListing, UploadSaved};
use crate::config::Config;
use crate::daemon::{DaemonJobs, DaemonStartRequest, DaemonStarted, DaemonStatus};
use crate::error::JobError;
use crate::hub::{HttpHubDownloader, HubJobView, HubJobs, HubStartRequest};
use crate::registry::JobRegistry;
use crate::resolver::FilenameResolver;
use crate::rpc::{Aria2Launcher, Aria2Rpc, DaemonSupervisor, RpcTransport};

// Maximum JSON request body size (1MB)
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Controllers shared across handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub daemon: DaemonJobs,
    pub hub: HubJobs,
}

impl AppState {
    pub fn new(daemon: DaemonJobs, hub: HubJobs) -> Self {
        Self { daemon, hub }
    }

    /// Production wiring: aria2 over HTTP, real header probes, HTTP hub.
    pub fn from_config(config: &Config) -> Self {
        let rpc: Arc<dyn RpcTransport> =
            Arc::new(Aria2Rpc::new(&config.aria2_rpc_url, &config.aria2_secret));
        let launcher = Arc::new(Aria2Launcher::new(
            config.aria2_binary(),
            &config.aria2_secret,
            config.aria2_rpc_port(),
        ));
        let supervisor = DaemonSupervisor::new(Arc::clone(&rpc), launcher);
        let daemon = DaemonJobs::new(
            rpc,
            supervisor,
            FilenameResolver::http(),
            Arc::new(JobRegistry::new()),
        );

        let hub = HubJobs::new(
            Arc::new(HttpHubDownloader::new(&config.hub_endpoint)),
            Arc::new(JobRegistry::new()),
        )
        .with_default_token(config.hub_token.clone());

        Self::new(daemon, hub)
    }
}

/// API server configuration.
#[derive(Debug)]
pub struct Server {
    config: Config,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Server {
    /// By default, binds to 127.0.0.1 (localhost only).
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    /// Build the router with production state.
    pub fn build_router(&self) -> Router {
        router(Arc::new(AppState::from_config(&self.config)))
    }

    /// Start the server with graceful shutdown.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router();
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);

        tracing::info!("Starting server on {}", addr);
        tracing::info!(
            rpc = %self.config.aria2_rpc_url,
            hub = %self.config.hub_endpoint,
            "Backends configured"
        );

        if self.config.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. \
                    Another fetchhub server may be running; \
                    stop it or pick a different port with: fetchhub serve --port <PORT>",
                    self.config.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }
}

/// Router over the given state. Tests inject mocked controllers here.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health_handler))
        .route("/aria2/start", post(aria2_start_handler))
        .route("/aria2/status", get(aria2_status_handler))
        .route("/aria2/stop", post(aria2_stop_handler))
        .route("/hf/start", post(hf_start_handler))
        .route("/hf/status", get(hf_status_handler))
        .route("/hf/stop", post(hf_stop_handler))
        .route("/fs/listdir", get(listdir_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE));

    // Uploads stream to disk and are not size-limited.
    let uploads = Router::new()
        .route("/fs/upload", post(upload_handler))
        .layer(DefaultBodyLimit::disable());

    api.merge(uploads)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    daemon: &'static str,
    hub_jobs: usize,
}

#[derive(Deserialize, Default)]
struct GidQuery {
    #[serde(default)]
    gid: String,
}

#[derive(Deserialize, Default)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

fn bad_json(rejection: JsonRejection) -> JobError {
    JobError::invalid(format!("Invalid request body: {}", rejection.body_text()))
}

fn bad_query(rejection: QueryRejection) -> JobError {
    JobError::invalid(format!("Invalid query: {}", rejection.body_text()))
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check handler. Never launches the daemon.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let daemon = if state.daemon.daemon_reachable().await {
        "running"
    } else {
        "not running"
    };

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        daemon,
        hub_jobs: state.hub.tracked(),
    })
}

async fn aria2_start_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DaemonStartRequest>, JsonRejection>,
) -> Result<Json<DaemonStarted>, JobError> {
    let Json(req) = payload.map_err(bad_json)?;
    Ok(Json(state.daemon.start(req).await?))
}

async fn aria2_status_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<GidQuery>, QueryRejection>,
) -> Result<Json<DaemonStatus>, JobError> {
    let Query(q) = query.map_err(bad_query)?;
    Ok(Json(state.daemon.status(&q.gid).await?))
}

async fn aria2_stop_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GidQuery>, JsonRejection>,
) -> Result<Json<OkResponse>, JobError> {
    let Json(body) = payload.map_err(bad_json)?;
    state.daemon.stop(&body.gid).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn hf_start_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<HubStartRequest>, JsonRejection>,
) -> Result<Json<HubJobView>, JobError> {
    let Json(req) = payload.map_err(bad_json)?;
    Ok(Json(state.hub.start(req)?))
}

async fn hf_status_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<GidQuery>, QueryRejection>,
) -> Result<Json<HubJobView>, JobError> {
    let Query(q) = query.map_err(bad_query)?;
    Ok(Json(state.hub.status(q.gid.trim())?))
}

async fn hf_stop_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GidQuery>, JsonRejection>,
) -> Result<Json<HubJobView>, JobError> {
    let Json(body) = payload.map_err(bad_json)?;
    Ok(Json(state.hub.stop(body.gid.trim())?))
}

/// Listing failures come back as 200 with `ok: false`.
async fn listdir_handler(
    query: Result<Query<PathQuery>, QueryRejection>,
) -> Result<Json<DirListing>, JobError> {
    let Query(q) = query.map_err(bad_query)?;
    let listing = tokio::task::spawn_blocking(move || browse::list_dir(&q.path))
        .await
        .map_err(|e| JobError::Internal(format!("Directory listing task failed: {}", e)))?;
    Ok(Json(listing))
}

async fn upload_handler(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadSaved>, JobError> {
    let multipart = multipart
        .map_err(|e| JobError::invalid(format!("Invalid upload: {}", e.body_text())))?;
    Ok(Json(browse::save_upload(multipart).await?))
}

/// Wait for a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C elsewhere).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
            }
            _ => {
                tracing::warn!("Failed to install Unix signal handlers, falling back to Ctrl+C");
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await;

    // Hub workers are detached; in-flight transfers keep their .incomplete
    // files and resume on the next start.
    tracing::info!("Shutting down server");
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_default() {
        let server = Server::default();
        assert_eq!(server.port(), 8790);
        assert_eq!(server.config.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_server_builder() {
        let server = Server::new(Config::default())
            .with_port(3000)
            .with_bind_address("0.0.0.0");
        assert_eq!(server.port(), 3000);
        assert_eq!(server.config.bind_address, "0.0.0.0");
    }

    #[tokio::test]
    async fn test_production_router_builds() {
        let config = Config {
            aria2_rpc_url: "http://127.0.0.1:9/jsonrpc".into(),
            ..Config::default()
        };
        let _router = Server::new(config).build_router();
    }
}
