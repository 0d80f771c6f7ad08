//! REST API of the hub
//!
//! ## Architecture
//!
//! - **Axum** web framework with Tower middleware
//! - **Actor handles** for querying targets and alerts
//! - **Shutdown handle** for the quit endpoint
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Health check
//! - `GET /api/v1/status` - Build info, configuration, flags, queue depth, shutdown state
//! - `GET /api/v1/targets` - Scrape target health
//! - `GET /api/v1/query` - Latest samples of matching series
//! - `GET /api/v1/query_range` - Samples of matching series in a time range
//! - `GET /api/v1/alerts` - Pending and firing alerts
//! - `GET /api/v1/stats` - Storage and forwarding statistics
//! - `POST /-/quit` - Request a graceful shutdown

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use state::{ApiState, RuntimeInfo};

use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ApiConfig;
use crate::lifecycle::ShutdownTrigger;

/// Build the router with every route and the configured layers
pub fn router(config: &ApiConfig, state: ApiState) -> Router {
    let mut app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/status", get(routes::status::get_status))
        .route("/api/v1/targets", get(routes::targets::list_targets))
        .route("/api/v1/query", get(routes::query::query))
        .route("/api/v1/query_range", get(routes::query::query_range))
        .route("/api/v1/alerts", get(routes::alerts::list_alerts))
        .route("/api/v1/stats", get(routes::stats::get_stats))
        .route("/-/quit", post(routes::lifecycle::quit))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    if let Some(token) = config.auth_token.clone() {
        app = app.layer(axum::middleware::from_fn_with_state(
            token,
            middleware::auth::auth_middleware,
        ));
    }

    app
}

/// A bound but not yet serving API listener
pub struct ApiListener {
    listener: tokio::net::TcpListener,
    config: ApiConfig,
}

impl ApiListener {
    /// Bind the configured address; failing here is fatal at startup
    pub async fn bind(config: &ApiConfig) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("failed to bind API server to {}", config.bind_addr))?;

        Ok(Self {
            listener,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve in a background task
    ///
    /// The server stops once shutdown has completed. An error while serving is
    /// logged and triggers shutdown.
    pub fn serve(self, state: ApiState) -> tokio::task::JoinHandle<()> {
        let shutdown = state.shutdown.clone();
        let app = router(&self.config, state);

        if let Ok(addr) = self.listener.local_addr() {
            info!("API server listening on {}", addr);
        }

        tokio::spawn(async move {
            let stopped = shutdown.clone();
            let result = axum::serve(self.listener, app)
                .with_graceful_shutdown(async move { stopped.wait_stopped().await })
                .await;

            if let Err(e) = result {
                error!("API server error: {}", e);
                shutdown.trigger(ShutdownTrigger::ServeError);
            }
        })
    }
}
