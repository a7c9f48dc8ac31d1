//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::{MonitorConfig, ServerConfig};
use crate::db::{AlarmStore, Store};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub monitor: Arc<MonitorConfig>,
    pub store: Arc<Store>,
    pub alarms: Arc<AlarmStore>,
}

/// HTTP API for CanaryWatch.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        monitor: Arc<MonitorConfig>,
        store: Arc<Store>,
        alarms: Arc<AlarmStore>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                monitor,
                store,
                alarms,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/health", get(handlers::handle_health))
            .route("/api/targets", get(handlers::handle_get_targets))
            .route("/api/definitions", get(handlers::handle_get_definitions))
            .route("/api/metrics", get(handlers::handle_get_metrics))
            .route("/api/alarms", get(handlers::handle_get_alarms))
            .route("/api/alarms/{name}", get(handlers::handle_get_alarm))
            .route("/api/alarm-events", post(handlers::handle_post_alarm_events))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
