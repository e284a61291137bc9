//! HTTP server setup and configuration.

use axum::{
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::upstream::{ChunkSource, HttpChunkSource};
use crate::admission::AdmissionController;
use crate::config::Config;
use crate::storage::{init_pool, MetricsSink, NoopMetrics, SqliteMetrics};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<AdmissionController>,
    pub source: Arc<dyn ChunkSource>,
    pub metrics: Arc<dyn MetricsSink>,
    pub config: Arc<Config>,
}

impl AppState {
    /// State with a controller built from `config` and no metrics.
    pub fn new(config: Config, source: Arc<dyn ChunkSource>) -> Self {
        let controller = AdmissionController::with_limits(
            config.admission.controller_config(),
            config.provider_limits(),
        );
        Self {
            controller: Arc::new(controller),
            source,
            metrics: Arc::new(NoopMetrics),
            config: Arc::new(config),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        // llmgate extensions
        .route("/health", get(handlers::health))
        .route("/v1/admission", get(handlers::admission_status_all))
        .route("/v1/admission/:provider", get(handlers::admission_status))
        .route("/v1/admission/:provider/reset", post(handlers::reset_circuit))
        .route("/v1/admission/:provider/limits", patch(handlers::update_limits))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until ctrl-c.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    let source = Arc::new(HttpChunkSource::from_config(&config)?);

    let metrics: Arc<dyn MetricsSink> = if config.logging.log_requests {
        let db = config.database();
        let pool = init_pool(&db.path).await?;
        tracing::info!(path = %db.path, "Request metrics enabled");
        Arc::new(SqliteMetrics::new(pool))
    } else {
        Arc::new(NoopMetrics)
    };

    let state = AppState::new(config, source).with_metrics(metrics);
    let controller = state.controller.clone();
    let sweeper = controller.spawn_sweeper();

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting llmgate server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            controller.shutdown();
        })
        .await?;

    sweeper.await?;
    Ok(())
}
