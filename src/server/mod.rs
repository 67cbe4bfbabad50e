//! HTTP service: document intake, memory queries, sessions and the
//! simulated downstream systems.

mod downstream;
mod handlers;
mod pages;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::pipeline::Pipeline;

pub use downstream::DownstreamStore;

/// State shared by every handler.
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub downstream: DownstreamStore,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, config: &Config) -> Self {
        Self {
            pipeline,
            downstream: DownstreamStore::new(&config.server.log_dir),
            max_upload_bytes: config.server.max_upload_bytes,
        }
    }
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_upload_bytes;

    Router::new()
        // pages
        .route("/", get(pages::dashboard))
        .route("/docs", get(pages::docs))
        .route("/static/style.css", get(pages::stylesheet))
        .route("/health", get(pages::health))
        // intake
        .route("/process_input/", post(handlers::process_input))
        // memory store
        .route("/processes", get(handlers::recent_processes))
        .route("/processes/{id}", get(handlers::process_history))
        .route("/search", get(handlers::search))
        .route("/stats", get(handlers::stats))
        // actions
        .route("/actions/route", post(handlers::route_action))
        .route("/actions/batch", post(handlers::route_batch))
        // sessions
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/sessions/{id}",
            get(handlers::get_session)
                .patch(handlers::update_session)
                .delete(handlers::delete_session),
        )
        .route("/sessions/{id}/results", post(handlers::store_result))
        .route("/sessions/{id}/results/{agent}", get(handlers::get_result))
        .route("/memory/metrics", get(handlers::session_metrics))
        .merge(downstream::routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP service until the process is stopped.
pub async fn serve(config: Config) -> Result<()> {
    let pipeline = Arc::new(Pipeline::from_config(&config)?);

    let cleanup_every = Duration::from_secs(config.memory.cleanup_interval_seconds.max(1));
    let _cleanup = pipeline.sessions().spawn_cleanup(cleanup_every);

    let state = Arc::new(AppState::new(pipeline, &config));
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(%addr, "InvoiceFlow listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server stopped")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::{AgentRegistry, Classifier};
    use crate::memory::{MemoryStore, SessionManager};
    use crate::router::{ActionRouter, EndpointConfig, SimulatedTransport};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// App state backed by an in-memory store and an always-succeeding
    /// transport. The temp dir holds the downstream log files.
    pub fn test_state() -> (Arc<AppState>, TempDir) {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MemoryStore::open_in_memory().unwrap());
        let endpoints = EndpointConfig::defaults()
            .into_iter()
            .map(|(k, mut v)| {
                v.success_rate = 1.0;
                (k, v)
            })
            .collect();
        let router = ActionRouter::with_transport(
            Arc::new(SimulatedTransport::new(false)),
            endpoints,
            Some(Arc::clone(&memory)),
        );
        let pipeline = Pipeline::new(
            Classifier::default(),
            AgentRegistry::default(),
            router,
            Some(memory),
            Arc::new(SessionManager::new(100, 3600)),
        );

        let mut config = Config::default();
        config.server.log_dir = dir.path().join("logs").display().to_string();
        config.server.max_upload_bytes = 64 * 1024;
        (Arc::new(AppState::new(Arc::new(pipeline), &config)), dir)
    }

    pub async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn post_json(state: &Arc<AppState>, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(state, request).await
    }

    pub async fn get_json(state: &Arc<AppState>, uri: &str) -> (StatusCode, Value) {
        send(state, Request::get(uri).body(Body::empty()).unwrap()).await
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _dir) = test_state();
        let (status, body) = get_json(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (state, _dir) = test_state();
        let (status, _) = get_json(&state, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
