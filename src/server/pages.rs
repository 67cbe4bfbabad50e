//! Dashboard, API reference and health check.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::Json;
use serde_json::{json, Value};

use super::AppState;

const DASHBOARD_HTML: &str = include_str!("../../static/dashboard.html");
const DOCS_HTML: &str = include_str!("../../static/docs.html");
const STYLE_CSS: &str = include_str!("../../static/style.css");

pub async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

pub async fn docs() -> Html<&'static str> {
    Html(DOCS_HTML)
}

pub async fn stylesheet() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], STYLE_CSS)
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "memory_store": state.pipeline.memory().is_some(),
        "agents": state.pipeline.agents().available_formats(),
    }))
}
