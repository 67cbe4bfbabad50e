//! Route handlers for intake, memory, actions and sessions.

use std::sync::Arc;

use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::AppState;
use crate::agent::upload_hint;
use crate::error::{ApiError, ApiResult};
use crate::memory::sessions::{
    AgentResult, CreateSession, Session, SessionMetrics, SessionSummary, SessionUpdate,
    StoreAgentResult,
};
use crate::memory::store::{ProcessHistory, ProcessSummary, SearchHit, StoreStats};
use crate::memory::MemoryStore;
use crate::models::{AgentOutput, DocumentInput};
use crate::pipeline::ProcessResponse;
use crate::router::{BatchResult, RouteResult};

const DEFAULT_LIMIT: usize = 10;
const DEFAULT_SESSION_LIMIT: usize = 100;

// ── Intake ─────────────────────────────────────────────────────────────

/// Accepts a multipart upload (`file` field) or a raw JSON body.
pub async fn process_input(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> ApiResult<Json<ProcessResponse>> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let input = match content_type.as_deref() {
        Some(ct) if ct.starts_with("multipart/form-data") => {
            let multipart = Multipart::from_request(request, &state)
                .await
                .map_err(|e| ApiError::BadRequest {
                    error: "Invalid multipart body".to_string(),
                    detail: Some(e.body_text()),
                    debug: None,
                })?;
            read_upload(multipart).await?
        }
        _ => {
            let bytes = axum::body::to_bytes(request.into_body(), state.max_upload_bytes)
                .await
                .map_err(|_| ApiError::PayloadTooLarge(state.max_upload_bytes))?;
            let value: Value = serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest {
                error: "Invalid JSON body".to_string(),
                detail: Some(e.to_string()),
                debug: Some(json!({
                    "content_type": content_type,
                    "body_length": bytes.len(),
                })),
            })?;
            DocumentInput::from_json(value)
        }
    };

    debug!(source = %input.source_label(), size = input.size(), "Received document");
    Ok(Json(state.pipeline.process(input).await))
}

async fn read_upload(mut multipart: Multipart) -> ApiResult<DocumentInput> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest {
            error: "Invalid multipart body".to_string(),
            detail: Some(e.body_text()),
            debug: None,
        })?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|e| ApiError::BadRequest {
            error: "Failed to read uploaded file".to_string(),
            detail: Some(e.body_text()),
            debug: None,
        })?;

        let input = DocumentInput::from_bytes(filename, content_type, bytes.to_vec());
        let hint = upload_hint(&input);
        return Ok(input.with_source(hint));
    }
    Err(ApiError::bad_request("No file uploaded"))
}

// ── Memory store ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    q: String,
    limit: Option<usize>,
}

fn memory(state: &AppState) -> ApiResult<&Arc<MemoryStore>> {
    state.pipeline.memory().ok_or(ApiError::MemoryDisabled)
}

pub async fn recent_processes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Json<Vec<ProcessSummary>>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    Ok(Json(memory(&state)?.get_recent_processes(limit)?))
}

pub async fn process_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProcessHistory>> {
    let history = memory(&state)?.get_process_history(&id)?;
    if history.traces.is_empty() {
        return Err(ApiError::NotFound(format!("Process {} not found", id)));
    }
    Ok(Json(history))
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<SearchHit>>> {
    let query = params.q.trim();
    if query.is_empty() {
        return Err(ApiError::bad_request("Query must not be empty"));
    }
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    Ok(Json(memory(&state)?.search_by_content(query, limit)?))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<StoreStats>> {
    Ok(Json(memory(&state)?.get_stats()?))
}

// ── Actions ────────────────────────────────────────────────────────────

pub async fn route_action(
    State(state): State<Arc<AppState>>,
    Json(output): Json<AgentOutput>,
) -> Json<RouteResult> {
    Json(state.pipeline.router().route(&output, None).await)
}

pub async fn route_batch(
    State(state): State<Arc<AppState>>,
    Json(items): Json<Vec<Value>>,
) -> Json<BatchResult> {
    Json(state.pipeline.router().process_batch(&items).await)
}

// ── Sessions ───────────────────────────────────────────────────────────

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSession>,
) -> ApiResult<Json<Value>> {
    let session_id = state.pipeline.sessions().create(request)?;
    Ok(Json(json!({
        "session_id": session_id,
        "status": "created",
    })))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Json<Vec<SessionSummary>> {
    let limit = params.limit.unwrap_or(DEFAULT_SESSION_LIMIT);
    Json(state.pipeline.sessions().list(limit))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    state
        .pipeline
        .sessions()
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", id)))
}

pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<SessionUpdate>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.pipeline.sessions().update(&id, update)?))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.pipeline.sessions().delete(&id) {
        return Err(ApiError::NotFound(format!("Session {} not found", id)));
    }
    Ok(Json(json!({ "session_id": id, "deleted": true })))
}

pub async fn store_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<StoreAgentResult>,
) -> ApiResult<Json<Value>> {
    let agent_name = request.agent_name.clone();
    if let Err(e) = state.pipeline.sessions().store_agent_result(&id, request) {
        warn!(session_id = %id, agent = %agent_name, error = %e, "Rejected agent result");
        return Err(e.into());
    }
    Ok(Json(json!({
        "session_id": id,
        "agent_name": agent_name,
        "status": "stored",
    })))
}

pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Path((id, agent)): Path<(String, String)>,
) -> ApiResult<Json<AgentResult>> {
    Ok(Json(state.pipeline.sessions().get_agent_result(&id, &agent)?))
}

pub async fn session_metrics(State(state): State<Arc<AppState>>) -> Json<SessionMetrics> {
    Json(state.pipeline.sessions().metrics())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{get_json, post_json, send, test_state};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};

    fn invoice_webhook() -> Value {
        json!({
            "event_type": "invoice",
            "timestamp": "2024-03-01T10:00:00Z",
            "source": "erp",
            "version": "1.0",
            "payload": {
                "invoice_id": "INV-2024-001",
                "customer_id": "CUST-42",
                "amount": 1250.0,
                "date_issued": "2024-03-01",
                "items": [
                    {"item_id": "A1", "quantity": 2, "price": 625.0, "description": "Widget"}
                ]
            }
        })
    }

    fn multipart_body(filename: &str, content_type: &str, content: &str) -> (String, String) {
        let boundary = "invoiceflow-boundary";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\n\
             Content-Type: {ct}\r\n\r\n{c}\r\n--{b}--\r\n",
            b = boundary,
            f = filename,
            ct = content_type,
            c = content,
        );
        (format!("multipart/form-data; boundary={}", boundary), body)
    }

    #[tokio::test]
    async fn test_process_json_body() {
        let (state, _dir) = test_state();
        let (status, body) = post_json(&state, "/process_input/", invoice_webhook()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["classification"]["format"], "JSON");
        assert_eq!(body["result"]["valid"], true);
        assert!(body["process_id"].as_str().is_some());

        let process_id = body["process_id"].as_str().unwrap().to_string();
        let (status, history) = get_json(&state, &format!("/processes/{}", process_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["traces"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let (state, _dir) = test_state();
        let request = Request::post("/process_input/")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid JSON body");
        assert!(body["detail"].is_string());
        assert_eq!(body["debug"]["body_length"], 9);
    }

    #[tokio::test]
    async fn test_upload_email_file() {
        let (state, _dir) = test_state();
        let email = "From: Jane Buyer <jane@acme.io>\nSubject: Complaint about order\n\n\
                     I am unhappy with the damaged goods and want a refund immediately.";
        let (content_type, body) = multipart_body("message.txt", "text/plain", email);
        let request = Request::post("/process_input/")
            .header("content-type", content_type)
            .body(Body::from(body))
            .unwrap();
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["classification"]["format"], "Email");
        assert_eq!(body["classification"]["routed_agent"], "email_agent");
        assert_eq!(body["debug"]["source"], "message.txt");
    }

    #[tokio::test]
    async fn test_upload_without_file_field() {
        let (state, _dir) = test_state();
        let boundary = "b";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{b}--\r\n",
            b = boundary
        );
        let request = Request::post("/process_input/")
            .header("content-type", format!("multipart/form-data; boundary={}", boundary))
            .body(Body::from(body))
            .unwrap();
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file uploaded");
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (state, _dir) = test_state();
        let big = "x".repeat(state.max_upload_bytes + 1);
        let request = Request::post("/process_input/")
            .header("content-type", "application/json")
            .body(Body::from(big))
            .unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_recent_search_and_stats() {
        let (state, _dir) = test_state();
        post_json(&state, "/process_input/", invoice_webhook()).await;

        let (status, recent) = get_json(&state, "/processes?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(recent.as_array().unwrap().len(), 1);
        assert_eq!(recent[0]["format"], "JSON");

        let (status, hits) = get_json(&state, "/search?q=invoice").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!hits.as_array().unwrap().is_empty());

        let (status, stats) = get_json(&state, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["classification_count"], 1);
    }

    #[tokio::test]
    async fn test_unknown_process_is_404() {
        let (state, _dir) = test_state();
        let (status, _) = get_json(&state, "/processes/does-not-exist").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_route_batch() {
        let (state, _dir) = test_state();
        let items = json!([
            {"format": "JSON", "fields": {}, "valid": false, "anomalies": ["missing amount"]},
            "not an output"
        ]);
        let (status, body) = post_json(&state, "/actions/batch", items).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["actions"][1]["item_index"], 1);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (state, _dir) = test_state();
        let (status, created) = post_json(
            &state,
            "/sessions",
            json!({"input_data": {"source": "test"}, "metadata": {"team": "ap"}}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = created["session_id"].as_str().unwrap().to_string();

        let (status, _) = post_json(
            &state,
            &format!("/sessions/{}/results", id),
            json!({"agent_name": "pdf_agent", "result": {"total": 10}, "execution_time": 0.2}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, result) = get_json(&state, &format!("/sessions/{}/results/pdf_agent", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["result"]["total"], 10);

        let (status, _) = get_json(&state, &format!("/sessions/{}/results/email_agent", id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let patch = Request::builder()
            .method(Method::PATCH)
            .uri(format!("/sessions/{}", id))
            .header("content-type", "application/json")
            .body(Body::from(json!({"status": "completed"}).to_string()))
            .unwrap();
        let (status, session) = send(&state, patch).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["status"], "completed");

        let (_, metrics) = get_json(&state, "/memory/metrics").await;
        assert_eq!(metrics["total_sessions"], 1);

        let delete = Request::builder()
            .method(Method::DELETE)
            .uri(format!("/sessions/{}", id))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&state, delete).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get_json(&state, &format!("/sessions/{}", id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_agent_result_is_422() {
        let (state, _dir) = test_state();
        let (_, created) = post_json(&state, "/sessions", json!({})).await;
        let id = created["session_id"].as_str().unwrap();

        let (status, _) = post_json(
            &state,
            &format!("/sessions/{}/results", id),
            json!({"agent_name": "x", "result": {}, "status": "error"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
