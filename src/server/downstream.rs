//! Stand-in downstream systems: CRM, risk, alerting, logging and storage.
//!
//! Records live in process memory. Log entries are also appended to a daily
//! file under the configured log directory.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::display_value;

type Record = Map<String, Value>;

#[derive(Default)]
struct Collections {
    crm_escalations: Vec<Record>,
    risk_alerts: Vec<Record>,
    alerts: Vec<Record>,
    logs: Vec<Record>,
    storage: BTreeMap<String, Vec<Record>>,
}

/// In-memory records of the downstream systems.
pub struct DownstreamStore {
    inner: Mutex<Collections>,
    log_dir: PathBuf,
}

impl DownstreamStore {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Collections::default()),
            log_dir: log_dir.into(),
        }
    }

    fn append_log_file(&self, entry: &Record) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.log_dir)?;
        let path = self
            .log_dir
            .join(format!("app_{}.log", Utc::now().format("%Y%m%d")));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut line = Value::Object(entry.clone()).to_string();
        line.push('\n');
        file.write_all(line.as_bytes())
    }
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/crm_escalate/", post(crm_escalate))
        .route("/risk_alert/", post(risk_alert))
        .route("/alerts/", post(send_alert))
        .route("/log/", post(create_log))
        .route("/store/", post(store_data))
}

fn require(payload: &Record, fields: &[&str]) -> ApiResult<()> {
    match fields.iter().find(|f| !payload.contains_key(**f)) {
        Some(missing) => Err(ApiError::missing_field(missing)),
        None => Ok(()),
    }
}

fn object(payload: Value) -> ApiResult<Record> {
    match payload {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::bad_request("Request body must be a JSON object")),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// `{id, timestamp, status}` followed by the payload fields.
fn record(id: &str, status: Option<&str>, payload: &Record) -> Record {
    let mut record = Record::new();
    record.insert("id".into(), json!(id));
    record.insert("timestamp".into(), json!(now()));
    if let Some(status) = status {
        record.insert("status".into(), json!(status));
    }
    for (k, v) in payload {
        record.entry(k.clone()).or_insert_with(|| v.clone());
    }
    record
}

fn log_event(fields: Value) -> Record {
    let mut entry = Record::new();
    entry.insert("timestamp".into(), json!(now()));
    if let Value::Object(fields) = fields {
        entry.extend(fields);
    }
    entry
}

async fn crm_escalate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let payload = object(payload)?;
    require(&payload, &["invoice_id", "customer_name", "reason"])?;

    let mut store = state.downstream.inner.lock();
    let id = format!("crm_{}", store.crm_escalations.len() + 1);
    store
        .crm_escalations
        .push(record(&id, Some("pending"), &payload));
    store.logs.push(log_event(json!({
        "action": "crm_escalation_created",
        "escalation_id": id,
        "details": format!("Escalated to CRM: {}", display_value(&payload["reason"])),
    })));

    Ok(Json(json!({
        "status": "success",
        "message": "Issue escalated to CRM",
        "escalation_id": id,
    })))
}

async fn risk_alert(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let payload = object(payload)?;
    require(&payload, &["alert_type", "severity", "description"])?;

    let mut store = state.downstream.inner.lock();
    let id = format!("risk_{}", store.risk_alerts.len() + 1);
    store.risk_alerts.push(record(&id, Some("open"), &payload));
    store.logs.push(log_event(json!({
        "action": "risk_alert_created",
        "alert_id": id,
        "severity": payload["severity"],
        "description": payload["description"],
    })));

    Ok(Json(json!({
        "status": "success",
        "message": "Risk alert created",
        "alert_id": id,
    })))
}

async fn send_alert(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let payload = object(payload)?;
    require(&payload, &["type", "message", "recipients"])?;

    let mut store = state.downstream.inner.lock();
    let id = format!("alert_{}", store.alerts.len() + 1);
    store.alerts.push(record(&id, Some("sent"), &payload));
    store.logs.push(log_event(json!({
        "action": "alert_sent",
        "alert_id": id,
        "type": payload["type"],
        "recipients": payload["recipients"],
    })));

    Ok(Json(json!({
        "status": "success",
        "message": "Alert sent successfully",
        "alert_id": id,
    })))
}

async fn create_log(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let payload = object(payload)?;
    require(&payload, &["level", "message"])?;

    let entry = {
        let mut store = state.downstream.inner.lock();
        // shares the counter with the events the other endpoints log
        let id = format!("log_{}", store.logs.len() + 1);
        let entry = record(&id, None, &payload);
        store.logs.push(entry.clone());
        entry
    };

    if let Err(e) = state.downstream.append_log_file(&entry) {
        warn!(error = %e, "Failed to write log file");
        return Err(ApiError::Internal(format!("Failed to write log file: {}", e)));
    }

    Ok(Json(json!({
        "status": "success",
        "message": "Log entry created",
        "log_id": entry["id"],
    })))
}

async fn store_data(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let payload = object(payload)?;
    require(&payload, &["collection", "data"])?;

    let collection = display_value(&payload["collection"]);
    let timestamp = now();

    let mut store = state.downstream.inner.lock();
    let records = store.storage.entry(collection.clone()).or_default();
    let id = format!("{}_{}", collection, records.len() + 1);

    let mut record = Record::new();
    record.insert("id".into(), json!(id));
    record.insert("created_at".into(), json!(timestamp));
    record.insert("updated_at".into(), json!(timestamp));
    record.insert("data".into(), payload["data"].clone());
    record.insert(
        "metadata".into(),
        payload.get("metadata").cloned().unwrap_or_else(|| json!({})),
    );
    records.push(record);

    store.logs.push(log_event(json!({
        "action": "data_stored",
        "collection": collection,
        "record_id": id,
    })));

    Ok(Json(json!({
        "status": "success",
        "message": "Data stored successfully",
        "collection": collection,
        "id": id,
    })))
}
