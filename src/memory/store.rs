//! Persistent processing history backed by SQLite.
//!
//! Four tables record what happened to each document: its classification,
//! the extraction result, every routed action and a trace row per pipeline
//! stage. Traces carry the ids that tie the other records to a process.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Fields;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS classifications (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    format TEXT NOT NULL,
    intent TEXT NOT NULL,
    confidence REAL,
    source TEXT,
    metadata TEXT,
    summary TEXT
);
CREATE TABLE IF NOT EXISTS extractions (
    id TEXT PRIMARY KEY,
    classification_id TEXT,
    timestamp TEXT NOT NULL,
    format TEXT NOT NULL,
    agent TEXT NOT NULL,
    fields TEXT,
    valid BOOLEAN,
    anomalies TEXT,
    summary TEXT,
    FOREIGN KEY (classification_id) REFERENCES classifications(id)
);
CREATE TABLE IF NOT EXISTS actions (
    id TEXT PRIMARY KEY,
    extraction_id TEXT,
    timestamp TEXT NOT NULL,
    action_type TEXT NOT NULL,
    target TEXT,
    priority TEXT,
    endpoint TEXT,
    status TEXT NOT NULL,
    attempts INTEGER,
    data TEXT,
    result TEXT,
    FOREIGN KEY (extraction_id) REFERENCES extractions(id)
);
CREATE TABLE IF NOT EXISTS traces (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    process_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    details TEXT,
    duration_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_traces_process ON traces(process_id);
CREATE INDEX IF NOT EXISTS idx_actions_extraction ON actions(extraction_id);
";

/// A classification to record.
#[derive(Debug, Clone, Default)]
pub struct NewClassification<'a> {
    pub format: &'a str,
    pub intent: &'a str,
    pub confidence: Option<f64>,
    pub source: Option<&'a str>,
    pub metadata: Option<&'a Fields>,
    pub summary: Option<&'a str>,
}

/// An extraction result to record.
#[derive(Debug, Clone)]
pub struct NewExtraction<'a> {
    pub classification_id: Option<&'a str>,
    pub format: &'a str,
    pub agent: &'a str,
    pub fields: Option<&'a Fields>,
    pub valid: bool,
    pub anomalies: &'a [String],
    pub summary: Option<&'a str>,
}

/// A routed action to record.
#[derive(Debug, Clone)]
pub struct NewAction<'a> {
    pub extraction_id: Option<&'a str>,
    pub action_type: &'a str,
    pub target: Option<&'a str>,
    pub priority: Option<&'a str>,
    pub endpoint: Option<&'a str>,
    pub status: &'a str,
    pub attempts: u32,
    pub data: Option<&'a Value>,
    pub result: Option<&'a str>,
}

impl<'a> NewAction<'a> {
    pub fn new(action_type: &'a str, status: &'a str) -> Self {
        Self {
            extraction_id: None,
            action_type,
            target: None,
            priority: None,
            endpoint: None,
            status,
            attempts: 1,
            data: None,
            result: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationRecord {
    pub id: String,
    pub timestamp: String,
    pub format: String,
    pub intent: String,
    pub confidence: Option<f64>,
    pub source: Option<String>,
    pub metadata: Option<Value>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRecord {
    pub id: String,
    pub classification_id: Option<String>,
    pub timestamp: String,
    pub format: String,
    pub agent: String,
    pub fields: Option<Value>,
    pub valid: Option<bool>,
    pub anomalies: Option<Value>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub id: String,
    pub extraction_id: Option<String>,
    pub timestamp: String,
    pub action_type: String,
    pub target: Option<String>,
    pub priority: Option<String>,
    pub endpoint: Option<String>,
    pub status: String,
    pub attempts: Option<i64>,
    pub data: Option<Value>,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    pub id: String,
    pub timestamp: String,
    pub process_id: String,
    pub stage: String,
    pub details: Option<Value>,
    pub duration_ms: Option<i64>,
}

/// Everything recorded for one process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessHistory {
    pub process_id: String,
    pub traces: Vec<TraceRecord>,
    pub classifications: Vec<ClassificationRecord>,
    pub extractions: Vec<ExtractionRecord>,
    pub actions: Vec<ActionRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub process_id: String,
    pub start_time: String,
    pub end_time: String,
    /// Trace count per stage.
    pub stages: BTreeMap<String, i64>,
    pub format: Option<String>,
}

/// One search match. Only the columns of its record type are present.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub record_type: &'static str,
    pub id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl SearchHit {
    fn new(record_type: &'static str, id: String, timestamp: String) -> Self {
        Self {
            record_type,
            id,
            timestamp,
            format: None,
            intent: None,
            agent: None,
            action_type: None,
            target: None,
            summary: None,
            result: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub classification_count: i64,
    pub extraction_count: i64,
    pub action_count: i64,
    pub trace_count: i64,
    pub formats: BTreeMap<String, i64>,
    pub intents: BTreeMap<String, i64>,
    pub action_status: BTreeMap<String, i64>,
    pub db_size_bytes: i64,
}

/// SQLite-backed record of classifications, extractions, actions and traces.
pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn log_classification(&self, record: &NewClassification<'_>) -> Result<String> {
        let id = new_id();
        let metadata = record.metadata.map(serde_json::to_string).transpose()?;
        self.conn.lock().execute(
            "INSERT INTO classifications
             (id, timestamp, format, intent, confidence, source, metadata, summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                now(),
                record.format,
                record.intent,
                record.confidence,
                record.source,
                metadata,
                record.summary
            ],
        )?;
        Ok(id)
    }

    pub fn log_extraction(&self, record: &NewExtraction<'_>) -> Result<String> {
        let id = new_id();
        let fields = record.fields.map(serde_json::to_string).transpose()?;
        let anomalies = if record.anomalies.is_empty() {
            None
        } else {
            Some(serde_json::to_string(record.anomalies)?)
        };
        self.conn.lock().execute(
            "INSERT INTO extractions
             (id, classification_id, timestamp, format, agent, fields, valid, anomalies, summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                record.classification_id,
                now(),
                record.format,
                record.agent,
                fields,
                record.valid,
                anomalies,
                record.summary
            ],
        )?;
        Ok(id)
    }

    pub fn log_action(&self, record: &NewAction<'_>) -> Result<String> {
        let id = new_id();
        let data = record.data.map(serde_json::to_string).transpose()?;
        self.conn.lock().execute(
            "INSERT INTO actions
             (id, extraction_id, timestamp, action_type, target, priority, endpoint,
              status, attempts, data, result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                record.extraction_id,
                now(),
                record.action_type,
                record.target,
                record.priority,
                record.endpoint,
                record.status,
                record.attempts,
                data,
                record.result
            ],
        )?;
        Ok(id)
    }

    /// Record one pipeline stage of `process_id`.
    pub fn log_trace(
        &self,
        process_id: &str,
        stage: &str,
        details: Option<&Value>,
        duration_ms: Option<u64>,
    ) -> Result<String> {
        let id = new_id();
        let details = details.map(serde_json::to_string).transpose()?;
        let duration_ms = duration_ms.map(|d| d.min(i64::MAX as u64) as i64);
        self.conn.lock().execute(
            "INSERT INTO traces (id, timestamp, process_id, stage, details, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, now(), process_id, stage, details, duration_ms],
        )?;
        Ok(id)
    }

    /// Traces of a process in time order, plus the records their details
    /// point at. Actions are found through the extraction ids.
    pub fn get_process_history(&self, process_id: &str) -> Result<ProcessHistory> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, process_id, stage, details, duration_ms
             FROM traces WHERE process_id = ?1 ORDER BY timestamp",
        )?;
        let traces = stmt
            .query_map(params![process_id], trace_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut classification_ids = Vec::new();
        let mut extraction_ids = Vec::new();
        for trace in &traces {
            let Some(details) = trace.details.as_ref() else {
                continue;
            };
            if let Some(id) = details.get("classification_id").and_then(Value::as_str) {
                classification_ids.push(id.to_string());
            }
            if let Some(id) = details.get("extraction_id").and_then(Value::as_str) {
                extraction_ids.push(id.to_string());
            }
        }

        let mut classifications = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, format, intent, confidence, source, metadata, summary
             FROM classifications WHERE id = ?1",
        )?;
        for id in &classification_ids {
            if let Some(record) = stmt
                .query_row(params![id], classification_from_row)
                .optional()?
            {
                classifications.push(record);
            }
        }

        let mut extractions = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT id, classification_id, timestamp, format, agent, fields, valid, anomalies, summary
             FROM extractions WHERE id = ?1",
        )?;
        for id in &extraction_ids {
            if let Some(record) = stmt.query_row(params![id], extraction_from_row).optional()? {
                extractions.push(record);
            }
        }

        let mut actions = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT id, extraction_id, timestamp, action_type, target, priority, endpoint,
                    status, attempts, data, result
             FROM actions WHERE extraction_id = ?1 ORDER BY timestamp",
        )?;
        for id in &extraction_ids {
            let rows = stmt
                .query_map(params![id], action_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            actions.extend(rows);
        }

        Ok(ProcessHistory {
            process_id: process_id.to_string(),
            traces,
            classifications,
            extractions,
            actions,
        })
    }

    /// Most recently started processes first.
    pub fn get_recent_processes(&self, limit: usize) -> Result<Vec<ProcessSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT process_id, MIN(timestamp) AS start_time, MAX(timestamp) AS end_time
             FROM traces GROUP BY process_id ORDER BY start_time DESC LIMIT ?1",
        )?;
        let heads = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stage_stmt = conn.prepare(
            "SELECT stage, COUNT(*) FROM traces WHERE process_id = ?1 GROUP BY stage",
        )?;
        let mut format_stmt = conn.prepare(
            "SELECT c.format FROM classifications c
             JOIN traces t ON json_extract(t.details, '$.classification_id') = c.id
             WHERE t.process_id = ?1 LIMIT 1",
        )?;

        let mut processes = Vec::with_capacity(heads.len());
        for (process_id, start_time, end_time) in heads {
            let stages = stage_stmt
                .query_map(params![process_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<std::result::Result<BTreeMap<String, i64>, _>>()?;
            let format = format_stmt
                .query_row(params![process_id], |row| row.get(0))
                .optional()?;
            processes.push(ProcessSummary {
                process_id,
                start_time,
                end_time,
                stages,
                format,
            });
        }
        Ok(processes)
    }

    /// Substring search over summaries, metadata, fields, results and action
    /// data. Newest matches first.
    pub fn search_by_content(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let pattern = format!("%{}%", escape_like(query));
        let limit_sql = limit as i64;
        let conn = self.conn.lock();

        let mut hits = Vec::new();

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, format, intent, summary FROM classifications
             WHERE summary LIKE ?1 ESCAPE '\\' OR intent LIKE ?1 ESCAPE '\\'
                OR metadata LIKE ?1 ESCAPE '\\' LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, limit_sql], |row| {
            let mut hit = SearchHit::new("classification", row.get(0)?, row.get(1)?);
            hit.format = row.get(2)?;
            hit.intent = row.get(3)?;
            hit.summary = row.get(4)?;
            Ok(hit)
        })?;
        for hit in rows {
            hits.push(hit?);
        }

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, format, agent, summary FROM extractions
             WHERE summary LIKE ?1 ESCAPE '\\' OR fields LIKE ?1 ESCAPE '\\' LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, limit_sql], |row| {
            let mut hit = SearchHit::new("extraction", row.get(0)?, row.get(1)?);
            hit.format = row.get(2)?;
            hit.agent = row.get(3)?;
            hit.summary = row.get(4)?;
            Ok(hit)
        })?;
        for hit in rows {
            hits.push(hit?);
        }

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, action_type, target, result FROM actions
             WHERE result LIKE ?1 ESCAPE '\\' OR data LIKE ?1 ESCAPE '\\' LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, limit_sql], |row| {
            let mut hit = SearchHit::new("action", row.get(0)?, row.get(1)?);
            hit.action_type = row.get(2)?;
            hit.target = row.get(3)?;
            hit.result = row.get(4)?;
            Ok(hit)
        })?;
        for hit in rows {
            hits.push(hit?);
        }

        hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        hits.truncate(limit);
        Ok(hits)
    }

    pub fn get_stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let count = |table: &str| -> rusqlite::Result<i64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
        };
        let group = |sql: &str| -> rusqlite::Result<BTreeMap<String, i64>> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect()
        };

        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(StoreStats {
            classification_count: count("classifications")?,
            extraction_count: count("extractions")?,
            action_count: count("actions")?,
            trace_count: count("traces")?,
            formats: group("SELECT format, COUNT(*) FROM classifications GROUP BY format")?,
            intents: group("SELECT intent, COUNT(*) FROM classifications GROUP BY intent")?,
            action_status: group("SELECT status, COUNT(*) FROM actions GROUP BY status")?,
            db_size_bytes: page_count * page_size,
        })
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// UTC with microseconds, so timestamps sort as text.
fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a JSON text column, keeping unparsable text as a string.
fn json_column(raw: Option<String>) -> Option<Value> {
    raw.map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

fn trace_from_row(row: &Row<'_>) -> rusqlite::Result<TraceRecord> {
    Ok(TraceRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        process_id: row.get(2)?,
        stage: row.get(3)?,
        details: json_column(row.get(4)?),
        duration_ms: row.get(5)?,
    })
}

fn classification_from_row(row: &Row<'_>) -> rusqlite::Result<ClassificationRecord> {
    Ok(ClassificationRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        format: row.get(2)?,
        intent: row.get(3)?,
        confidence: row.get(4)?,
        source: row.get(5)?,
        metadata: json_column(row.get(6)?),
        summary: row.get(7)?,
    })
}

fn extraction_from_row(row: &Row<'_>) -> rusqlite::Result<ExtractionRecord> {
    Ok(ExtractionRecord {
        id: row.get(0)?,
        classification_id: row.get(1)?,
        timestamp: row.get(2)?,
        format: row.get(3)?,
        agent: row.get(4)?,
        fields: json_column(row.get(5)?),
        valid: row.get(6)?,
        anomalies: json_column(row.get(7)?),
        summary: row.get(8)?,
    })
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<ActionRecord> {
    Ok(ActionRecord {
        id: row.get(0)?,
        extraction_id: row.get(1)?,
        timestamp: row.get(2)?,
        action_type: row.get(3)?,
        target: row.get(4)?,
        priority: row.get(5)?,
        endpoint: row.get(6)?,
        status: row.get(7)?,
        attempts: row.get(8)?,
        data: json_column(row.get(9)?),
        result: row.get(10)?,
    })
}

/// Escape `LIKE` wildcards so the query matches literally.
fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
