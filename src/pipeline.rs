//! End-to-end processing of one document.
//!
//! classify -> extract -> record -> route, with every stage traced in the
//! memory store and the work tracked in a session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AgentRegistry, Classifier};
use crate::config::Config;
use crate::memory::sessions::{CreateSession, StoreAgentResult};
use crate::memory::store::{NewClassification, NewExtraction};
use crate::memory::trace_log::TraceEntry;
use crate::memory::{MemoryStore, SessionManager, SessionStatus, StoreError, TraceLog};
use crate::models::{
    AgentOutput, Classification, DocumentFormat, DocumentInput, Fields, ProcessingStatus,
};
use crate::router::{ActionRouter, RouteResult};

/// Everything known about one processed document.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub process_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub classification: Classification,
    pub result: AgentOutput,
    pub actions: RouteResult,
    pub agent_trace: Value,
    pub debug: Fields,
}

/// Ids of the records written for one process.
struct Recorded {
    classification_id: String,
    extraction_id: String,
}

pub struct Pipeline {
    classifier: Classifier,
    agents: AgentRegistry,
    router: ActionRouter,
    memory: Option<Arc<MemoryStore>>,
    sessions: Arc<SessionManager>,
    trace_log: Option<TraceLog>,
}

impl Pipeline {
    pub fn new(
        classifier: Classifier,
        agents: AgentRegistry,
        router: ActionRouter,
        memory: Option<Arc<MemoryStore>>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            classifier,
            agents,
            router,
            memory,
            sessions,
            trace_log: None,
        }
    }

    pub fn with_trace_log(mut self, trace_log: TraceLog) -> Self {
        self.trace_log = Some(trace_log);
        self
    }

    /// Build every component from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let classifier =
            Classifier::from_config(config).context("Failed to set up the classifier")?;
        let memory = Arc::new(
            MemoryStore::open(&config.memory.db_path).with_context(|| {
                format!("Failed to open memory store: {}", config.memory.db_path)
            })?,
        );
        let router = ActionRouter::new(&config.router, Some(Arc::clone(&memory)));
        let sessions = Arc::new(SessionManager::from_config(&config.memory));

        let pipeline = Self::new(
            classifier,
            AgentRegistry::default(),
            router,
            Some(memory),
            sessions,
        );
        Ok(match &config.memory.trace_log {
            Some(path) => pipeline.with_trace_log(TraceLog::new(path)),
            None => pipeline,
        })
    }

    pub fn memory(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn router(&self) -> &ActionRouter {
        &self.router
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub async fn process(&self, input: DocumentInput) -> ProcessResponse {
        let process_id = Uuid::new_v4().to_string();
        let source = input.source_label();
        let mut debug_info = Fields::new();
        debug_info.insert("source".into(), json!(source));
        debug_info.insert("size".into(), json!(input.size()));
        if let Some(ref content_type) = input.content_type {
            debug_info.insert("content_type".into(), json!(content_type));
        }
        if let Some(ext) = input.extension() {
            debug_info.insert("extension".into(), json!(ext));
        }

        let session_id = self.open_session(&source, &input, &mut debug_info);

        // 1. classify
        let started = Instant::now();
        let doc = self.classifier.extract(&input).await;
        let mut classification = self.classifier.classify(&doc).await;
        let classify_time = started.elapsed();
        debug!(
            process_id = %process_id,
            format = %classification.format,
            intent = %classification.intent,
            "Classified document"
        );

        // 2. extract
        let started = Instant::now();
        let agent = self.agents.get(classification.format);
        let result = match &agent {
            Some(agent) => {
                classification.routed_agent = Some(agent.name().to_string());
                agent.process(&doc)
            }
            None => self.unsupported(classification.format),
        };
        let extract_time = started.elapsed();
        let agent_name = agent
            .as_ref()
            .map(|a| a.name())
            .unwrap_or("none")
            .to_string();

        // 3. record and route
        let recorded = match self.record(&source, &classification, &agent_name, &result) {
            Ok(recorded) => recorded,
            Err(e) => {
                warn!(process_id = %process_id, error = %e, "Failed to record process");
                debug_info.insert("memory_log_error".into(), json!(e.to_string()));
                None
            }
        };

        let started = Instant::now();
        let actions = self
            .router
            .route(&result, recorded.as_ref().map(|r| r.extraction_id.as_str()))
            .await;
        let route_time = started.elapsed();

        if let Some(ref ids) = recorded {
            debug_info.insert("classification_id".into(), json!(ids.classification_id));
            debug_info.insert("extraction_id".into(), json!(ids.extraction_id));
            if let Err(e) = self.trace(
                &process_id,
                ids,
                &actions,
                [classify_time, extract_time, route_time],
            ) {
                warn!(process_id = %process_id, error = %e, "Failed to record traces");
                debug_info.insert("memory_log_error".into(), json!(e.to_string()));
            }
        }

        debug_info.insert(
            "timings_ms".into(),
            json!({
                "classify": millis(classify_time),
                "extract": millis(extract_time),
                "route": millis(route_time),
            }),
        );

        // 4. session bookkeeping
        if let Some(ref id) = session_id {
            self.close_session(id, &classification, &agent_name, &result, extract_time);
        }

        let agent_trace = json!({
            "classification": classification,
            "agent_result": result,
            "actions": actions,
        });

        // 5. trace log
        if let Some(ref log) = self.trace_log {
            let actions_json = json!(actions.actions_taken);
            let entry = TraceEntry::new(
                &source,
                &classification,
                &result.fields,
                &actions_json,
                &agent_trace,
            );
            if let Err(e) = log.append(&entry) {
                warn!(path = %log.path().display(), error = %e, "Failed to append trace log");
            }
        }

        info!(
            process_id = %process_id,
            source = %source,
            format = %classification.format,
            status = ?actions.status,
            "Processed document"
        );

        ProcessResponse {
            process_id,
            session_id,
            classification,
            result,
            actions,
            agent_trace,
            debug: debug_info,
        }
    }

    fn unsupported(&self, format: DocumentFormat) -> AgentOutput {
        let mut output = AgentOutput::failed(format, format!("Unsupported format: {}", format));
        output
            .fields
            .insert("available_formats".into(), json!(self.agents.available_formats()));
        output.set_text_excerpt("Unsupported format");
        output
    }

    fn open_session(
        &self,
        source: &str,
        input: &DocumentInput,
        debug_info: &mut Fields,
    ) -> Option<String> {
        let mut input_data = Fields::new();
        input_data.insert("source".into(), json!(source));
        input_data.insert("size".into(), json!(input.size()));
        let id = self
            .sessions
            .create(CreateSession {
                input_data,
                ..Default::default()
            })
            .and_then(|id| {
                self.sessions.set_status(&id, SessionStatus::Processing)?;
                Ok(id)
            });
        match id {
            Ok(id) => Some(id),
            Err(e) => {
                debug_info.insert("session_error".into(), json!(e.to_string()));
                None
            }
        }
    }

    fn close_session(
        &self,
        session_id: &str,
        classification: &Classification,
        agent_name: &str,
        result: &AgentOutput,
        extract_time: Duration,
    ) {
        let classified = StoreAgentResult::success(
            "classifier_agent",
            json!(classification),
            0.0,
        );
        let extracted = StoreAgentResult::success(
            agent_name,
            json!(result),
            extract_time.as_secs_f64(),
        );
        let status = if result.status == ProcessingStatus::Error {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };
        let outcome = self
            .sessions
            .store_agent_result(session_id, classified)
            .and_then(|_| self.sessions.store_agent_result(session_id, extracted))
            .and_then(|_| self.sessions.set_status(session_id, status));
        if let Err(e) = outcome {
            warn!(session_id, error = %e, "Failed to update session");
        }
    }

    fn record(
        &self,
        source: &str,
        classification: &Classification,
        agent_name: &str,
        result: &AgentOutput,
    ) -> Result<Option<Recorded>, StoreError> {
        let Some(ref memory) = self.memory else {
            return Ok(None);
        };
        let format = classification.format.label();
        let classification_id = memory.log_classification(&NewClassification {
            format,
            intent: classification.intent.label(),
            confidence: Some(classification.confidence),
            source: Some(source),
            metadata: Some(&classification.metadata),
            summary: Some(&classification.text_excerpt),
        })?;
        let extraction_id = memory.log_extraction(&NewExtraction {
            classification_id: Some(&classification_id),
            format,
            agent: agent_name,
            fields: Some(&result.fields),
            valid: result.valid,
            anomalies: &result.anomalies,
            summary: Some(result.text_excerpt()),
        })?;
        Ok(Some(Recorded {
            classification_id,
            extraction_id,
        }))
    }

    fn trace(
        &self,
        process_id: &str,
        ids: &Recorded,
        actions: &RouteResult,
        [classify, extract, route]: [Duration; 3],
    ) -> Result<(), StoreError> {
        let Some(ref memory) = self.memory else {
            return Ok(());
        };
        memory.log_trace(
            process_id,
            "classify",
            Some(&json!({"classification_id": ids.classification_id})),
            Some(millis(classify)),
        )?;
        memory.log_trace(
            process_id,
            "extract",
            Some(&json!({"extraction_id": ids.extraction_id})),
            Some(millis(extract)),
        )?;
        memory.log_trace(
            process_id,
            "route",
            Some(&json!({
                "status": actions.status,
                "actions": actions.actions_taken.len(),
            })),
            Some(millis(route)),
        )?;
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{EndpointConfig, SimulatedTransport};
    use tempfile::TempDir;

    fn pipeline() -> Pipeline {
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
        Pipeline::new(
            Classifier::default(),
            AgentRegistry::default(),
            router,
            Some(memory),
            Arc::new(SessionManager::new(100, 3600)),
        )
    }

    fn invoice_webhook() -> Value {
        json!({
            "event_type": "invoice",
            "timestamp": "2024-03-01T10:00:00Z",
            "source": "erp",
            "version": "1.0",
            "payload": {
                "invoice_id": "INV-1",
                "customer_id": "C1",
                "amount": 120.5,
                "date_issued": "2024-03-01",
                "items": [
                    {"item_id": "SKU-9", "quantity": 2, "price": 60.25, "description": "Widget"}
                ]
            }
        })
    }

    #[tokio::test]
    async fn test_json_webhook_end_to_end() {
        let pipeline = pipeline();
        let response = pipeline.process(DocumentInput::from_json(invoice_webhook())).await;

        assert_eq!(response.classification.format, DocumentFormat::Json);
        assert_eq!(
            response.classification.routed_agent.as_deref(),
            Some("json_agent")
        );
        assert_eq!(response.result.format, DocumentFormat::Json);
        assert!(response.result.valid, "{:?}", response.result.anomalies);
        assert_eq!(
            response.actions.actions_taken[0].endpoint,
            "/webhooks/invoice/process"
        );
        assert!(response.debug.contains_key("extraction_id"));
        assert!(!response.debug.contains_key("memory_log_error"));

        let memory = pipeline.memory().unwrap();
        let history = memory.get_process_history(&response.process_id).unwrap();
        let stages: Vec<&str> = history.traces.iter().map(|t| t.stage.as_str()).collect();
        assert_eq!(stages, vec!["classify", "extract", "route"]);
        assert_eq!(history.classifications.len(), 1);
        assert_eq!(history.extractions[0].agent, "json_agent");
        assert_eq!(history.actions.len(), response.actions.actions_taken.len());

        let session_id = response.session_id.unwrap();
        let session = pipeline.sessions().get(&session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.agent_results.contains_key("classifier_agent"));
        assert!(session.agent_results.contains_key("json_agent"));
    }

    #[tokio::test]
    async fn test_email_upload() {
        let pipeline = pipeline();
        let input = DocumentInput::from_bytes(
            Some("complaint.eml".into()),
            Some("message/rfc822".into()),
            b"From: a@b.com\nSubject: Broken order\n\nMy lawyer will sue you in court."
                .to_vec(),
        );
        let response = pipeline.process(input).await;
        assert_eq!(response.classification.format, DocumentFormat::Email);
        assert_eq!(response.result.fields["tone"], "threatening");
        let outcome = &response.actions.actions_taken[0];
        assert_eq!(outcome.endpoint, "/crm/escalate");
        assert_eq!(response.agent_trace["agent_result"]["format"], "Email");
    }

    #[tokio::test]
    async fn test_unsupported_format() {
        let pipeline = pipeline();
        let input = DocumentInput::from_bytes(Some("notes.bin".into()), None, vec![0, 1, 2]);
        let response = pipeline.process(input).await;

        assert_eq!(response.classification.format, DocumentFormat::Unknown);
        assert!(response.classification.routed_agent.is_none());
        assert_eq!(response.result.status, ProcessingStatus::Error);
        assert_eq!(
            response.result.error.as_deref(),
            Some("Unsupported format: Unknown")
        );
        assert_eq!(
            response.result.fields["available_formats"],
            json!(["Email", "PDF", "JSON", "Image"])
        );
        let session = pipeline
            .sessions()
            .get(response.session_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_trace_log_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.log");
        let pipeline = pipeline().with_trace_log(TraceLog::new(&path));
        pipeline.process(DocumentInput::from_json(invoice_webhook())).await;

        let text = std::fs::read_to_string(&path).unwrap();
        let line: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(line["source"], "json_body");
        assert_eq!(line["classification"]["format"], "JSON");
    }

    #[tokio::test]
    async fn test_without_memory_store() {
        let mut pipeline = pipeline();
        pipeline.memory = None;
        let response = pipeline.process(DocumentInput::from_json(invoice_webhook())).await;
        assert!(!response.debug.contains_key("extraction_id"));
        assert!(!response.debug.contains_key("memory_log_error"));
    }
}
