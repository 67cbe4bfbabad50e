//! Action routing.
//!
//! Turns the action an agent suggested into a request against the matching
//! downstream endpoint, delivers it with retries and records the outcome in
//! the memory store.

pub mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::RouterConfig;
use crate::memory::store::NewAction;
use crate::memory::MemoryStore;
use crate::models::{AgentOutput, Fields, Priority, SuggestedAction};

pub use transport::{
    ActionTransport, HttpTransport, SimulatedTransport, TransportError, TransportResponse,
};

/// Key of the fallback entry in the endpoint table.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Delivery settings of one downstream endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub base_url: String,
    /// Probability of success when simulating.
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: f64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_success_rate() -> f64 {
    0.9
}

fn default_timeout() -> f64 {
    1.0
}

fn default_retry_count() -> u32 {
    1
}

fn default_retry_delay() -> f64 {
    0.5
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            base_url: "https://api.example.com".to_string(),
            success_rate: default_success_rate(),
            timeout_seconds: default_timeout(),
            retry_count: default_retry_count(),
            retry_delay_seconds: default_retry_delay(),
        }
    }
}

impl EndpointConfig {
    fn entry(
        method: &str,
        base_url: &str,
        success_rate: f64,
        timeout_seconds: f64,
        retry_count: u32,
        retry_delay_seconds: f64,
    ) -> Self {
        Self {
            method: method.to_string(),
            base_url: base_url.to_string(),
            success_rate,
            timeout_seconds,
            retry_count,
            retry_delay_seconds,
        }
    }

    /// The built-in endpoint table, keyed by endpoint template.
    pub fn defaults() -> BTreeMap<String, EndpointConfig> {
        let api = "https://api.example.com";
        let risk = "https://risk.example.com";
        let alerts = "https://alerts.example.com";
        [
            ("/crm/escalate", Self::entry("POST", api, 0.95, 2.0, 3, 1.0)),
            ("/crm/ticket/create", Self::entry("POST", api, 0.98, 1.5, 2, 0.5)),
            ("/crm/contact/update", Self::entry("PUT", api, 0.97, 1.0, 2, 0.5)),
            ("/risk/escalate", Self::entry("POST", risk, 0.99, 1.0, 3, 0.5)),
            ("/risk/alert", Self::entry("POST", risk, 0.98, 1.0, 3, 0.5)),
            ("/alerts/data_quality", Self::entry("POST", alerts, 0.96, 1.0, 2, 0.5)),
            ("/alerts/send_email", Self::entry("POST", alerts, 0.95, 2.0, 3, 0.7)),
            (
                "/webhooks/{event_type}/process",
                Self::entry("POST", "https://webhooks.example.com", 0.93, 2.0, 2, 1.0),
            ),
            (DEFAULT_ENDPOINT, Self::entry("POST", api, 0.90, 1.0, 1, 0.5)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Success,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Success => "success",
            ActionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub format: String,
    pub tracking_id: String,
    pub fields: Fields,
}

/// Body sent to the downstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_type: String,
    pub target: String,
    pub priority: Priority,
    pub details: String,
    pub timestamp: String,
    pub context: RequestContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_manager: Option<bool>,
}

impl ActionRequest {
    fn new(action: &SuggestedAction, output: &AgentOutput) -> Self {
        let tracking_id = output
            .tracking_id
            .clone()
            .unwrap_or_else(|| format!("TR-{}", rand::thread_rng().gen_range(10000..=99999)));
        let escalates = action.priority.is_escalation();
        Self {
            action_type: action.action.clone(),
            target: action.target.clone(),
            priority: action.priority,
            details: action.details.clone(),
            timestamp: Utc::now().to_rfc3339(),
            context: RequestContext {
                format: output.format.label().to_string(),
                tracking_id,
                fields: output.fields_without_excerpt(),
            },
            escalation: escalates.then_some(true),
            notify_manager: escalates.then_some(action.priority == Priority::Critical),
        }
    }
}

/// Result of delivering one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action_type: String,
    pub target: String,
    pub endpoint: String,
    pub priority: Priority,
    pub timestamp: String,
    pub status: ActionStatus,
    pub attempts: u32,
    pub response: Option<TransportResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Pending,
    Success,
    PartiallyFailed,
    NoActionRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResult {
    pub status: RouteStatus,
    pub actions_taken: Vec<ActionOutcome>,
    pub timestamp: String,
}

impl RouteStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RouteStatus::Pending => "pending",
            RouteStatus::Success => "success",
            RouteStatus::PartiallyFailed => "partially_failed",
            RouteStatus::NoActionRequired => "no_action_required",
        }
    }
}

impl RouteResult {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.status,
            RouteStatus::Success | RouteStatus::NoActionRequired
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BatchItem {
    Routed(RouteResult),
    Error {
        status: &'static str,
        error: String,
        item_index: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    PartiallySuccessful,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub status: BatchStatus,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub actions: Vec<BatchItem>,
}

/// Routes agent outputs to downstream endpoints.
#[derive(Clone)]
pub struct ActionRouter {
    transport: Arc<dyn ActionTransport>,
    endpoints: BTreeMap<String, EndpointConfig>,
    memory: Option<Arc<MemoryStore>>,
}

impl ActionRouter {
    pub fn new(config: &RouterConfig, memory: Option<Arc<MemoryStore>>) -> Self {
        let transport: Arc<dyn ActionTransport> = if config.simulate {
            Arc::new(SimulatedTransport::new(config.simulated_latency))
        } else {
            Arc::new(HttpTransport::new())
        };
        Self::with_transport(transport, config.endpoints.clone(), memory)
    }

    pub fn with_transport(
        transport: Arc<dyn ActionTransport>,
        endpoints: BTreeMap<String, EndpointConfig>,
        memory: Option<Arc<MemoryStore>>,
    ) -> Self {
        Self {
            transport,
            endpoints,
            memory,
        }
    }

    /// Deliver the action carried by `output`. `extraction_id` links the
    /// recorded actions to the extraction that produced them.
    pub async fn route(&self, output: &AgentOutput, extraction_id: Option<&str>) -> RouteResult {
        let mut result = RouteResult {
            status: RouteStatus::Pending,
            actions_taken: Vec::new(),
            timestamp: Utc::now().to_rfc3339(),
        };

        let action = match resolve_action(output) {
            Some(action) => action,
            None => {
                result.status = RouteStatus::NoActionRequired;
                let mut record = NewAction::new("no_action", ActionStatus::Success.as_str());
                record.extraction_id = extraction_id;
                record.result = Some("No action required");
                self.remember(&record);
                return result;
            }
        };

        let outcome = self.deliver(&action, output, extraction_id).await;
        result.actions_taken.push(outcome);

        result.status = if result
            .actions_taken
            .iter()
            .any(|a| a.status == ActionStatus::Failed)
        {
            RouteStatus::PartiallyFailed
        } else {
            RouteStatus::Success
        };
        result
    }

    /// Route every item. Items that are not agent outputs are reported as
    /// errors and count as failed.
    pub async fn process_batch(&self, items: &[Value]) -> BatchResult {
        let mut batch = BatchResult {
            status: BatchStatus::Success,
            total: items.len(),
            successful: 0,
            failed: 0,
            actions: Vec::with_capacity(items.len()),
        };

        for (index, item) in items.iter().enumerate() {
            match serde_json::from_value::<AgentOutput>(item.clone()) {
                Ok(output) => {
                    let routed = self.route(&output, None).await;
                    if routed.succeeded() {
                        batch.successful += 1;
                    } else {
                        batch.failed += 1;
                    }
                    batch.actions.push(BatchItem::Routed(routed));
                }
                Err(e) => {
                    error!(index, error = %e, "Error processing batch item");
                    batch.failed += 1;
                    batch.actions.push(BatchItem::Error {
                        status: "error",
                        error: e.to_string(),
                        item_index: index,
                    });
                }
            }
        }

        if batch.failed > 0 {
            batch.status = if batch.successful > 0 {
                BatchStatus::PartiallySuccessful
            } else {
                BatchStatus::Failed
            };
        }
        batch
    }

    fn endpoint_config(&self, template: &str) -> EndpointConfig {
        self.endpoints
            .get(template)
            .or_else(|| self.endpoints.get(DEFAULT_ENDPOINT))
            .cloned()
            .unwrap_or_default()
    }

    /// Send `body` until it succeeds, fails for good or runs out of attempts.
    /// Returns the result text logged to the memory store.
    async fn send_with_retries(
        &self,
        endpoint: &str,
        config: &EndpointConfig,
        body: &Value,
        action: &SuggestedAction,
        outcome: &mut ActionOutcome,
    ) -> String {
        let max_attempts = config.retry_count + 1;
        let retry_delay = Duration::try_from_secs_f64(config.retry_delay_seconds).unwrap_or_default();

        loop {
            outcome.attempts += 1;
            let attempt = outcome.attempts;
            let last = attempt >= max_attempts;

            match self.transport.send(endpoint, config, body).await {
                Ok(response) if response.success => {
                    outcome.status = ActionStatus::Success;
                    outcome.response = Some(response);
                    break format!("Success: {}", action.details);
                }
                Ok(response) => {
                    warn!(
                        action = %action.action,
                        endpoint = %endpoint,
                        attempt,
                        max_attempts,
                        "Action failed"
                    );
                    let message = response
                        .error
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string());
                    outcome.response = Some(response);
                    if last {
                        outcome.status = ActionStatus::Failed;
                        break format!("Failed after {} attempts: {}", attempt, message);
                    }
                }
                Err(TransportError::Network(e)) => {
                    error!(action = %action.action, error = %e, "Network error in action");
                    if last {
                        outcome.status = ActionStatus::Failed;
                        outcome.response = Some(TransportResponse::rejected(None, e.clone()));
                        break format!("Network error after {} attempts: {}", attempt, e);
                    }
                }
                Err(TransportError::Unexpected(e)) => {
                    error!(action = %action.action, error = %e, "Unexpected error in action");
                    outcome.status = ActionStatus::Failed;
                    outcome.response = Some(TransportResponse::rejected(None, e.clone()));
                    break format!("Unexpected error: {}", e);
                }
            }

            if !retry_delay.is_zero() {
                tokio::time::sleep(retry_delay).await;
            }
        }
    }

    async fn deliver(
        &self,
        action: &SuggestedAction,
        output: &AgentOutput,
        extraction_id: Option<&str>,
    ) -> ActionOutcome {
        let endpoint = resolve_endpoint(&action.endpoint, &output.fields);
        let config = self.endpoint_config(&action.endpoint);
        let request = ActionRequest::new(action, output);
        let mut outcome = ActionOutcome {
            action_type: action.action.clone(),
            target: action.target.clone(),
            endpoint: endpoint.clone(),
            priority: action.priority,
            timestamp: Utc::now().to_rfc3339(),
            status: ActionStatus::Pending,
            attempts: 0,
            response: None,
        };

        let (body, final_result) = match serde_json::to_value(&request) {
            Ok(body) => {
                let result = self
                    .send_with_retries(&endpoint, &config, &body, action, &mut outcome)
                    .await;
                (Some(body), result)
            }
            Err(e) => (None, reject_unencodable(&mut outcome, &e)),
        };

        debug!(
            action = %outcome.action_type,
            endpoint = %outcome.endpoint,
            status = outcome.status.as_str(),
            attempts = outcome.attempts,
            "Action delivered"
        );

        let priority = action.priority.to_string();
        let mut record = NewAction::new(&action.action, outcome.status.as_str());
        record.extraction_id = extraction_id;
        record.target = Some(action.target.as_str());
        record.priority = Some(priority.as_str());
        record.endpoint = Some(endpoint.as_str());
        record.attempts = outcome.attempts;
        record.data = body.as_ref();
        record.result = Some(final_result.as_str());
        self.remember(&record);

        outcome
    }

    fn remember(&self, record: &NewAction<'_>) {
        if let Some(memory) = &self.memory {
            if let Err(e) = memory.log_action(record) {
                warn!(error = %e, "Failed to record action");
            }
        }
    }
}

/// The action to deliver: the suggested action, else the legacy label, else
/// a data-quality alert for invalid output.
fn resolve_action(output: &AgentOutput) -> Option<SuggestedAction> {
    if let Some(action) = &output.suggested_action {
        return Some(action.clone());
    }
    if let Some(label) = output.action.as_deref().filter(|l| !l.is_empty()) {
        return Some(SuggestedAction::new(
            label,
            "legacy",
            Priority::Normal,
            "Legacy action format",
            format!("/actions/{}", label),
        ));
    }
    if !output.valid {
        return Some(SuggestedAction::new(
            "alert",
            "data_quality",
            Priority::Medium,
            "Data validation failed",
            "/alerts/data_quality",
        ));
    }
    None
}

fn resolve_endpoint(template: &str, fields: &Fields) -> String {
    match fields.get("event_type").and_then(Value::as_str) {
        Some(event_type) if template.contains("{event_type}") => {
            template.replace("{event_type}", event_type)
        }
        _ => template.to_string(),
    }
}

/// Mark an action whose request body could not be encoded as failed without sending it.
fn reject_unencodable(outcome: &mut ActionOutcome, e: &serde_json::Error) -> String {
    error!(action = %outcome.action_type, error = %e, "Cannot encode action request");
    outcome.status = ActionStatus::Failed;
    outcome.response = Some(TransportResponse::rejected(
        None,
        format!("Failed to encode request: {}", e),
    ));
    format!("Unexpected error: Failed to encode request: {}", e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentFormat;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays scripted results and records the endpoints it was called with.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ActionTransport for ScriptedTransport {
        async fn send(
            &self,
            endpoint: &str,
            _config: &EndpointConfig,
            request: &Value,
        ) -> Result<TransportResponse, TransportError> {
            self.calls.lock().push((endpoint.to_string(), request.clone()));
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::ok(200, json!({}))))
        }
    }

    fn endpoints(retry_count: u32) -> BTreeMap<String, EndpointConfig> {
        EndpointConfig::defaults()
            .into_iter()
            .map(|(k, mut v)| {
                v.retry_count = retry_count;
                v.retry_delay_seconds = 0.0;
                (k, v)
            })
            .collect()
    }

    fn router(
        transport: Arc<ScriptedTransport>,
        retry_count: u32,
    ) -> (ActionRouter, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::open_in_memory().unwrap());
        let router =
            ActionRouter::with_transport(transport, endpoints(retry_count), Some(memory.clone()));
        (router, memory)
    }

    fn output_with(action: SuggestedAction) -> AgentOutput {
        let mut output = AgentOutput::new(DocumentFormat::Pdf);
        output.fields.insert("invoice_total".into(), json!(15000.0));
        output.fields.insert("text_excerpt".into(), json!("summary"));
        output.suggested_action = Some(action);
        output
    }

    fn risk_alert(priority: Priority) -> SuggestedAction {
        SuggestedAction::new("risk", "risk", priority, "High value invoice", "/risk/alert")
    }

    #[tokio::test]
    async fn test_success_builds_request_and_logs() {
        let transport = ScriptedTransport::new(vec![]);
        let (router, memory) = router(transport.clone(), 2);
        let output = output_with(risk_alert(Priority::Critical));

        let result = router.route(&output, Some("ext-1")).await;
        assert_eq!(result.status, RouteStatus::Success);
        let outcome = &result.actions_taken[0];
        assert_eq!(outcome.status, ActionStatus::Success);
        assert_eq!(outcome.attempts, 1);

        let calls = transport.calls.lock();
        let (endpoint, body) = &calls[0];
        assert_eq!(endpoint, "/risk/alert");
        assert_eq!(body["priority"], "critical");
        assert_eq!(body["escalation"], true);
        assert_eq!(body["notify_manager"], true);
        assert_eq!(body["context"]["format"], "PDF");
        assert!(body["context"]["tracking_id"].as_str().unwrap().starts_with("TR-"));
        assert!(body["context"]["fields"].get("text_excerpt").is_none());
        assert_eq!(body["context"]["fields"]["invoice_total"], 15000.0);

        let stats = memory.get_stats().unwrap();
        assert_eq!(stats.action_status["success"], 1);
        let hits = memory.search_by_content("High value invoice", 5).unwrap();
        assert_eq!(hits[0].result.as_deref(), Some("Success: High value invoice"));
    }

    #[tokio::test]
    async fn test_normal_priority_has_no_escalation_fields() {
        let transport = ScriptedTransport::new(vec![]);
        let (router, _) = router(transport.clone(), 0);
        let mut output = output_with(risk_alert(Priority::Normal));
        output.tracking_id = Some("JSON-12345".into());
        router.route(&output, None).await;

        let calls = transport.calls.lock();
        let body = &calls[0].1;
        assert!(body.get("escalation").is_none());
        assert!(body.get("notify_manager").is_none());
        assert_eq!(body["context"]["tracking_id"], "JSON-12345");
    }

    #[tokio::test]
    async fn test_retries_then_fails() {
        let transport = ScriptedTransport::new(vec![
            Ok(TransportResponse::rejected(Some(500), "Internal Server Error")),
            Err(TransportError::Network("Simulated timeout error".into())),
            Ok(TransportResponse::rejected(Some(401), "Authentication Error")),
        ]);
        let (router, memory) = router(transport.clone(), 2);
        let result = router.route(&output_with(risk_alert(Priority::High)), None).await;

        assert_eq!(result.status, RouteStatus::PartiallyFailed);
        let outcome = &result.actions_taken[0];
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(transport.calls.lock().len(), 3);

        let hits = memory.search_by_content("Failed after", 5).unwrap();
        assert_eq!(
            hits[0].result.as_deref(),
            Some("Failed after 3 attempts: Authentication Error")
        );
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Network(
            "connection reset".into(),
        ))]);
        let (router, _) = router(transport, 1);
        let result = router.route(&output_with(risk_alert(Priority::High)), None).await;
        assert_eq!(result.status, RouteStatus::Success);
        assert_eq!(result.actions_taken[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_network_error_exhausts_retries() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Network("down".into())),
            Err(TransportError::Network("down".into())),
        ]);
        let (router, memory) = router(transport, 1);
        let result = router.route(&output_with(risk_alert(Priority::Low)), None).await;
        assert_eq!(result.actions_taken[0].status, ActionStatus::Failed);
        let hits = memory.search_by_content("Network error", 5).unwrap();
        assert_eq!(
            hits[0].result.as_deref(),
            Some("Network error after 2 attempts: down")
        );
    }

    #[tokio::test]
    async fn test_unexpected_error_stops_immediately() {
        let transport =
            ScriptedTransport::new(vec![Err(TransportError::Unexpected("bad method".into()))]);
        let (router, _) = router(transport.clone(), 3);
        let result = router.route(&output_with(risk_alert(Priority::Low)), None).await;
        assert_eq!(result.actions_taken[0].attempts, 1);
        assert_eq!(result.actions_taken[0].status, ActionStatus::Failed);
        assert_eq!(transport.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_no_action_and_default_alert() {
        let transport = ScriptedTransport::new(vec![]);
        let (router, memory) = router(transport.clone(), 0);

        let valid = AgentOutput::new(DocumentFormat::Email);
        let result = router.route(&valid, None).await;
        assert_eq!(result.status, RouteStatus::NoActionRequired);
        assert!(result.actions_taken.is_empty());
        assert!(transport.calls.lock().is_empty());
        assert_eq!(memory.get_stats().unwrap().action_count, 1);

        let mut invalid = AgentOutput::new(DocumentFormat::Json);
        invalid.valid = false;
        let result = router.route(&invalid, None).await;
        let outcome = &result.actions_taken[0];
        assert_eq!(outcome.endpoint, "/alerts/data_quality");
        assert_eq!(outcome.priority, Priority::Medium);
        assert_eq!(outcome.target, "data_quality");
    }

    #[tokio::test]
    async fn test_legacy_label_and_event_type() {
        let transport = ScriptedTransport::new(vec![]);
        let (router, _) = router(transport.clone(), 0);

        let mut legacy = AgentOutput::new(DocumentFormat::Pdf);
        legacy.action = Some("store_ok".into());
        let result = router.route(&legacy, None).await;
        assert_eq!(result.actions_taken[0].endpoint, "/actions/store_ok");
        assert_eq!(result.actions_taken[0].target, "legacy");

        let mut webhook = output_with(SuggestedAction::new(
            "process",
            "webhook",
            Priority::Normal,
            "Process rfq",
            "/webhooks/{event_type}/process",
        ));
        webhook.fields.insert("event_type".into(), json!("rfq"));
        let result = router.route(&webhook, None).await;
        assert_eq!(result.actions_taken[0].endpoint, "/webhooks/rfq/process");
        assert_eq!(transport.calls.lock()[1].0, "/webhooks/rfq/process");
    }

    #[tokio::test]
    async fn test_process_batch() {
        let transport = ScriptedTransport::new(vec![
            Ok(TransportResponse::ok(200, json!({}))),
            Ok(TransportResponse::rejected(Some(400), "Validation Error")),
        ]);
        let (router, _) = router(transport, 0);

        let ok = serde_json::to_value(output_with(risk_alert(Priority::High))).unwrap();
        let failing = ok.clone();
        let nothing = json!({"format": "Email", "fields": {}});
        let garbage = json!(["not", "an", "output"]);

        let batch = router
            .process_batch(&[ok, failing, nothing, garbage])
            .await;
        assert_eq!(batch.total, 4);
        assert_eq!(batch.successful, 2);
        assert_eq!(batch.failed, 2);
        assert_eq!(batch.status, BatchStatus::PartiallySuccessful);

        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["status"], "partially_successful");
        assert_eq!(json["actions"][3]["status"], "error");
        assert_eq!(json["actions"][3]["item_index"], 3);
        assert_eq!(json["actions"][2]["status"], "no_action_required");
    }

    #[tokio::test]
    async fn test_batch_all_failed() {
        let (router, _) = router(ScriptedTransport::new(vec![]), 0);
        let batch = router.process_batch(&[json!("nope")]).await;
        assert_eq!(batch.status, BatchStatus::Failed);

        let empty = router.process_batch(&[]).await;
        assert_eq!(empty.status, BatchStatus::Success);
    }

    #[test]
    fn test_endpoint_table() {
        let table = EndpointConfig::defaults();
        assert_eq!(table.len(), 9);
        assert_eq!(table["/crm/contact/update"].method, "PUT");
        assert_eq!(table["/alerts/send_email"].retry_delay_seconds, 0.7);
        assert_eq!(table[DEFAULT_ENDPOINT].success_rate, 0.90);
    }

    #[test]
    fn test_unencodable_request_fails_without_sending() {
        let mut outcome = ActionOutcome {
            action_type: "escalate".into(),
            target: "crm".into(),
            endpoint: "/crm/escalate".into(),
            priority: Priority::High,
            timestamp: Utc::now().to_rfc3339(),
            status: ActionStatus::Pending,
            attempts: 0,
            response: None,
        };
        let err = serde_json::from_str::<Value>("{").unwrap_err();
        let result = reject_unencodable(&mut outcome, &err);

        assert_eq!(outcome.status, ActionStatus::Failed);
        assert_eq!(outcome.attempts, 0);
        let response = outcome.response.unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("Failed to encode request"));
        assert!(result.starts_with("Unexpected error: Failed to encode request"));
    }
}
