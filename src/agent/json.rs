//! Webhook payload validation.
//!
//! A webhook is a JSON object carrying `event_type`, `payload`, `timestamp`,
//! `source` and `version`. Payloads of the known event types are checked
//! against a small schema; everything that does not fit is reported as an
//! anomaly rather than rejected.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::ExtractionAgent;
use crate::models::{
    display_value, json_type_name, AgentOutput, Document, DocumentFormat, Priority,
    ProcessingStatus, SuggestedAction,
};

/// Fraud alerts scoring above this are escalated.
pub const RISK_THRESHOLD: f64 = 0.7;

const TOP_LEVEL_REQUIRED: [&str; 5] = ["event_type", "payload", "timestamp", "source", "version"];
const PRIORITY_VALUES: [&str; 4] = ["low", "medium", "high", "critical"];
const SEVERITY_VALUES: [&str; 4] = ["minor", "moderate", "major", "critical"];
const QUANTITY_MIN: f64 = 1.0;
const PRICE_MIN: f64 = 0.01;

static DATE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}(T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})?)?$")
        .expect("static regex")
});
static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("static regex")
});

/// Expected JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    String,
    Number,
    Object,
    Array,
    StringOrNumber,
}

impl Kind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Kind::String => value.is_string(),
            Kind::Number => value.is_number(),
            Kind::Object => value.is_object(),
            Kind::Array => value.is_array(),
            Kind::StringOrNumber => value.is_string() || value.is_number(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Kind::String => "string",
            Kind::Number => "number",
            Kind::Object => "object",
            Kind::Array => "array",
            Kind::StringOrNumber => "string or number",
        }
    }
}

struct Schema {
    required: &'static [&'static str],
    types: &'static [(&'static str, Kind)],
    /// Required keys of a nested object.
    nested_object: Option<(&'static str, &'static [&'static str])>,
    /// Required keys of each element of a nested array.
    nested_items: Option<(&'static str, &'static [&'static str])>,
}

const EVENT_TYPES: [&str; 4] = ["rfq", "invoice", "complaint", "fraud_alert"];

fn schema_for(event_type: &str) -> Option<Schema> {
    let schema = match event_type {
        "rfq" => Schema {
            required: &["rfq_id", "customer", "items", "date_requested", "priority"],
            types: &[
                ("rfq_id", Kind::String),
                ("customer", Kind::Object),
                ("items", Kind::Array),
                ("date_requested", Kind::String),
                ("priority", Kind::String),
            ],
            nested_object: Some(("customer", &["id", "name", "contact_email"])),
            nested_items: Some(("items", &["item_id", "quantity", "description"])),
        },
        "invoice" => Schema {
            required: &["invoice_id", "customer_id", "amount", "date_issued", "items"],
            types: &[
                ("invoice_id", Kind::String),
                ("customer_id", Kind::String),
                ("amount", Kind::Number),
                ("date_issued", Kind::String),
                ("items", Kind::Array),
            ],
            nested_object: None,
            nested_items: Some(("items", &["item_id", "quantity", "price", "description"])),
        },
        "complaint" => Schema {
            required: &["complaint_id", "customer_id", "description", "severity", "date_filed"],
            types: &[
                ("complaint_id", Kind::String),
                ("customer_id", Kind::String),
                ("description", Kind::String),
                ("severity", Kind::String),
                ("date_filed", Kind::String),
            ],
            nested_object: None,
            nested_items: None,
        },
        "fraud_alert" => Schema {
            required: &["alert_id", "account_id", "type", "risk_score", "timestamp"],
            types: &[
                ("alert_id", Kind::String),
                ("account_id", Kind::String),
                ("type", Kind::String),
                ("risk_score", Kind::Number),
                ("timestamp", Kind::String),
            ],
            nested_object: None,
            nested_items: None,
        },
        _ => return None,
    };
    Some(schema)
}

/// Collects anomalies in order, dropping exact repeats.
#[derive(Default)]
struct Anomalies(Vec<String>);

impl Anomalies {
    fn push(&mut self, message: String) {
        if !self.0.contains(&message) {
            self.0.push(message);
        }
    }

    fn check_type(&mut self, field: &str, value: &Value, kind: Kind) -> bool {
        if kind.accepts(value) {
            return true;
        }
        self.push(format!(
            "Field '{}' should be {}, got {}",
            field,
            kind.name(),
            json_type_name(value)
        ));
        false
    }

    fn check_pattern(&mut self, field: &str, value: &Value, pattern: &Regex) {
        if !self.check_type(field, value, Kind::String) {
            return;
        }
        let text = value.as_str().unwrap_or_default();
        if !pattern.is_match(text) {
            self.push(format!(
                "Field '{}' with value '{}' does not match expected pattern",
                field, text
            ));
        }
    }

    fn check_min(&mut self, field: &str, value: &Value, min: f64) {
        if !self.check_type(field, value, Kind::Number) {
            return;
        }
        if value.as_f64().is_some_and(|v| v < min) {
            self.push(format!(
                "Field '{}' with value {} is below minimum {}",
                field, value, min
            ));
        }
    }

    fn check_enum(&mut self, field: &str, value: &Value, allowed: &[&str]) {
        if !self.check_type(field, value, Kind::String) {
            return;
        }
        let text = value.as_str().unwrap_or_default();
        if !allowed.contains(&text) {
            self.push(format!(
                "Field '{}' with value '{}' not in allowed values: {}",
                field,
                text,
                allowed.join(", ")
            ));
        }
    }
}

fn validate_payload(
    event_type: &str,
    schema: &Schema,
    payload: &Map<String, Value>,
    anomalies: &mut Anomalies,
) {
    for field in schema.required {
        if !payload.contains_key(*field) {
            anomalies.push(format!(
                "Missing required field '{}' for event_type '{}'",
                field, event_type
            ));
        }
    }

    for (field, kind) in schema.types {
        if let Some(value) = payload.get(*field) {
            anomalies.check_type(field, value, *kind);
        }
    }

    if let Some((path, required)) = schema.nested_object {
        match payload.get(path).and_then(Value::as_object) {
            Some(nested) => {
                for field in required {
                    if !nested.contains_key(*field) {
                        anomalies.push(format!("Missing required field '{}' in {}", field, path));
                    }
                }
            }
            None => anomalies.push(format!("Missing or invalid nested object '{}'", path)),
        }
    }

    if let Some((path, required)) = schema.nested_items {
        if let Some(items) = payload.get(path).and_then(Value::as_array) {
            for (i, item) in items.iter().enumerate() {
                let Some(item) = item.as_object() else {
                    anomalies.push(format!("Item {} in {} should be an object", i, path));
                    continue;
                };
                for field in required {
                    if !item.contains_key(*field) {
                        anomalies.push(format!(
                            "Missing required field '{}' in {}[{}]",
                            field, path, i
                        ));
                    }
                }
            }
        }
    }

    let items = || {
        payload
            .get("items")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
            .filter_map(|(i, item)| item.as_object().map(|obj| (i, obj)))
    };

    match event_type {
        "rfq" => {
            if let Some(priority) = payload.get("priority") {
                anomalies.check_enum("priority", priority, &PRIORITY_VALUES);
            }
            if let Some(date) = payload.get("date_requested") {
                anomalies.check_pattern("date_requested", date, &DATE_PATTERN);
            }
            if let Some(email) = payload
                .get("customer")
                .and_then(Value::as_object)
                .and_then(|c| c.get("contact_email"))
            {
                anomalies.check_pattern("contact_email", email, &EMAIL_PATTERN);
            }
            for (i, item) in items() {
                if let Some(quantity) = item.get("quantity") {
                    anomalies.check_min(&format!("items[{}].quantity", i), quantity, QUANTITY_MIN);
                }
            }
        }
        "invoice" => {
            if let Some(amount) = payload.get("amount") {
                anomalies.check_min("amount", amount, PRICE_MIN);
            }
            if let Some(date) = payload.get("date_issued") {
                anomalies.check_pattern("date_issued", date, &DATE_PATTERN);
            }
            for (i, item) in items() {
                if let Some(quantity) = item.get("quantity") {
                    anomalies.check_min(&format!("items[{}].quantity", i), quantity, QUANTITY_MIN);
                }
                if let Some(price) = item.get("price") {
                    anomalies.check_min(&format!("items[{}].price", i), price, PRICE_MIN);
                }
            }
        }
        "complaint" => {
            if let Some(severity) = payload.get("severity") {
                anomalies.check_enum("severity", severity, &SEVERITY_VALUES);
            }
            if let Some(date) = payload.get("date_filed") {
                anomalies.check_pattern("date_filed", date, &DATE_PATTERN);
            }
        }
        "fraud_alert" => {
            if let Some(ts) = payload.get("timestamp") {
                anomalies.check_pattern("timestamp", ts, &DATE_PATTERN);
            }
        }
        _ => {}
    }
}

fn parse_failure(error: String, excerpt: String, anomaly: String) -> AgentOutput {
    let mut output = AgentOutput::new(DocumentFormat::Json);
    output.status = ProcessingStatus::Error;
    output.valid = false;
    output
        .fields
        .insert("error".to_string(), Value::String(error.clone()));
    output.set_text_excerpt(excerpt);
    output.anomalies.push(anomaly);
    output.error = Some(error);
    output
}

/// Validate a webhook object.
pub fn validate_webhook(data: &Map<String, Value>) -> AgentOutput {
    let mut output = AgentOutput::new(DocumentFormat::Json);
    let mut anomalies = Anomalies::default();

    for field in TOP_LEVEL_REQUIRED {
        if !data.contains_key(field) {
            anomalies.push(format!("Missing required top-level field: {}", field));
        }
    }

    let event_type = match data.get("event_type") {
        Some(Value::String(s)) => s.to_lowercase(),
        Some(other) => {
            anomalies.check_type("event_type", other, Kind::String);
            String::new()
        }
        None => String::new(),
    };
    let empty = Value::Object(Map::new());
    let payload = data.get("payload").unwrap_or(&empty);
    let blank = Value::String(String::new());
    let timestamp = data.get("timestamp").unwrap_or(&blank);
    let source = data.get("source").unwrap_or(&blank);
    let version = data.get("version").unwrap_or(&blank);

    output.fields.insert("event_type".into(), json!(event_type));
    output.fields.insert("source".into(), source.clone());
    output.fields.insert("version".into(), version.clone());
    output.fields.insert("timestamp".into(), timestamp.clone());

    if data.contains_key("timestamp") {
        anomalies.check_pattern("timestamp", timestamp, &DATE_PATTERN);
    }
    if data.contains_key("payload") {
        anomalies.check_type("payload", payload, Kind::Object);
    }
    if data.contains_key("version") {
        anomalies.check_type("version", version, Kind::StringOrNumber);
    }

    let schema = schema_for(&event_type);
    match (schema, payload.as_object()) {
        (Some(schema), Some(payload_obj)) => {
            validate_payload(&event_type, &schema, payload_obj, &mut anomalies);
        }
        (schema, payload_obj) => {
            if event_type.is_empty() {
                anomalies.push("Missing or empty event_type".to_string());
            } else if schema.is_none() {
                anomalies.push(format!(
                    "Unknown event_type: '{}'. Supported types: {}",
                    event_type,
                    EVENT_TYPES.join(", ")
                ));
            }
            if payload_obj.is_none() {
                anomalies.push("Payload must be a JSON object".to_string());
            }
        }
    }

    let risk_score = (event_type == "fraud_alert")
        .then(|| payload.get("risk_score").and_then(Value::as_f64))
        .flatten()
        .filter(|score| *score > RISK_THRESHOLD);
    if let Some(score) = risk_score {
        output.fields.insert("risk_flag".into(), json!(true));
        output.fields.insert("risk_score".into(), payload["risk_score"].clone());
        tracing::debug!("Fraud alert above threshold: {}", score);
    }

    output.anomalies = anomalies.0;
    output.valid = output.anomalies.is_empty();

    let tracking_id = format!("JSON-{}", rand::thread_rng().gen_range(10000..=99999));
    output.set_text_excerpt(summarize(
        &event_type,
        source,
        version,
        timestamp,
        &tracking_id,
        payload,
        output.valid,
        &output.anomalies,
    ));
    output.tracking_id = Some(tracking_id);

    output.suggested_action = Some(if !output.anomalies.is_empty() {
        let priority = if output.anomalies.len() > 3 {
            Priority::High
        } else {
            Priority::Medium
        };
        SuggestedAction::new(
            "alert",
            "data_quality",
            priority,
            format!("Data quality issues detected in {} webhook", event_type),
            "/alerts/data_quality",
        )
    } else if let Some(score) = risk_score {
        SuggestedAction::new(
            "escalate",
            "risk",
            Priority::Critical,
            format!("High risk score detected: {}", score),
            "/risk/escalate",
        )
    } else {
        SuggestedAction::new(
            "process",
            "webhook",
            Priority::Normal,
            format!("Valid {} webhook received", event_type),
            format!("/webhooks/{}/process", event_type),
        )
    });

    output
}

#[allow(clippy::too_many_arguments)]
fn summarize(
    event_type: &str,
    source: &Value,
    version: &Value,
    timestamp: &Value,
    tracking_id: &str,
    payload: &Value,
    valid: bool,
    anomalies: &[String],
) -> String {
    let or_na = |v: &Value| {
        let s = display_value(v);
        if s.is_empty() {
            "N/A".to_string()
        } else {
            s
        }
    };

    let mut lines = vec![
        format!(
            "Event Type: {}",
            if event_type.is_empty() { "N/A" } else { event_type }
        ),
        format!("Source: {}", or_na(source)),
        format!("Version: {}", or_na(version)),
        format!("Timestamp: {}", or_na(timestamp)),
        format!("Tracking ID: {}", tracking_id),
        format!(
            "Validation: {}",
            if valid { "✓ VALID" } else { "✗ INVALID" }
        ),
        String::new(),
        "Payload:".to_string(),
    ];

    match payload.as_object() {
        Some(obj) if !obj.is_empty() => {
            for (key, value) in obj {
                match value {
                    Value::Object(m) => {
                        lines.push(format!("  - {}: object with {} items", key, m.len()))
                    }
                    Value::Array(a) => {
                        lines.push(format!("  - {}: array with {} items", key, a.len()))
                    }
                    other => lines.push(format!("  - {}: {}", key, display_value(other))),
                }
            }
        }
        _ => lines.push("  (No payload fields)".to_string()),
    }

    if !anomalies.is_empty() {
        lines.push(String::new());
        lines.push("Anomalies:".to_string());
        for anomaly in anomalies {
            lines.push(format!("  - {}", anomaly));
        }
    }

    lines.join("\n")
}

/// Validates webhook JSON documents.
#[derive(Debug, Default)]
pub struct JsonAgent;

impl ExtractionAgent for JsonAgent {
    fn name(&self) -> &'static str {
        "json_agent"
    }

    fn process(&self, doc: &Document) -> AgentOutput {
        let parsed = match doc.json {
            Some(ref value) => value.clone(),
            None => match serde_json::from_str::<Value>(&doc.text) {
                Ok(value) => value,
                Err(e) => {
                    return parse_failure(
                        format!("Invalid JSON: {}", e),
                        format!("Failed to parse JSON: {}", e),
                        format!("JSON parse error: {}", e),
                    )
                }
            },
        };

        match parsed.as_object() {
            Some(obj) => validate_webhook(obj),
            None => parse_failure(
                "Input is not a JSON object".to_string(),
                "Invalid input type".to_string(),
                format!(
                    "Input is not a JSON object (got {})",
                    json_type_name(&parsed)
                ),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(value: Value) -> AgentOutput {
        let mut doc = Document::new(DocumentFormat::Json, value.to_string());
        doc.json = Some(value);
        JsonAgent.process(&doc)
    }

    fn valid_invoice() -> Value {
        json!({
            "event_type": "invoice",
            "timestamp": "2024-03-01T12:00:00Z",
            "source": "billing-system",
            "version": "1.0",
            "payload": {
                "invoice_id": "INV-1",
                "customer_id": "C-9",
                "amount": 1200.5,
                "date_issued": "2024-03-01",
                "items": [
                    {"item_id": "A", "quantity": 2, "price": 600.25, "description": "Widget"}
                ]
            }
        })
    }

    #[test]
    fn test_valid_invoice_webhook() {
        let output = run(valid_invoice());
        assert!(output.valid, "anomalies: {:?}", output.anomalies);
        assert_eq!(output.status, ProcessingStatus::Processed);
        assert!(output.tracking_id.as_ref().unwrap().starts_with("JSON-"));
        let action = output.suggested_action.as_ref().unwrap();
        assert_eq!(action.action, "process");
        assert_eq!(action.endpoint, "/webhooks/invoice/process");
        assert_eq!(action.priority, Priority::Normal);
        assert!(output.text_excerpt().contains("Validation: ✓ VALID"));
        assert!(output.text_excerpt().contains("  - items: array with 1 items"));
    }

    #[test]
    fn test_invoice_range_violations() {
        let mut value = valid_invoice();
        value["payload"]["amount"] = json!(0);
        value["payload"]["items"][0]["quantity"] = json!(0);
        let output = run(value);
        assert!(!output.valid);
        assert!(output
            .anomalies
            .contains(&"Field 'amount' with value 0 is below minimum 0.01".to_string()));
        assert!(output
            .anomalies
            .contains(&"Field 'items[0].quantity' with value 0 is below minimum 1".to_string()));
        let action = output.suggested_action.unwrap();
        assert_eq!(action.endpoint, "/alerts/data_quality");
        assert_eq!(action.priority, Priority::Medium);
    }

    #[test]
    fn test_wrong_types_are_anomalies() {
        let mut value = valid_invoice();
        value["payload"]["amount"] = json!("lots");
        value["payload"]["date_issued"] = json!(20240301);
        let output = run(value);
        assert_eq!(
            output.anomalies,
            vec![
                "Field 'amount' should be number, got string".to_string(),
                "Field 'date_issued' should be string, got number".to_string(),
            ]
        );
    }

    #[test]
    fn test_rfq_nested_checks() {
        let output = run(json!({
            "event_type": "RFQ",
            "timestamp": "2024-03-01",
            "source": "portal",
            "version": 2,
            "payload": {
                "rfq_id": "R-1",
                "customer": {"id": "C", "name": "Acme", "contact_email": "not-an-email"},
                "items": [{"item_id": "X", "quantity": 5}, "junk"],
                "date_requested": "03/01/2024",
                "priority": "urgent"
            }
        }));
        let a = &output.anomalies;
        assert!(a.contains(&"Missing required field 'description' in items[0]".to_string()));
        assert!(a.contains(&"Item 1 in items should be an object".to_string()));
        assert!(a.contains(
            &"Field 'priority' with value 'urgent' not in allowed values: low, medium, high, critical"
                .to_string()
        ));
        assert!(a.contains(
            &"Field 'date_requested' with value '03/01/2024' does not match expected pattern"
                .to_string()
        ));
        assert!(a.contains(
            &"Field 'contact_email' with value 'not-an-email' does not match expected pattern"
                .to_string()
        ));
        assert_eq!(output.fields["event_type"], "rfq");
        assert_eq!(output.suggested_action.unwrap().priority, Priority::High);
    }

    #[test]
    fn test_fraud_alert_escalates() {
        let output = run(json!({
            "event_type": "fraud_alert",
            "timestamp": "2024-03-01T00:00:00+02:00",
            "source": "risk-engine",
            "version": "1",
            "payload": {
                "alert_id": "F-1",
                "account_id": "ACC-1",
                "type": "card",
                "risk_score": 0.92,
                "timestamp": "2024-03-01T00:00:00Z"
            }
        }));
        assert!(output.valid, "anomalies: {:?}", output.anomalies);
        assert_eq!(output.fields["risk_flag"], json!(true));
        assert_eq!(output.fields["risk_score"], json!(0.92));
        let action = output.suggested_action.unwrap();
        assert_eq!(action.endpoint, "/risk/escalate");
        assert_eq!(action.priority, Priority::Critical);
    }

    #[test]
    fn test_unknown_event_and_bad_payload() {
        let output = run(json!({
            "event_type": "shipment",
            "payload": [1, 2],
            "timestamp": "yesterday",
            "source": "x",
            "version": "1"
        }));
        let a = &output.anomalies;
        assert!(a.contains(&"Field 'payload' should be object, got array".to_string()));
        assert!(a.contains(
            &"Unknown event_type: 'shipment'. Supported types: rfq, invoice, complaint, fraud_alert"
                .to_string()
        ));
        assert!(a.contains(&"Payload must be a JSON object".to_string()));
        assert!(a.iter().any(|m| m.starts_with("Field 'timestamp' with value 'yesterday'")));
    }

    #[test]
    fn test_missing_everything() {
        let output = run(json!({}));
        assert_eq!(output.anomalies.len(), 6);
        assert!(output
            .anomalies
            .contains(&"Missing required top-level field: event_type".to_string()));
        assert!(output.anomalies.contains(&"Missing or empty event_type".to_string()));
        assert!(output.text_excerpt().contains("Event Type: N/A"));
        assert!(output.text_excerpt().contains("  (No payload fields)"));
        assert_eq!(output.suggested_action.unwrap().priority, Priority::High);
    }

    #[test]
    fn test_unparsable_and_non_object() {
        let doc = Document::new(DocumentFormat::Json, "{not json");
        let output = JsonAgent.process(&doc);
        assert_eq!(output.status, ProcessingStatus::Error);
        assert!(!output.valid);
        assert!(output.anomalies[0].starts_with("JSON parse error:"));
        assert!(output.suggested_action.is_none());

        let output = run(json!([1, 2, 3]));
        assert_eq!(output.status, ProcessingStatus::Error);
        assert_eq!(output.text_excerpt(), "Invalid input type");
        assert!(output.anomalies[0].starts_with("Input is not a JSON object"));
    }
}
