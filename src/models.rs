//! Data models for document intake.
//!
//! This module contains the core data structures shared by the agents,
//! the action router, the memory store and the HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Structured fields extracted by an agent.
pub type Fields = Map<String, Value>;

/// Detected document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentFormat {
    #[serde(rename = "PDF")]
    Pdf,
    #[serde(rename = "Email")]
    Email,
    #[serde(rename = "JSON")]
    Json,
    #[serde(rename = "Image")]
    Image,
    #[serde(rename = "Unknown")]
    Unknown,
}

impl DocumentFormat {
    /// Formats that have an extraction agent.
    pub const SUPPORTED: [DocumentFormat; 4] = [
        DocumentFormat::Email,
        DocumentFormat::Pdf,
        DocumentFormat::Json,
        DocumentFormat::Image,
    ];

    /// Canonical label, as used in responses and the memory store.
    pub fn label(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "PDF",
            DocumentFormat::Email => "Email",
            DocumentFormat::Json => "JSON",
            DocumentFormat::Image => "Image",
            DocumentFormat::Unknown => "Unknown",
        }
    }

    /// Parse a free-form label (case-insensitive). Returns `None` for anything unrecognised.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "email" | "e-mail" | "eml" => Some(DocumentFormat::Email),
            "json" => Some(DocumentFormat::Json),
            "image" | "img" => Some(DocumentFormat::Image),
            "unknown" => Some(DocumentFormat::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Business intent of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    #[serde(rename = "RFQ")]
    Rfq,
    #[serde(rename = "Complaint")]
    Complaint,
    #[serde(rename = "Invoice")]
    Invoice,
    #[serde(rename = "Regulation")]
    Regulation,
    #[serde(rename = "Fraud Risk")]
    FraudRisk,
    #[serde(rename = "Unknown")]
    Unknown,
}

impl Intent {
    /// Scoring order. Ties go to the earlier entry.
    pub const SCORED: [Intent; 5] = [
        Intent::Rfq,
        Intent::Complaint,
        Intent::Invoice,
        Intent::Regulation,
        Intent::FraudRisk,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Intent::Rfq => "RFQ",
            Intent::Complaint => "Complaint",
            Intent::Invoice => "Invoice",
            Intent::Regulation => "Regulation",
            Intent::FraudRisk => "Fraud Risk",
            Intent::Unknown => "Unknown",
        }
    }

    /// Parse a free-form label (case-insensitive).
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().replace(['_', '-'], " ").as_str() {
            "rfq" | "request for quote" => Some(Intent::Rfq),
            "complaint" => Some(Intent::Complaint),
            "invoice" => Some(Intent::Invoice),
            "regulation" => Some(Intent::Regulation),
            "fraud risk" | "fraud" => Some(Intent::FraudRisk),
            "unknown" => Some(Intent::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Priority of a follow-up action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl Priority {
    /// Returns an emoji representation of the priority.
    pub fn emoji(&self) -> &'static str {
        match self {
            Priority::Low => "🟢",
            Priority::Normal => "🔵",
            Priority::Medium => "🟡",
            Priority::High => "🟠",
            Priority::Critical => "🔴",
        }
    }

    /// Whether the downstream system should treat this as an escalation.
    pub fn is_escalation(&self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }
}

/// A follow-up action suggested by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub action: String,
    pub target: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub details: String,
    pub endpoint: String,
}

impl SuggestedAction {
    pub fn new(
        action: &str,
        target: &str,
        priority: Priority,
        details: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            action: action.to_string(),
            target: target.to_string(),
            priority,
            details: details.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Processing status reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Processed,
    Error,
}

fn default_true() -> bool {
    true
}

/// Output of an extraction agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default)]
    pub status: ProcessingStatus,
    #[serde(default = "default_format")]
    pub format: DocumentFormat,
    #[serde(default)]
    pub fields: Fields,
    #[serde(default = "default_true")]
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    /// Plain action label, kept for callers that only carry a name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<SuggestedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_format() -> DocumentFormat {
    DocumentFormat::Unknown
}

impl AgentOutput {
    /// Creates an empty, valid output for the given format.
    pub fn new(format: DocumentFormat) -> Self {
        Self {
            status: ProcessingStatus::Processed,
            format,
            fields: Fields::new(),
            valid: true,
            anomalies: Vec::new(),
            flags: Vec::new(),
            action: None,
            suggested_action: None,
            tracking_id: None,
            summary: None,
            error: None,
        }
    }

    /// Creates a failed output whose excerpt carries the error.
    pub fn failed(format: DocumentFormat, error: impl Into<String>) -> Self {
        let error = error.into();
        let mut output = Self::new(format);
        output.status = ProcessingStatus::Error;
        output.valid = false;
        output
            .fields
            .insert("error".to_string(), Value::String(error.clone()));
        output.set_text_excerpt(format!("Error: {}", error));
        output.error = Some(error);
        output
    }

    pub fn text_excerpt(&self) -> &str {
        self.fields
            .get("text_excerpt")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn set_text_excerpt(&mut self, excerpt: impl Into<String>) {
        self.fields
            .insert("text_excerpt".to_string(), Value::String(excerpt.into()));
    }

    /// Fields without the human-readable excerpt.
    pub fn fields_without_excerpt(&self) -> Fields {
        self.fields
            .iter()
            .filter(|(k, _)| k.as_str() != "text_excerpt")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Result of classifying a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub format: DocumentFormat,
    pub intent: Intent,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Fields,
    #[serde(default)]
    pub text_excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routed_agent: Option<String>,
}

/// Raw payload of an incoming document.
#[derive(Debug, Clone)]
pub enum DocumentBody {
    Bytes(Vec<u8>),
    Json(Value),
}

/// A document as received from an upload, a JSON body or the file system.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub body: DocumentBody,
    /// Caller-supplied format, trusted over detection.
    pub source: Option<DocumentFormat>,
}

impl DocumentInput {
    pub fn from_bytes(
        filename: Option<String>,
        content_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            filename,
            content_type,
            body: DocumentBody::Bytes(bytes),
            source: None,
        }
    }

    pub fn from_json(value: Value) -> Self {
        Self {
            filename: None,
            content_type: Some("application/json".to_string()),
            body: DocumentBody::Json(value),
            source: None,
        }
    }

    pub fn with_source(mut self, source: DocumentFormat) -> Self {
        self.source = Some(source);
        self
    }

    /// Lowercased file extension, if the input has a file name.
    pub fn extension(&self) -> Option<String> {
        self.filename
            .as_deref()
            .and_then(|name| std::path::Path::new(name).extension())
            .map(|ext| ext.to_string_lossy().to_lowercase())
    }

    /// Label used as the process source in traces.
    pub fn source_label(&self) -> String {
        match (&self.filename, &self.body) {
            (Some(name), _) => name.clone(),
            (None, DocumentBody::Json(_)) => "json_body".to_string(),
            (None, DocumentBody::Bytes(_)) => "upload".to_string(),
        }
    }

    pub fn size(&self) -> usize {
        match &self.body {
            DocumentBody::Bytes(bytes) => bytes.len(),
            DocumentBody::Json(value) => value.to_string().len(),
        }
    }
}

/// A document after format detection and text extraction.
#[derive(Debug, Clone)]
pub struct Document {
    pub format: DocumentFormat,
    /// Extracted text: PDF text, e-mail source, OCR output or compact JSON.
    pub text: String,
    /// Parsed JSON body, when the input was JSON and parsed cleanly.
    pub json: Option<Value>,
    /// Detection and extraction notes (`pdf_error`, `ocr_warning`, ...).
    pub metadata: Fields,
}

impl Document {
    pub fn new(format: DocumentFormat, text: impl Into<String>) -> Self {
        Self {
            format,
            text: text.into(),
            json: None,
            metadata: Fields::new(),
        }
    }

    /// Metadata string value, if present.
    pub fn note(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Truncate to `max` characters, appending `...` when something was cut.
pub fn excerpt(text: &str, max: usize) -> String {
    let mut chars = text.char_indices();
    match chars.nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Human-readable rendering of a JSON value (strings without quotes).
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// JSON type name of a value, used in validation messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
