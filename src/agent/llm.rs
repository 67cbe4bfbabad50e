//! Remote model clients.
//!
//! Two seams live here: [`LanguageModel`] (an OpenAI-compatible chat
//! completion endpoint, Groq by default) used for the classifier's intent
//! hint, and [`TextRecognizer`] (an Ollama vision model) used for OCR.

use async_trait::async_trait;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::{ModelConfig, OcrConfig};

/// Errors raised by the model clients.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Cannot connect to {0}")]
    Connect(String),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to send request: {0}")]
    Request(String),

    #[error("Failed to parse response: {0}")]
    Decode(String),

    #[error("Response contained no choices")]
    EmptyResponse,

    #[error("Could not extract required fields from response")]
    MissingFields,
}

impl LlmError {
    /// Short category label, recorded next to the details.
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Api { .. } => "API Error",
            LlmError::Timeout(_) | LlmError::Connect(_) | LlmError::Request(_) => {
                "Connection error"
            }
            _ => "Unexpected error",
        }
    }

    fn from_send(err: reqwest::Error, timeout: u64, url: &str) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(timeout)
        } else if err.is_connect() {
            LlmError::Connect(url.to_string())
        } else {
            LlmError::Request(err.to_string())
        }
    }
}

/// A chat-completion capable language model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;
}

/// An OCR engine turning image bytes into text.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<String, LlmError>;
}

/// Message in the chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

/// OpenAI-compatible chat completion client.
pub struct ChatCompletionClient {
    config: ModelConfig,
    http_client: reqwest::Client,
}

impl ChatCompletionClient {
    pub fn new(config: ModelConfig) -> Result<Self, LlmError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let request = CompletionRequest {
            model: &self.config.name,
            messages: vec![
                ChatMessage::new("system", system),
                ChatMessage::new("user", user),
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        debug!("Sending completion request to {}", url);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(self.config.api_key.as_deref().unwrap_or_default())
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::from_send(e, self.config.timeout_seconds, &url))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(LlmError::EmptyResponse)
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// OCR through an Ollama vision model.
pub struct OllamaVision {
    config: OcrConfig,
    http_client: reqwest::Client,
}

impl OllamaVision {
    pub fn new(config: OcrConfig) -> Result<Self, LlmError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }
}

#[async_trait]
impl TextRecognizer for OllamaVision {
    async fn recognize(&self, image: &[u8]) -> Result<String, LlmError> {
        let url = format!("{}/api/chat", self.config.ollama_url.trim_end_matches('/'));

        let mut message = ChatMessage::new("user", &self.config.prompt);
        message
            .images
            .push(base64::engine::general_purpose::STANDARD.encode(image));

        let request = OllamaChatRequest {
            model: &self.config.model,
            messages: vec![message],
            stream: false,
            options: OllamaOptions { temperature: 0.0 },
        };

        debug!("Sending {} image bytes to {}", image.len(), url);

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::from_send(e, self.config.timeout_seconds, &url))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;

        Ok(chat_response.message.content.trim().to_string())
    }
}

/// System prompt for the classification hint.
pub const CLASSIFIER_SYSTEM_PROMPT: &str = "You are a helpful assistant that classifies documents.";

/// Build the user prompt for the classification hint.
pub fn classifier_prompt(text: &str, max_chars: usize) -> String {
    let input: String = text.chars().take(max_chars).collect();
    format!(
        "You are a smart document classifier.\n\
         Detect the format (PDF, Email, JSON) and business intent \
         (RFQ, Complaint, Invoice, Regulation, Fraud Risk) for the following input.\n\
         Respond as JSON: {{\"format\":..., \"intent\":..., \"metadata\":...}}.\n\
         Input: \n{}",
        input
    )
}

/// Classification hint returned by the language model.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmHint {
    pub format: String,
    pub intent: String,
    pub metadata: serde_json::Map<String, Value>,
}

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json\n)?(.*?)\n```").expect("static regex")
});
static FORMAT_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""format"\s*:\s*"([^"]+)""#).expect("static regex"));
static INTENT_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""intent"\s*:\s*"([^"]+)""#).expect("static regex"));

/// Parse a classifier reply.
///
/// The reply may be wrapped in a fenced code block. When it is not a JSON
/// object carrying both `format` and `intent`, the two fields are pulled out
/// by pattern instead.
pub fn parse_classifier_reply(reply: &str) -> Result<LlmHint, LlmError> {
    let content = FENCED_BLOCK
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(reply);

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) {
        if let (Some(format), Some(intent)) = (obj.get("format"), obj.get("intent")) {
            let metadata = obj
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            return Ok(LlmHint {
                format: crate::models::display_value(format),
                intent: crate::models::display_value(intent),
                metadata,
            });
        }
    }

    let format = FORMAT_FIELD.captures(content).map(|c| c[1].to_string());
    let intent = INTENT_FIELD.captures(content).map(|c| c[1].to_string());
    match (format, intent) {
        (Some(format), Some(intent)) => {
            let mut metadata = serde_json::Map::new();
            metadata.insert(
                "warning".to_string(),
                Value::String("Extracted from text response".to_string()),
            );
            Ok(LlmHint {
                format,
                intent,
                metadata,
            })
        }
        _ => Err(LlmError::MissingFields),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let hint = parse_classifier_reply(
            r#"{"format": "Email", "intent": "Complaint", "metadata": {"sender": "a@b.com"}}"#,
        )
        .unwrap();
        assert_eq!(hint.format, "Email");
        assert_eq!(hint.intent, "Complaint");
        assert_eq!(hint.metadata["sender"], "a@b.com");
    }

    #[test]
    fn test_parse_fenced_json() {
        let reply = "Here you go:\n```json\n{\"format\": \"PDF\", \"intent\": \"Invoice\"}\n```";
        let hint = parse_classifier_reply(reply).unwrap();
        assert_eq!(hint.format, "PDF");
        assert_eq!(hint.intent, "Invoice");
        assert!(hint.metadata.is_empty());
    }

    #[test]
    fn test_parse_by_pattern() {
        let reply = r#"I think "format": "JSON", and "intent": "Fraud Risk" (not strict json)"#;
        let hint = parse_classifier_reply(reply).unwrap();
        assert_eq!(hint.format, "JSON");
        assert_eq!(hint.intent, "Fraud Risk");
        assert_eq!(hint.metadata["warning"], "Extracted from text response");
    }

    #[test]
    fn test_parse_missing_fields() {
        let err = parse_classifier_reply(r#"{"format": "PDF"}"#).unwrap_err();
        assert!(matches!(err, LlmError::MissingFields));
        assert!(parse_classifier_reply("no idea").is_err());
    }

    #[test]
    fn test_prompt_is_truncated() {
        let text = "x".repeat(5000);
        let prompt = classifier_prompt(&text, 2000);
        assert!(prompt.ends_with(&"x".repeat(2000)));
        assert!(!prompt.contains(&"x".repeat(2001)));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            LlmError::Api {
                status: 429,
                body: "slow down".into()
            }
            .kind(),
            "API Error"
        );
        assert_eq!(LlmError::Timeout(30).kind(), "Connection error");
        assert_eq!(LlmError::MissingFields.kind(), "Unexpected error");
    }
}
