//! Format detection, text extraction and intent scoring.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::llm::{
    classifier_prompt, parse_classifier_reply, ChatCompletionClient, LanguageModel, LlmError,
    OllamaVision, TextRecognizer, CLASSIFIER_SYSTEM_PROMPT,
};
use crate::config::Config;
use crate::models::{
    display_value, excerpt, Classification, Document, DocumentBody, DocumentFormat,
    DocumentInput, Fields, Intent,
};

/// Extensions treated as images.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tiff"];

/// Confidence reported when no intent phrase matched.
pub const UNKNOWN_CONFIDENCE: f64 = 0.3;

const EXCERPT_CHARS: usize = 300;

fn intent_phrases(intent: Intent) -> &'static [&'static str] {
    match intent {
        Intent::Rfq => &[
            "request for quote",
            "price inquiry",
            "quotation",
            "cost estimate",
            "pricing information",
            "how much would it cost",
            "requesting a quote",
            "requesting proposal",
            "send me a quote",
        ],
        Intent::Complaint => &[
            "complaint",
            "dissatisfied",
            "unhappy",
            "problem with",
            "issue with",
            "not working",
            "failed to",
            "poor service",
            "disappointed",
            "refund",
            "compensation",
            "unacceptable",
            "terrible",
            "horrible",
            "bad experience",
            "frustrated",
            "angry",
        ],
        Intent::Invoice => &[
            "invoice",
            "payment",
            "amount due",
            "bill",
            "receipt",
            "charge",
            "transaction",
            "account",
            "paid",
            "balance",
            "due date",
            "payment terms",
            "subtotal",
            "total amount",
        ],
        Intent::Regulation => &[
            "compliance",
            "regulation",
            "law",
            "legal",
            "gdpr",
            "hipaa",
            "pci",
            "sox",
            "policy",
            "requirement",
            "standard",
            "certification",
            "audit",
            "regulatory",
            "compliance report",
        ],
        Intent::FraudRisk => &[
            "fraud",
            "suspicious",
            "unauthorized",
            "unusual activity",
            "security breach",
            "identity theft",
            "scam",
            "phishing",
            "compromised",
            "hack",
            "malicious",
            "investigation",
            "dispute",
            "not authorized",
        ],
        Intent::Unknown => &[],
    }
}

/// Result of keyword intent scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentScore {
    pub intent: Intent,
    pub confidence: f64,
    /// Score per matching intent, in scoring order.
    pub matches: Vec<(Intent, f64)>,
}

/// Score each intent by how many of its phrases occur in the text.
pub fn score_intent(text: &str) -> IntentScore {
    let lower = text.to_lowercase();
    let mut matches = Vec::new();

    for intent in Intent::SCORED {
        let hits = intent_phrases(intent)
            .iter()
            .filter(|p| lower.contains(*p))
            .count();
        if hits > 0 {
            matches.push((intent, (0.5 + hits as f64 * 0.1).min(0.95)));
        }
    }

    let mut best: Option<(Intent, f64)> = None;
    for &(intent, score) in &matches {
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((intent, score));
        }
    }

    let (intent, confidence) = best.unwrap_or((Intent::Unknown, UNKNOWN_CONFIDENCE));
    IntentScore {
        intent,
        confidence,
        matches,
    }
}

fn sniffed_mime(input: &DocumentInput) -> Option<&'static str> {
    match input.body {
        DocumentBody::Bytes(ref bytes) => infer::get(bytes).map(|kind| kind.mime_type()),
        DocumentBody::Json(_) => None,
    }
}

/// Detect the document format. The first matching rule wins.
pub fn detect_format(input: &DocumentInput) -> DocumentFormat {
    let ext = input.extension();
    let ext = ext.as_deref();
    let hint = input.source;
    let content_type = input.content_type.as_deref().unwrap_or("");
    let sniffed = if hint.is_none() && ext.is_none() {
        sniffed_mime(input)
    } else {
        None
    };

    if hint == Some(DocumentFormat::Image)
        || content_type.starts_with("image/")
        || ext.is_some_and(|e| IMAGE_EXTENSIONS.contains(&e))
        || sniffed.is_some_and(|m| m.starts_with("image/"))
    {
        DocumentFormat::Image
    } else if hint == Some(DocumentFormat::Pdf)
        || ext == Some("pdf")
        || sniffed == Some("application/pdf")
    {
        DocumentFormat::Pdf
    } else if hint == Some(DocumentFormat::Email) || ext == Some("eml") {
        DocumentFormat::Email
    } else if hint == Some(DocumentFormat::Json)
        || matches!(input.body, DocumentBody::Json(_))
        || ext == Some("json")
    {
        DocumentFormat::Json
    } else {
        DocumentFormat::Unknown
    }
}

/// Source hint for an uploaded or scanned file.
///
/// PDFs, images and `.json` files keep their format; any other file is read
/// as an e-mail.
pub fn upload_hint(input: &DocumentInput) -> DocumentFormat {
    let ext = input.extension();
    let content_type = input.content_type.as_deref().unwrap_or("");
    match ext.as_deref() {
        Some("pdf") => DocumentFormat::Pdf,
        Some(e) if IMAGE_EXTENSIONS.contains(&e) => DocumentFormat::Image,
        _ if content_type.starts_with("image/") => DocumentFormat::Image,
        Some("json") => DocumentFormat::Json,
        _ => match sniffed_mime(input) {
            Some("application/pdf") => DocumentFormat::Pdf,
            Some(m) if m.starts_with("image/") => DocumentFormat::Image,
            _ => DocumentFormat::Email,
        },
    }
}

/// Build the readable classification summary.
pub fn build_summary(
    format: DocumentFormat,
    intent: Intent,
    text: &str,
    metadata: &Fields,
) -> String {
    let (heading, empty) = match format {
        DocumentFormat::Image => ("Extracted Text (first 300 chars):", "(No text detected)"),
        DocumentFormat::Pdf => ("PDF Content (first 300 chars):", "(No text detected)"),
        DocumentFormat::Email => ("Email Content (first 300 chars):", "(No text detected)"),
        DocumentFormat::Json => ("JSON Content:", "(No content detected)"),
        DocumentFormat::Unknown => ("Content (first 300 chars):", "(No content detected)"),
    };

    let mut lines = vec![
        format!("Format: {}", format),
        format!("Intent: {}", intent),
        String::new(),
        heading.to_string(),
        if text.is_empty() {
            empty.to_string()
        } else {
            excerpt(text, EXCERPT_CHARS)
        },
        String::new(),
        "Metadata:".to_string(),
    ];
    for (key, value) in metadata {
        lines.push(format!("  - {}: {}", key, display_value(value)));
    }
    lines.join("\n")
}

/// Detects format and intent, optionally consulting a language model.
#[derive(Clone, Default)]
pub struct Classifier {
    llm: Option<Arc<dyn LanguageModel>>,
    ocr: Option<Arc<dyn TextRecognizer>>,
    max_prompt_chars: usize,
}

impl Classifier {
    pub fn new(
        llm: Option<Arc<dyn LanguageModel>>,
        ocr: Option<Arc<dyn TextRecognizer>>,
        max_prompt_chars: usize,
    ) -> Self {
        Self {
            llm,
            ocr,
            max_prompt_chars,
        }
    }

    /// Build the classifier with the remote clients the configuration enables.
    pub fn from_config(config: &Config) -> Result<Self, LlmError> {
        let llm: Option<Arc<dyn LanguageModel>> = if config.model.is_active() {
            Some(Arc::new(ChatCompletionClient::new(config.model.clone())?))
        } else {
            None
        };
        let ocr: Option<Arc<dyn TextRecognizer>> = if config.ocr.enabled {
            Some(Arc::new(OllamaVision::new(config.ocr.clone())?))
        } else {
            None
        };
        Ok(Self::new(llm, ocr, config.model.max_prompt_chars))
    }

    /// Detect the format and extract the document text.
    pub async fn extract(&self, input: &DocumentInput) -> Document {
        let format = detect_format(input);
        let mut doc = Document::new(format, "");

        match format {
            DocumentFormat::Image => {
                doc.metadata.insert("is_image".into(), json!(true));
                match input.body {
                    DocumentBody::Bytes(ref bytes) => self.recognize(bytes, &mut doc).await,
                    DocumentBody::Json(_) => {
                        doc.metadata
                            .insert("ocr_error".into(), json!("Image input carried no bytes"));
                    }
                }
                if doc.text.is_empty() {
                    doc.metadata.insert(
                        "ocr_warning".into(),
                        json!("No text could be extracted from the image"),
                    );
                }
            }
            DocumentFormat::Pdf => match input.body {
                DocumentBody::Bytes(ref bytes) => match extract_pdf_text(bytes.clone()).await {
                    Ok(text) => doc.text = text,
                    Err(e) => {
                        warn!("PDF text extraction failed: {}", e);
                        doc.metadata.insert("pdf_error".into(), json!(e));
                    }
                },
                DocumentBody::Json(_) => {
                    doc.metadata
                        .insert("pdf_error".into(), json!("PDF input carried no bytes"));
                }
            },
            DocumentFormat::Json => match input.body {
                DocumentBody::Json(ref value) => {
                    doc.text = value.to_string();
                    doc.json = Some(value.clone());
                }
                DocumentBody::Bytes(ref bytes) => {
                    doc.text = String::from_utf8_lossy(bytes).into_owned();
                    match serde_json::from_slice::<Value>(bytes) {
                        Ok(value) => doc.json = Some(value),
                        Err(e) => {
                            doc.metadata.insert("json_error".into(), json!(e.to_string()));
                        }
                    }
                }
            },
            DocumentFormat::Email | DocumentFormat::Unknown => {
                doc.text = match input.body {
                    DocumentBody::Bytes(ref bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    DocumentBody::Json(ref value) => value.to_string(),
                };
            }
        }

        debug!(
            "Extracted {} chars of {} text from {}",
            doc.text.chars().count(),
            format,
            input.source_label()
        );
        doc
    }

    async fn recognize(&self, bytes: &[u8], doc: &mut Document) {
        let Some(ref ocr) = self.ocr else {
            doc.metadata
                .insert("ocr_error".into(), json!("OCR is not configured"));
            return;
        };
        match ocr.recognize(bytes).await {
            Ok(text) => doc.text = text,
            Err(e) => {
                warn!("OCR failed: {}", e);
                doc.metadata.insert("ocr_error".into(), json!(e.to_string()));
            }
        }
    }

    /// Classify an extracted document.
    pub async fn classify(&self, doc: &Document) -> Classification {
        let mut metadata = doc.metadata.clone();
        let score = score_intent(&doc.text);
        let mut intent = score.intent;
        let mut confidence = score.confidence;

        if let Some(ref llm) = self.llm {
            let prompt = classifier_prompt(&doc.text, self.max_prompt_chars);
            let reply = llm.complete(CLASSIFIER_SYSTEM_PROMPT, &prompt).await;
            match reply.and_then(|r| parse_classifier_reply(&r)) {
                Ok(hint) => {
                    metadata.insert("llm_format".into(), json!(hint.format));
                    metadata.insert("llm_intent".into(), json!(hint.intent));
                    if !hint.metadata.is_empty() {
                        metadata.insert("llm_metadata".into(), Value::Object(hint.metadata));
                    }
                    if intent == Intent::Unknown {
                        if let Some(llm_intent) =
                            Intent::from_label(&hint.intent).filter(|i| *i != Intent::Unknown)
                        {
                            intent = llm_intent;
                            confidence = 0.5;
                            metadata.insert("intent_source".into(), json!("llm"));
                        }
                    }
                }
                Err(e) => {
                    warn!("LLM classification hint failed: {}", e);
                    metadata.insert("llm_error".into(), json!(e.kind()));
                    metadata.insert("llm_error_details".into(), json!(e.to_string()));
                }
            }
        }

        let matches: serde_json::Map<String, Value> = score
            .matches
            .iter()
            .map(|(i, s)| (i.label().to_string(), json!(s)))
            .collect();
        metadata.insert("intent_confidence".into(), json!(confidence));
        metadata.insert("intent_matches".into(), Value::Object(matches));

        let text_excerpt = build_summary(doc.format, intent, &doc.text, &metadata);
        Classification {
            format: doc.format,
            intent,
            confidence,
            metadata,
            text_excerpt,
            routed_agent: None,
        }
    }
}

/// Extract PDF text off the async runtime. Parser panics count as failures.
async fn extract_pdf_text(bytes: Vec<u8>) -> Result<String, String> {
    tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| format!("PDF parser aborted: {}", e))?
        .map_err(|e| e.to_string())
}
