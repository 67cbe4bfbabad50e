//! Document agents.
//!
//! The classifier turns raw input into a [`Document`] and a
//! [`Classification`](crate::models::Classification); one extraction agent per
//! format then turns the document into an [`AgentOutput`].

pub mod classifier;
pub mod email;
pub mod image;
pub mod json;
pub mod llm;
pub mod pdf;

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{AgentOutput, Document, DocumentFormat};

pub use classifier::{upload_hint, Classifier};
pub use llm::{LanguageModel, LlmError, TextRecognizer};

/// A format-specific extraction agent.
///
/// Agents never fail: problems are reported through the output's status,
/// flags and anomalies.
pub trait ExtractionAgent: Send + Sync {
    /// Agent name, as recorded in traces and session results.
    fn name(&self) -> &'static str;

    fn process(&self, doc: &Document) -> AgentOutput;
}

/// Maps each supported format to its agent.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: HashMap<DocumentFormat, Arc<dyn ExtractionAgent>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        let mut agents: HashMap<DocumentFormat, Arc<dyn ExtractionAgent>> = HashMap::new();
        agents.insert(DocumentFormat::Email, Arc::new(email::EmailAgent));
        agents.insert(DocumentFormat::Pdf, Arc::new(pdf::PdfAgent));
        agents.insert(DocumentFormat::Json, Arc::new(json::JsonAgent));
        agents.insert(DocumentFormat::Image, Arc::new(image::ImageAgent));
        Self { agents }
    }
}

impl AgentRegistry {
    pub fn get(&self, format: DocumentFormat) -> Option<Arc<dyn ExtractionAgent>> {
        self.agents.get(&format).cloned()
    }

    /// Labels of the formats that have an agent, in a stable order.
    pub fn available_formats(&self) -> Vec<&'static str> {
        DocumentFormat::SUPPORTED
            .iter()
            .filter(|f| self.agents.contains_key(f))
            .map(|f| f.label())
            .collect()
    }
}
