//! Markdown and JSON report generation.
//!
//! This module renders the result of a batch run: per-document
//! classification, extraction outcome and routed actions, plus the
//! aggregated counts.

use crate::analysis::{highest_priority, most_urgent, BatchSummary};
use crate::models::ProcessingStatus;
use crate::pipeline::ProcessResponse;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

const URGENT_LIMIT: usize = 10;

/// Everything produced by one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub metadata: ReportMetadata,
    pub summary: BatchSummary,
    pub documents: Vec<ProcessResponse>,
    /// Files that could not be read.
    pub failures: Vec<FailedDocument>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    pub inputs: Vec<String>,
    pub documents_processed: usize,
    pub documents_failed: usize,
    pub duration_seconds: f64,
    /// Model consulted for intent hints, if any.
    pub model: Option<String>,
    pub live_actions: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedDocument {
    pub path: String,
    pub error: String,
}

impl BatchReport {
    pub fn new(
        metadata: ReportMetadata,
        documents: Vec<ProcessResponse>,
        failures: Vec<FailedDocument>,
    ) -> Self {
        Self {
            summary: BatchSummary::from_responses(&documents),
            metadata,
            documents,
            failures,
        }
    }
}

/// Label a document by where it came from.
pub fn source_of(response: &ProcessResponse) -> String {
    response
        .debug
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or(&response.process_id)
        .to_string()
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &BatchReport) -> String {
    let mut output = String::new();

    output.push_str("# InvoiceFlow Batch Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_summary_section(&report.summary));
    output.push_str(&generate_urgent_section(&report.documents));
    output.push_str(&generate_documents_section(&report.documents));
    output.push_str(&generate_failures_section(&report.failures));
    output.push_str(&generate_footer());

    output
}

fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Inputs:** {}\n", metadata.inputs.join(", ")));
    section.push_str(&format!(
        "- **Documents Processed:** {}\n",
        metadata.documents_processed
    ));
    if metadata.documents_failed > 0 {
        section.push_str(&format!(
            "- **Documents Failed:** {}\n",
            metadata.documents_failed
        ));
    }
    match metadata.model {
        Some(ref model) => section.push_str(&format!("- **Intent Model:** `{}`\n", model)),
        None => section.push_str("- **Intent Model:** keyword scoring only\n"),
    }
    section.push_str(&format!(
        "- **Action Delivery:** {}\n",
        if metadata.live_actions {
            "live"
        } else {
            "simulated"
        }
    ));
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n\n",
        metadata.duration_seconds
    ));

    section
}

fn generate_summary_section(summary: &BatchSummary) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str("| Processed | Errors | Invalid | Anomalies | Escalations |\n");
    section.push_str("|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | {} |\n\n",
        summary.processed, summary.errors, summary.invalid, summary.anomalies, summary.escalations
    ));

    section.push_str(&count_table("Format", &summary.by_format));
    section.push_str(&count_table("Intent", &summary.by_intent));
    section.push_str(&count_table("Routing", &summary.by_route_status));

    section.push_str(&format!(
        "Actions delivered: {} succeeded, {} failed.\n\n",
        summary.actions_succeeded, summary.actions_failed
    ));

    section
}

fn count_table(title: &str, counts: &std::collections::BTreeMap<String, usize>) -> String {
    if counts.is_empty() {
        return String::new();
    }
    let mut table = format!("### By {}\n\n| {} | Count |\n|------|-------|\n", title, title);
    let mut rows: Vec<_> = counts.iter().collect();
    rows.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    for (label, count) in rows {
        table.push_str(&format!("| {} | {} |\n", label, count));
    }
    table.push('\n');
    table
}

fn generate_urgent_section(documents: &[ProcessResponse]) -> String {
    let urgent = most_urgent(documents, URGENT_LIMIT);
    if urgent.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Most Urgent\n\n");
    section.push_str("| Priority | Document | Intent | Actions |\n");
    section.push_str("|----------|----------|--------|---------|\n");
    for response in urgent {
        let priority = highest_priority(response).unwrap_or_default();
        let actions: Vec<String> = response
            .actions
            .actions_taken
            .iter()
            .map(|a| format!("{} ({})", a.action_type, a.status.as_str()))
            .collect();
        section.push_str(&format!(
            "| {} {} | `{}` | {} | {} |\n",
            priority.emoji(),
            priority,
            source_of(response),
            response.classification.intent,
            actions.join(", ")
        ));
    }
    section.push('\n');
    section
}

fn generate_documents_section(documents: &[ProcessResponse]) -> String {
    let mut section = String::new();

    section.push_str("## Documents\n\n");
    if documents.is_empty() {
        section.push_str("No documents were processed.\n\n");
        return section;
    }

    for response in documents {
        section.push_str(&generate_document_block(response));
    }
    section
}

fn generate_document_block(response: &ProcessResponse) -> String {
    let mut block = String::new();
    let result = &response.result;

    block.push_str(&format!("### `{}`\n\n", source_of(response)));
    block.push_str(&format!(
        "- **Format:** {} | **Intent:** {} ({:.0}%)\n",
        response.classification.format,
        response.classification.intent,
        response.classification.confidence * 100.0
    ));
    if let Some(ref agent) = response.classification.routed_agent {
        block.push_str(&format!("- **Agent:** {}\n", agent));
    }
    let status = match result.status {
        ProcessingStatus::Processed if result.valid => "processed".to_string(),
        ProcessingStatus::Processed => "processed, invalid".to_string(),
        ProcessingStatus::Error => format!(
            "error: {}",
            result.error.as_deref().unwrap_or("unknown error")
        ),
    };
    block.push_str(&format!("- **Status:** {}\n", status));
    block.push_str(&format!("- **Process:** `{}`\n", response.process_id));

    let excerpt = result.text_excerpt();
    if !excerpt.is_empty() {
        block.push_str(&format!("\n> {}\n", excerpt.replace('\n', "\n> ")));
    }

    if !result.anomalies.is_empty() {
        block.push_str("\n**Anomalies:**\n\n");
        for anomaly in &result.anomalies {
            block.push_str(&format!("- {}\n", anomaly));
        }
    }

    if !response.actions.actions_taken.is_empty() {
        block.push_str("\n**Actions:**\n\n");
        for action in &response.actions.actions_taken {
            block.push_str(&format!(
                "- {} `{}` -> `{}` ({}, {} attempt{})\n",
                action.priority.emoji(),
                action.action_type,
                action.endpoint,
                action.status.as_str(),
                action.attempts,
                if action.attempts == 1 { "" } else { "s" }
            ));
        }
    }

    block.push_str("\n---\n\n");
    block
}

fn generate_failures_section(failures: &[FailedDocument]) -> String {
    if failures.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Unreadable Files\n\n");
    for failure in failures {
        section.push_str(&format!("- `{}`: {}\n", failure.path, failure.error));
    }
    section.push('\n');
    section
}

fn generate_footer() -> String {
    format!(
        "*Generated by InvoiceFlow v{}*\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// Generate a JSON report.
pub fn generate_json_report(report: &BatchReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("Failed to serialize report")
}

/// Write a report to disk, creating parent directories.
pub fn write_report(content: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::aggregator::tests::response;
    use crate::models::{DocumentFormat, Intent, Priority};
    use crate::router::ActionStatus;
    use serde_json::json;

    fn create_test_report() -> BatchReport {
        let mut pdf = response(
            DocumentFormat::Pdf,
            Intent::Invoice,
            &[(Priority::Critical, ActionStatus::Success)],
        );
        pdf.debug.insert("source".into(), json!("inbox/march.pdf"));
        pdf.result.anomalies = vec!["Total exceeds 10000".into()];
        pdf.result.set_text_excerpt("Invoice INV-7 total 12000");

        let email = response(DocumentFormat::Email, Intent::Complaint, &[]);

        BatchReport::new(
            ReportMetadata {
                generated_at: Utc::now(),
                inputs: vec!["inbox".into()],
                documents_processed: 2,
                documents_failed: 1,
                duration_seconds: 1.5,
                model: None,
                live_actions: false,
            },
            vec![pdf, email],
            vec![FailedDocument {
                path: "inbox/locked.pdf".into(),
                error: "permission denied".into(),
            }],
        )
    }

    #[test]
    fn test_generate_markdown_report() {
        let report = create_test_report();
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# InvoiceFlow Batch Report"));
        assert!(markdown.contains("## Summary"));
        assert!(markdown.contains("## Most Urgent"));
        assert!(markdown.contains("`inbox/march.pdf`"));
        assert!(markdown.contains("Total exceeds 10000"));
        assert!(markdown.contains("> Invoice INV-7 total 12000"));
        assert!(markdown.contains("## Unreadable Files"));
        assert!(markdown.contains("keyword scoring only"));
    }

    #[test]
    fn test_urgent_section_ranks_by_priority() {
        let report = create_test_report();
        let section = generate_urgent_section(&report.documents);
        assert!(section.contains("🔴 critical"));
        // the e-mail routed nothing
        assert!(!section.contains("proc-Email"));
    }

    #[test]
    fn test_count_table_sorted_by_count() {
        let mut counts = std::collections::BTreeMap::new();
        counts.insert("Email".to_string(), 1);
        counts.insert("PDF".to_string(), 3);
        let table = count_table("Format", &counts);
        let pdf = table.find("| PDF |").unwrap();
        let email = table.find("| Email |").unwrap();
        assert!(pdf < email);
    }

    #[test]
    fn test_generate_json_report() {
        let report = create_test_report();
        let json = generate_json_report(&report).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["summary"]["total"], 2);
        assert_eq!(parsed["failures"][0]["path"], "inbox/locked.pdf");
        assert_eq!(parsed["documents"][0]["classification"]["format"], "PDF");
    }

    #[test]
    fn test_write_report_creates_parent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out").join("report.md");
        write_report("# hi\n", &path).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "# hi\n");
    }
}
