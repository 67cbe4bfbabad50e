//! Invoice field extraction for PDF documents.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ExtractionAgent;
use crate::models::{AgentOutput, Document, DocumentFormat, Priority, SuggestedAction};

/// Invoice totals above this amount are flagged.
pub const HIGH_VALUE_THRESHOLD: f64 = 10_000.0;

const COMPLIANCE_TERMS: [&str; 5] = ["gdpr", "fda", "hipaa", "pci", "sox"];

static TOTAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\btotal(?: amount due| due)?\s*:?\s*\$?([\d,]+\.?\d*)").expect("static regex")
});
static INVOICE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)invoice\s*#?\s*:?\s*(\d+)").expect("static regex"));
static INVOICE_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)date\s*:?\s*([\d\-/]+)").expect("static regex"));
static BILLED_TO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)billed to\s*:?\s*(.+)").expect("static regex"));
static SUBTOTAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)subtotal\s*:?\s*\$?([\d,]+\.?\d*)").expect("static regex"));
static TAX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\btax(?:\s*\([^)]*\))?\s*:?\s*\$?([\d,]+\.?\d*)").expect("static regex")
});
static LINE_ITEMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)Description\s+Quantity\s+Unit Price\s+Total\n(.+?)\nSubtotal")
        .expect("static regex")
});
static COLUMN_GAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").expect("static regex"));

/// One row of the invoice's item table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: String,
    pub unit_price: String,
    pub total: String,
}

/// Everything the invoice heuristics can pull out of a text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceFields {
    pub invoice_total: Option<f64>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<String>,
    pub billed_to: Option<String>,
    pub subtotal: Option<String>,
    pub tax: Option<String>,
    /// `None` when no item table was found, which differs from an empty table.
    pub line_items: Option<Vec<LineItem>>,
    pub flags: Vec<String>,
}

impl InvoiceFields {
    /// Action label for the extracted flags.
    pub fn action_label(&self) -> &'static str {
        if self.flags.iter().any(|f| f == "invoice_total_gt_10000") {
            "flag_high_value_invoice"
        } else if !self.flags.is_empty() {
            "flag_compliance_risk"
        } else {
            "store_ok"
        }
    }

    /// Write the extracted values into an agent's field map.
    pub fn write_into(&self, output: &mut AgentOutput) {
        let fields = &mut output.fields;
        if let Some(total) = self.invoice_total {
            fields.insert("invoice_total".to_string(), json!(total));
        }
        let strings = [
            ("invoice_number", &self.invoice_number),
            ("invoice_date", &self.invoice_date),
            ("billed_to", &self.billed_to),
            ("subtotal", &self.subtotal),
            ("tax", &self.tax),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                fields.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        if let Some(ref items) = self.line_items {
            fields.insert("line_items".to_string(), json!(items));
        }
    }

    /// Readable multi-line summary.
    pub fn summary(&self) -> String {
        let na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
        let mut lines = vec![
            format!("Invoice Number: {}", na(&self.invoice_number)),
            format!("Date: {}", na(&self.invoice_date)),
            format!("Billed To: {}", na(&self.billed_to)),
            String::new(),
            "Line Items:".to_string(),
        ];
        match self.line_items {
            Some(ref items) if !items.is_empty() => {
                for item in items {
                    lines.push(format!(
                        "  - {} x{} @ {} = {}",
                        item.description, item.quantity, item.unit_price, item.total
                    ));
                }
            }
            _ => lines.push("  (Not detected)".to_string()),
        }
        lines.push(String::new());
        lines.push(format!("Subtotal: {}", na(&self.subtotal)));
        lines.push(format!("Tax: {}", na(&self.tax)));
        lines.push(format!(
            "Total: {}",
            self.invoice_total
                .map(|t| t.to_string())
                .unwrap_or_else(|| "N/A".to_string())
        ));
        lines.join("\n")
    }
}

/// Run the invoice heuristics over a document text.
pub fn extract_invoice_fields(text: &str) -> InvoiceFields {
    let lower = text.to_lowercase();
    let mut fields = InvoiceFields::default();

    if let Some(caps) = TOTAL.captures(&lower) {
        if let Ok(total) = caps[1].replace(',', "").parse::<f64>() {
            fields.invoice_total = Some(total);
            if total > HIGH_VALUE_THRESHOLD {
                fields.flags.push("invoice_total_gt_10000".to_string());
            }
        }
    }

    let found: Vec<&str> = COMPLIANCE_TERMS
        .iter()
        .copied()
        .filter(|term| lower.contains(term))
        .collect();
    if !found.is_empty() {
        fields
            .flags
            .push(format!("policy_mentions: {}", found.join(", ")));
    }

    let first_group = |re: &Regex| re.captures(text).map(|c| c[1].trim().to_string());
    fields.invoice_number = first_group(&INVOICE_NUMBER);
    fields.invoice_date = first_group(&INVOICE_DATE);
    // a bare label at the end of the text backtracks onto its own colon
    fields.billed_to = first_group(&BILLED_TO)
        .filter(|s| s.chars().any(char::is_alphanumeric));
    fields.subtotal = first_group(&SUBTOTAL);
    fields.tax = first_group(&TAX);

    fields.line_items = LINE_ITEMS.captures(text).map(|caps| {
        caps[1]
            .trim()
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = COLUMN_GAP.split(line.trim()).collect();
                (parts.len() >= 4).then(|| LineItem {
                    description: parts[0].to_string(),
                    quantity: parts[1].to_string(),
                    unit_price: parts[2].to_string(),
                    total: parts[3].to_string(),
                })
            })
            .collect()
    });

    fields
}

/// Typed follow-up for a PDF action label.
pub fn suggested_action_for(label: &str, details: String) -> SuggestedAction {
    match label {
        "flag_high_value_invoice" => {
            SuggestedAction::new(label, "risk", Priority::High, details, "/risk/alert")
        }
        "flag_compliance_risk" => {
            SuggestedAction::new(label, "risk", Priority::Medium, details, "/risk/alert")
        }
        "log_alert" => SuggestedAction::new(
            label,
            "alerts",
            Priority::High,
            details,
            "/alerts/data_quality",
        ),
        _ => SuggestedAction::new(label, "storage", Priority::Low, details, "/store"),
    }
}

/// Extracts invoice and policy fields from PDF text.
#[derive(Debug, Default)]
pub struct PdfAgent;

impl ExtractionAgent for PdfAgent {
    fn name(&self) -> &'static str {
        "pdf_agent"
    }

    fn process(&self, doc: &Document) -> AgentOutput {
        let mut output = AgentOutput::new(DocumentFormat::Pdf);

        if let Some(err) = doc.note("pdf_error") {
            output.flags.push(format!("pdf_parse_error: {}", err));
            output.set_text_excerpt(format!("Error: {}", err));
            output.action = Some("log_alert".to_string());
            output.suggested_action = Some(suggested_action_for(
                "log_alert",
                format!("PDF could not be parsed: {}", err),
            ));
            return output;
        }

        let fields = extract_invoice_fields(&doc.text);
        fields.write_into(&mut output);
        output.set_text_excerpt(fields.summary());
        output.flags = fields.flags.clone();

        let label = fields.action_label();
        let details = if output.flags.is_empty() {
            "Invoice stored without flags".to_string()
        } else {
            output.flags.join("; ")
        };
        output.action = Some(label.to_string());
        output.suggested_action = Some(suggested_action_for(label, details));
        output
    }
}
