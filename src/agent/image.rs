//! Invoice extraction from OCR text of scanned images.

use serde_json::json;

use super::classifier::score_intent;
use super::pdf::{extract_invoice_fields, suggested_action_for};
use super::ExtractionAgent;
use crate::models::{excerpt, AgentOutput, Document, DocumentFormat};

#[derive(Debug, Default)]
pub struct ImageAgent;

impl ExtractionAgent for ImageAgent {
    fn name(&self) -> &'static str {
        "image_agent"
    }

    fn process(&self, doc: &Document) -> AgentOutput {
        let mut output = AgentOutput::new(DocumentFormat::Image);
        let text = doc.text.trim();

        if text.is_empty() {
            let reason = doc
                .note("ocr_error")
                .or_else(|| doc.note("ocr_warning"))
                .unwrap_or("No text could be extracted from the image")
                .to_string();
            output.valid = false;
            output.anomalies.push(reason.clone());
            output.fields.insert("ocr_text".into(), json!(""));
            output.set_text_excerpt(format!("Error: {}", reason));
            output.action = Some("log_alert".to_string());
            output.suggested_action = Some(suggested_action_for(
                "log_alert",
                format!("Image could not be read: {}", reason),
            ));
            return output;
        }

        let fields = extract_invoice_fields(text);
        let intent = score_intent(text).intent;
        fields.write_into(&mut output);
        output.fields.insert("ocr_text".into(), json!(text));
        output.fields.insert("intent".into(), json!(intent));
        output.flags = fields.flags.clone();

        output.set_text_excerpt(format!(
            "{}\n\nExtracted Text (first 300 chars):\n{}",
            fields.summary(),
            excerpt(text, 300)
        ));

        let label = fields.action_label();
        let details = if output.flags.is_empty() {
            "Scanned invoice stored without flags".to_string()
        } else {
            output.flags.join("; ")
        };
        output.action = Some(label.to_string());
        output.suggested_action = Some(suggested_action_for(label, details));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;

    #[test]
    fn test_scanned_high_value_invoice() {
        let doc = Document::new(
            DocumentFormat::Image,
            "INVOICE #881\nDate: 2024/01/02\nTotal Due: $15,000.00",
        );
        let output = ImageAgent.process(&doc);
        assert!(output.valid);
        assert_eq!(output.fields["invoice_number"], "881");
        assert_eq!(output.fields["invoice_total"], json!(15000.0));
        assert_eq!(output.fields["intent"], "Invoice");
        assert_eq!(output.action.as_deref(), Some("flag_high_value_invoice"));
        let action = output.suggested_action.as_ref().unwrap();
        assert_eq!(action.endpoint, "/risk/alert");
        assert_eq!(action.priority, Priority::High);
        assert!(output.text_excerpt().contains("Extracted Text (first 300 chars):"));
    }

    #[test]
    fn test_scanned_billed_to_layouts() {
        let doc = Document::new(
            DocumentFormat::Image,
            "INVOICE #12\nBilled To:\nGlobex Ltd\nTotal: $10.00",
        );
        let output = ImageAgent.process(&doc);
        assert_eq!(output.fields["billed_to"], "Globex Ltd");

        let doc = Document::new(DocumentFormat::Image, "INVOICE #13\nTotal: $10.00");
        let output = ImageAgent.process(&doc);
        assert!(!output.fields.contains_key("billed_to"));
    }

    #[test]
    fn test_empty_ocr_text_is_invalid() {
        let mut doc = Document::new(DocumentFormat::Image, "  ");
        doc.metadata
            .insert("ocr_error".into(), json!("Cannot connect to http://localhost:11434/api/chat"));
        let output = ImageAgent.process(&doc);
        assert!(!output.valid);
        assert_eq!(output.action.as_deref(), Some("log_alert"));
        assert!(output.anomalies[0].starts_with("Cannot connect"));
        assert_eq!(
            output.suggested_action.unwrap().endpoint,
            "/alerts/data_quality"
        );
    }
}
