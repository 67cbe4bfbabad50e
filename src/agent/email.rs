//! E-mail field extraction with tone and urgency detection.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::ExtractionAgent;
use crate::models::{excerpt, AgentOutput, Document, DocumentFormat, Priority, SuggestedAction};

/// Tone phrase lists in scoring order. Ties go to the earlier tone.
const TONE_PATTERNS: [(&str, &[&str]); 4] = [
    (
        "angry",
        &[
            "furious",
            "angry",
            "outraged",
            "frustrated",
            "annoyed",
            "terrible service",
            "disappointed",
            "unacceptable",
            "worst",
            "complaint",
            "demanding",
            "upset",
            "unprofessional",
            "never again",
            "escalate",
            "incompetent",
            "!!",
            "???",
        ],
    ),
    (
        "threatening",
        &[
            "lawyer",
            "legal action",
            "lawsuit",
            "sue",
            "court",
            "legal team",
            "attorney",
            "consequences",
            "demand",
            "immediately",
            "or else",
            "ultimatum",
            "deadline",
            "compensation",
            "media",
            "public",
            "expose",
            "escalate to",
            "regulatory",
        ],
    ),
    (
        "urgent",
        &[
            "urgent",
            "immediately",
            "asap",
            "emergency",
            "critical",
            "time-sensitive",
            "deadline",
            "urgent matter",
            "promptly",
            "without delay",
            "as soon as possible",
            "pressing",
            "high priority",
            "expedite",
            "now",
            "today",
        ],
    ),
    (
        "polite",
        &[
            "please",
            "thank you",
            "appreciate",
            "grateful",
            "kindly",
            "regards",
            "sincerely",
            "respectfully",
            "consideration",
            "understanding",
            "assistance",
            "help",
            "support",
            "sorry to bother",
            "at your convenience",
            "when possible",
        ],
    ),
];

static FROM: Lazy<Regex> = Lazy::new(|| header_regex("from"));
static SUBJECT: Lazy<Regex> = Lazy::new(|| header_regex("subject"));
static TO: Lazy<Regex> = Lazy::new(|| header_regex("to"));
static DATE: Lazy<Regex> = Lazy::new(|| header_regex("date"));

fn header_regex(name: &str) -> Regex {
    Regex::new(&format!(r"(?im)^{}:[ \t]*([^\n]+)", name)).expect("static regex")
}

/// Tone scores of a text.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneAnalysis {
    pub primary_tone: &'static str,
    pub confidence: f64,
    /// Score per matching tone, in scoring order.
    pub scores: Vec<(&'static str, f64)>,
}

impl ToneAnalysis {
    pub fn score(&self, tone: &str) -> Option<f64> {
        self.scores
            .iter()
            .find(|(name, _)| *name == tone)
            .map(|(_, s)| *s)
    }
}

/// Score the four tones by phrase occurrences.
pub fn detect_tone(text: &str) -> ToneAnalysis {
    let lower = text.to_lowercase();
    let mut scores = Vec::new();

    for (tone, patterns) in TONE_PATTERNS {
        let matches = patterns.iter().filter(|p| lower.contains(*p)).count();
        if matches > 0 {
            scores.push((tone, (0.4 + matches as f64 * 0.1).min(0.95)));
        }
    }

    let mut best: Option<(&'static str, f64)> = None;
    for &(tone, score) in &scores {
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((tone, score));
        }
    }

    match best {
        Some((primary_tone, confidence)) => ToneAnalysis {
            primary_tone,
            confidence,
            scores,
        },
        None => ToneAnalysis {
            primary_tone: "neutral",
            confidence: 0.6,
            scores: vec![("neutral", 0.6)],
        },
    }
}

/// Urgency derived from tone scores.
pub fn urgency_for(tone: &ToneAnalysis) -> &'static str {
    if tone.score("urgent").is_some_and(|s| s > 0.6) {
        "high"
    } else if tone.score("angry").is_some_and(|s| s > 0.7) {
        "high"
    } else if tone.score("threatening").is_some_and(|s| s > 0.5) {
        "critical"
    } else {
        "normal"
    }
}

/// Follow-up action for a tone and urgency combination.
pub fn determine_action(tone: &str, urgency: &str, subject: &str) -> SuggestedAction {
    if tone == "threatening" || urgency == "critical" {
        SuggestedAction::new(
            "escalate",
            "crm",
            Priority::Critical,
            format!("Escalate to legal/management immediately - {}", subject),
            "/crm/escalate",
        )
    } else if tone == "angry" && urgency == "high" {
        SuggestedAction::new(
            "escalate",
            "crm",
            Priority::High,
            format!("Customer is upset - {}", subject),
            "/crm/escalate",
        )
    } else if urgency == "high" {
        SuggestedAction::new(
            "flag",
            "support",
            Priority::High,
            format!("Urgent issue - {}", subject),
            "/support/create_ticket",
        )
    } else if tone == "polite" && urgency == "normal" {
        SuggestedAction::new(
            "log",
            "crm",
            Priority::Normal,
            format!("Routine request - {}", subject),
            "/crm/log_communication",
        )
    } else {
        SuggestedAction::new(
            "log",
            "system",
            Priority::Low,
            format!("Standard message - {}", subject),
            "/system/log",
        )
    }
}

fn header(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Everything after the first blank line, or the whole text.
fn split_body(text: &str) -> &str {
    match text.split_once("\n\n") {
        Some((_, rest)) if !rest.trim().is_empty() => rest.trim(),
        _ => text,
    }
}

/// Extracts headers, tone and urgency from e-mail sources.
#[derive(Debug, Default)]
pub struct EmailAgent;

impl ExtractionAgent for EmailAgent {
    fn name(&self) -> &'static str {
        "email_agent"
    }

    fn process(&self, doc: &Document) -> AgentOutput {
        let text = doc.text.replace("\r\n", "\n");
        let mut output = AgentOutput::new(DocumentFormat::Email);

        let sender = header(&FROM, &text).unwrap_or_else(|| "Unknown".to_string());
        let subject = header(&SUBJECT, &text).unwrap_or_else(|| "No Subject".to_string());
        let recipient = header(&TO, &text).unwrap_or_else(|| "Unknown".to_string());
        let date = header(&DATE, &text)
            .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string());

        let body = split_body(&text);
        let first_para = body.split("\n\n").next().unwrap_or(body);

        let tone = detect_tone(body);
        let urgency = urgency_for(&tone);
        let action = determine_action(tone.primary_tone, urgency, &subject);
        let tracking_id = format!("EMAIL-{}", rand::thread_rng().gen_range(10000..=99999));

        let tone_details: Map<String, Value> = tone
            .scores
            .iter()
            .map(|(name, score)| (name.to_string(), json!(score)))
            .collect();

        let fields = &mut output.fields;
        fields.insert("sender".into(), json!(sender));
        fields.insert("subject".into(), json!(subject));
        fields.insert("recipient".into(), json!(recipient));
        fields.insert("date".into(), json!(date));
        fields.insert("body".into(), json!(body));
        fields.insert("issue".into(), json!(subject));
        fields.insert("request".into(), json!(excerpt(first_para, 200)));
        fields.insert("tone".into(), json!(tone.primary_tone));
        fields.insert("tone_confidence".into(), json!(tone.confidence));
        fields.insert("tone_details".into(), Value::Object(tone_details));
        fields.insert("urgency".into(), json!(urgency));
        fields.insert("tracking_id".into(), json!(tracking_id));

        let summary = [
            format!("Sender: {}", sender),
            format!("Subject: {}", subject),
            format!("Urgency: {}", urgency),
            format!(
                "Tone: {} (confidence: {:.2})",
                tone.primary_tone, tone.confidence
            ),
            format!("Action: {} ({} priority)", action.action, action.priority),
            String::new(),
            "Email Body (first 300 chars):".to_string(),
            excerpt(body, 300),
        ];
        output.set_text_excerpt(summary.join("\n"));

        output.summary = Some(format!("Email from {} with subject: {}", sender, subject));
        output.suggested_action = Some(action);
        output.tracking_id = Some(tracking_id);
        output
    }
}
