//! Batch aggregation and statistics.
//!
//! Rolls the responses of a batch run up into the counts shown in
//! reports and on the console.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::{Priority, ProcessingStatus};
use crate::pipeline::ProcessResponse;
use crate::router::ActionStatus;

/// Counts over a set of processed documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub processed: usize,
    pub errors: usize,
    pub invalid: usize,
    pub anomalies: usize,
    pub by_format: BTreeMap<String, usize>,
    pub by_intent: BTreeMap<String, usize>,
    /// Route status label to count.
    pub by_route_status: BTreeMap<String, usize>,
    pub actions_succeeded: usize,
    pub actions_failed: usize,
    /// Actions delivered with high or critical priority.
    pub escalations: usize,
}

impl BatchSummary {
    pub fn from_responses(responses: &[ProcessResponse]) -> Self {
        let mut summary = Self {
            total: responses.len(),
            ..Default::default()
        };

        for response in responses {
            match response.result.status {
                ProcessingStatus::Processed => summary.processed += 1,
                ProcessingStatus::Error => summary.errors += 1,
            }
            if !response.result.valid {
                summary.invalid += 1;
            }
            summary.anomalies += response.result.anomalies.len();

            *summary
                .by_format
                .entry(response.classification.format.label().to_string())
                .or_default() += 1;
            *summary
                .by_intent
                .entry(response.classification.intent.label().to_string())
                .or_default() += 1;
            *summary
                .by_route_status
                .entry(response.actions.status.label().to_string())
                .or_default() += 1;

            for action in &response.actions.actions_taken {
                match action.status {
                    ActionStatus::Success => summary.actions_succeeded += 1,
                    ActionStatus::Failed => summary.actions_failed += 1,
                    ActionStatus::Pending => {}
                }
                if action.priority.is_escalation() {
                    summary.escalations += 1;
                }
            }
        }

        summary
    }
}

/// Highest priority among the actions routed for a document.
pub fn highest_priority(response: &ProcessResponse) -> Option<Priority> {
    response
        .actions
        .actions_taken
        .iter()
        .map(|a| a.priority)
        .max()
}

/// The `n` documents with the most urgent routed actions, most urgent first.
///
/// Documents without actions are left out. Ties keep batch order.
pub fn most_urgent(responses: &[ProcessResponse], n: usize) -> Vec<&ProcessResponse> {
    let mut ranked: Vec<(Priority, &ProcessResponse)> = responses
        .iter()
        .filter_map(|r| highest_priority(r).map(|p| (p, r)))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));
    ranked.into_iter().take(n).map(|(_, r)| r).collect()
}

/// Group responses by document format label.
pub fn group_by_format(responses: &[ProcessResponse]) -> BTreeMap<String, Vec<&ProcessResponse>> {
    let mut grouped: BTreeMap<String, Vec<&ProcessResponse>> = BTreeMap::new();
    for response in responses {
        grouped
            .entry(response.classification.format.label().to_string())
            .or_default()
            .push(response);
    }
    grouped
}
