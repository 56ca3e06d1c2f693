//! Dataset routing correctness.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Datasets the assistant can route to, in detection priority order.
pub const KNOWN_DATASETS: [&str; 2] = ["salesforce", "amadeus"];

/// The dataset named in a query, if any.
pub fn detect_dataset_mention(query: &str) -> Option<&'static str> {
    let lowered = query.to_lowercase();
    KNOWN_DATASETS
        .into_iter()
        .find(|dataset| lowered.contains(dataset))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RouterDecision {
    pub selected: String,
    pub should_have_selected: Option<String>,
    /// `None` when the query did not name a dataset.
    pub correct: Option<bool>,
}

impl RouterDecision {
    pub fn evaluate(selected: &str, query: Option<&str>) -> Self {
        let should_have_selected = query.and_then(detect_dataset_mention);
        Self {
            selected: selected.to_string(),
            correct: should_have_selected.map(|expected| expected == selected),
            should_have_selected: should_have_selected.map(str::to_string),
        }
    }
}
