use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use serde::Serialize;
use taskmine_core::recompute::DEFAULT_TOLERANCE_PCT;
use taskmine_core::routing::RouterDecision;
use taskmine_core::schema::{HallucinationCheck, SchemaDictionary};
use taskmine_core::table::{Table, TableFilters, filter_table};
use taskmine_core::verify::{VerificationSummary, verify_answer};

use crate::util::{exit_error, print_json, read_text};

#[derive(Args, Clone)]
pub struct VerifyArgs {
    /// Dataset file (JSON array of rows, or JSON Lines)
    #[arg(long)]
    pub data: PathBuf,

    /// Dataset name the answer was generated for (e.g. salesforce)
    #[arg(long)]
    pub dataset: String,

    /// File holding the answer text ("-" reads stdin)
    #[arg(long)]
    pub answer: String,

    /// Row filters as JSON, e.g. '{"team": "Sales"}'
    #[arg(long)]
    pub filters: Option<String>,

    /// Relative tolerance for non-count metrics
    #[arg(long, default_value_t = DEFAULT_TOLERANCE_PCT)]
    pub tolerance: f64,

    /// Original question, used to check dataset routing
    #[arg(long)]
    pub query: Option<String>,
}

#[derive(Serialize)]
pub struct VerifyReport {
    pub dataset: String,
    pub slice_rows: usize,
    pub verification: VerificationSummary,
    pub hallucination_check: HallucinationCheck,
    pub router: Option<RouterDecision>,
}

pub fn build_report(
    table: Table,
    dataset: &str,
    answer_text: &str,
    filters: &TableFilters,
    tolerance_pct: f64,
    query: Option<&str>,
) -> VerifyReport {
    let slice = filter_table(&table, filters);
    let verification = verify_answer(answer_text, &slice, dataset, filters, tolerance_pct);
    let schema = SchemaDictionary::new(BTreeMap::from([(dataset.to_string(), Arc::new(table))]));
    let hallucination_check = schema.validate_references(answer_text, dataset);

    VerifyReport {
        dataset: dataset.to_string(),
        slice_rows: slice.len(),
        verification,
        hallucination_check,
        router: query.map(|q| RouterDecision::evaluate(dataset, Some(q))),
    }
}

pub fn run(args: VerifyArgs) -> i32 {
    if !args.tolerance.is_finite() || args.tolerance < 0.0 {
        exit_error("--tolerance must be a non-negative number", None);
    }
    let filters: TableFilters = match args.filters.as_deref() {
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
            exit_error(
                &format!("Invalid JSON in --filters: {e}"),
                Some("Keys: case_id, team, resource (string or list), time_range {start, end}"),
            )
        }),
        None => TableFilters::default(),
    };
    let table = Table::load(&args.data)
        .unwrap_or_else(|e| exit_error(&format!("Failed to load dataset: {e}"), None));
    let answer_text = read_text(&args.answer).unwrap_or_else(|e| exit_error(&e, None));

    tracing::debug!(dataset = %args.dataset, rows = table.len(), "Loaded dataset for verification");
    let report = build_report(
        table,
        &args.dataset,
        &answer_text,
        &filters,
        args.tolerance,
        args.query.as_deref(),
    );
    print_json(&report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> Table {
        Table::from_json_str(
            &json!([
                {"case_id": "A", "team": "Sales", "activity": "Review", "duration_seconds": 60},
                {"case_id": "B", "team": "Ops", "activity": "Triage", "duration_seconds": 120},
                {"case_id": "C", "team": "Ops", "activity": "Review", "duration_seconds": 180},
            ])
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn report_checks_claims_against_the_filtered_slice() {
        let filters = TableFilters::team("Ops");
        let report = build_report(table(), "amadeus", "cases: 2", &filters, 0.02, None);
        assert_eq!(report.slice_rows, 2);
        assert_eq!(report.verification.claims_passed, 1);
        assert_eq!(report.verification.grounded_accuracy_pass, Some(true));
        assert!(report.router.is_none());
    }

    #[test]
    fn report_flags_unknown_references_against_the_full_table() {
        let report = build_report(
            table(),
            "amadeus",
            "The team 'Finance' is slowest.",
            &TableFilters::team("Ops"),
            0.02,
            Some("amadeus teams"),
        );
        assert!(report.hallucination_check.checked);
        assert!(report.hallucination_check.has_hallucinations);
        assert_eq!(report.router.and_then(|r| r.correct), Some(true));
    }
}
