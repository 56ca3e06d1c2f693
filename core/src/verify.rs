//! End-to-end answer verification: extract, recompute, summarize.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::claims::{Claim, ClaimExtractor};
use crate::recompute::{DEFAULT_TOLERANCE_PCT, VerificationResult, recompute_metrics};
use crate::table::{Table, TableFilters};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VerificationSummary {
    #[serde(default)]
    pub has_numeric_claims: bool,
    /// `true` only when every evaluable claim passed; `None` when nothing
    /// could be evaluated.
    #[serde(default)]
    pub grounded_accuracy_pass: Option<bool>,
    #[serde(default)]
    pub claims_verified: usize,
    #[serde(default)]
    pub claims_passed: usize,
    #[serde(default)]
    pub claims_failed: usize,
    #[serde(default)]
    pub verification_results: Vec<VerificationResult>,
    #[serde(default)]
    pub all_claims: Vec<Claim>,
}

impl VerificationSummary {
    pub fn from_results(claims: Vec<Claim>, results: Vec<VerificationResult>) -> Self {
        let verified: Vec<bool> = results.iter().filter_map(|r| r.pass).collect();
        let passed = verified.iter().filter(|pass| **pass).count();

        Self {
            has_numeric_claims: !claims.is_empty(),
            grounded_accuracy_pass: (!verified.is_empty()).then(|| passed == verified.len()),
            claims_verified: verified.len(),
            claims_passed: passed,
            claims_failed: verified.len() - passed,
            verification_results: results,
            all_claims: claims,
        }
    }
}

pub struct AnswerVerifier {
    extractor: ClaimExtractor,
    tolerance_pct: f64,
}

impl Default for AnswerVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE_PCT)
    }
}

impl AnswerVerifier {
    pub fn new(tolerance_pct: f64) -> Self {
        Self {
            extractor: ClaimExtractor::default(),
            tolerance_pct,
        }
    }

    pub fn tolerance_pct(&self) -> f64 {
        self.tolerance_pct
    }

    pub fn verify(&self, answer_text: &str, table: &Table, dataset: &str, filters: &TableFilters) -> VerificationSummary {
        self.verify_with_tolerance(answer_text, table, dataset, filters, self.tolerance_pct)
    }

    pub fn verify_with_tolerance(
        &self,
        answer_text: &str,
        table: &Table,
        dataset: &str,
        filters: &TableFilters,
        tolerance_pct: f64,
    ) -> VerificationSummary {
        let claims = self.extractor.extract(answer_text);
        if claims.is_empty() {
            return VerificationSummary::default();
        }
        let results = recompute_metrics(&claims, table, dataset, filters, tolerance_pct);
        tracing::debug!(
            dataset,
            claims = claims.len(),
            evaluable = results.iter().filter(|r| r.pass.is_some()).count(),
            "Verified answer claims"
        );
        VerificationSummary::from_results(claims, results)
    }
}

pub fn verify_answer(
    answer_text: &str,
    table: &Table,
    dataset: &str,
    filters: &TableFilters,
    tolerance_pct: f64,
) -> VerificationSummary {
    AnswerVerifier::new(tolerance_pct).verify(answer_text, table, dataset, filters)
}
