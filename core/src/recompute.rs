//! Recompute claimed values from the data and compare within tolerance.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::claims::Claim;
use crate::columns::LogicalField;
use crate::metrics::{
    AgingBucket, PanelMetrics, case_aging_buckets, compute_panel_metrics, flow_efficiency,
    handoffs, throughput_minutes,
};
use crate::stats;
use crate::table::{Table, TableFilters, filter_table};

/// Relative tolerance used when the caller does not supply one.
pub const DEFAULT_TOLERANCE_PCT: f64 = 0.02;
/// Count-like metrics pass within this absolute difference.
pub const COUNT_ABS_TOLERANCE: f64 = 1.0;
pub const NOT_RECOMPUTABLE: &str = "Metric not recomputable";

const COUNT_LIKE_NAMES: &[&str] = &["cases", "case_count", "users", "activities", "teams", "handoffs"];

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("metric {metric} produced a non-finite value")]
    NonFinite { metric: String },
}

/// Outcome of checking one claim. `pass` is `None` when the claim could not
/// be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VerificationResult {
    pub name: String,
    pub claimed: f64,
    #[serde(default)]
    pub recomputed: Option<f64>,
    #[serde(default)]
    pub pass: Option<bool>,
    #[serde(default)]
    pub abs_err: Option<f64>,
    #[serde(default)]
    pub pct_err: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl VerificationResult {
    fn unknown(claim: &Claim, error: impl Into<String>) -> Self {
        Self {
            name: claim.name.clone(),
            claimed: claim.value,
            recomputed: None,
            pass: None,
            abs_err: None,
            pct_err: None,
            error: Some(error.into()),
        }
    }

    fn compared(claim: &Claim, recomputed: f64, tolerance_pct: f64) -> Self {
        let abs_err = (claim.value - recomputed).abs();
        let pct_err = if recomputed != 0.0 {
            abs_err / recomputed.abs()
        } else if abs_err > tolerance_pct {
            abs_err
        } else {
            0.0
        };
        let pass = if is_count_like(&claim.name) {
            abs_err <= COUNT_ABS_TOLERANCE
        } else {
            pct_err <= tolerance_pct
        };
        Self {
            name: claim.name.clone(),
            claimed: claim.value,
            recomputed: Some(recomputed),
            pass: Some(pass),
            abs_err: Some(abs_err),
            pct_err: Some(pct_err),
            error: None,
        }
    }
}

fn is_count_like(name: &str) -> bool {
    let name = name.to_lowercase();
    COUNT_LIKE_NAMES.contains(&name.as_str()) || name.contains("count") || name.contains("aging")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationStat {
    Mean,
    Median,
    Max,
}

impl DurationStat {
    fn from_name(name: &str) -> Self {
        if name.contains("median") {
            DurationStat::Median
        } else if name.contains("max") {
            DurationStat::Max
        } else {
            DurationStat::Mean
        }
    }

    fn apply(self, values: &[f64]) -> Option<f64> {
        match self {
            DurationStat::Mean => stats::mean(values),
            DurationStat::Median => stats::median(values),
            DurationStat::Max => stats::max(values),
        }
    }
}

/// How a claim name maps onto a recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricRoute {
    FlowEfficiency,
    Handoffs,
    Throughput,
    Aging(Option<AgingBucket>),
    CaseCount,
    Duration(DurationStat),
    DistinctUsers,
    DistinctActivities,
    DistinctTeams,
    /// Fall through to the panel lookup.
    Panel,
}

/// Route a claim by name. Exact aliases are checked before substring
/// fallbacks, in a fixed order.
pub fn route_metric(name: &str, raw_text: &str) -> MetricRoute {
    let name = name.trim().to_lowercase();
    let is = |aliases: &[&str]| aliases.contains(&name.as_str());

    if is(&["flow_efficiency", "flow efficiency", "efficiency"]) || name.contains("flow_efficiency") {
        MetricRoute::FlowEfficiency
    } else if is(&["handoffs", "handoff", "avg_handoffs"]) || name.contains("handoff") {
        MetricRoute::Handoffs
    } else if is(&["throughput_minutes", "throughput", "avg_throughput"]) || name.contains("throughput") {
        MetricRoute::Throughput
    } else if name.contains("aging") || name.contains("age") {
        MetricRoute::Aging(aging_bucket(&name, raw_text))
    } else if is(&["cases", "case_count", "case count"]) {
        MetricRoute::CaseCount
    } else if name.contains("duration") {
        MetricRoute::Duration(DurationStat::from_name(&name))
    } else if is(&["users", "user_count", "unique_users"]) {
        MetricRoute::DistinctUsers
    } else if is(&["activities", "activity_count", "unique_activities"]) {
        MetricRoute::DistinctActivities
    } else if is(&["teams", "team_count", "unique_teams"]) {
        MetricRoute::DistinctTeams
    } else {
        MetricRoute::Panel
    }
}

/// Pick the aging bucket a claim refers to. Explicit `>14d` wins, then the
/// ranged buckets; a bare `14d` means the stale bucket.
fn aging_bucket(name: &str, raw_text: &str) -> Option<AgingBucket> {
    let mentions = |needles: &[&str]| {
        needles
            .iter()
            .any(|needle| name.contains(needle) || raw_text.contains(needle))
    };
    if mentions(&[">14d"]) {
        Some(AgingBucket::Stale)
    } else if mentions(&["8-14", "8_14"]) {
        Some(AgingBucket::Aging)
    } else if mentions(&["0-7", "0_7"]) {
        Some(AgingBucket::Recent)
    } else if mentions(&["14d"]) {
        Some(AgingBucket::Stale)
    } else {
        None
    }
}

static SLICE_TEAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"team=([^,]+)").expect("valid slice team regex"));
static SLICE_RESOURCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"resource=([^,]+)").expect("valid slice resource regex"));

/// Turn a `team=X, resource=Y` slice back into filters. Slices in any other
/// shape do not narrow the table.
pub fn slice_filters(slice: &str) -> Option<TableFilters> {
    let capture = |re: &Regex| {
        re.captures(slice)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let team = capture(&SLICE_TEAM_RE);
    let resource = capture(&SLICE_RESOURCE_RE);
    if team.is_none() && resource.is_none() {
        return None;
    }
    Some(TableFilters {
        team: team.into_iter().collect(),
        resource: resource.into_iter().collect(),
        ..TableFilters::default()
    })
}

fn recompute_value(claim: &Claim, table: &Table, panel: &PanelMetrics) -> Result<Option<f64>, MetricError> {
    let distinct = |field: LogicalField| table.resolve(field).map(|c| table.distinct_count(c) as f64);

    let value = match route_metric(&claim.name, &claim.raw_text) {
        MetricRoute::FlowEfficiency => Some(flow_efficiency(table)),
        MetricRoute::Handoffs => Some(handoffs(table)),
        MetricRoute::Throughput => Some(throughput_minutes(table)),
        MetricRoute::Aging(Some(bucket)) => Some(case_aging_buckets(table).get(bucket) as f64),
        MetricRoute::Aging(None) => None,
        MetricRoute::CaseCount => Some(match table.resolve(LogicalField::CaseId) {
            Some(column) => table.distinct_count(column) as f64,
            None => table.len() as f64,
        }),
        MetricRoute::Duration(stat) => table
            .resolve(LogicalField::Duration)
            .and_then(|c| stat.apply(&table.numeric_values(c))),
        MetricRoute::DistinctUsers => distinct(LogicalField::User),
        MetricRoute::DistinctActivities => distinct(LogicalField::Activity),
        MetricRoute::DistinctTeams => distinct(LogicalField::Team),
        MetricRoute::Panel => None,
    };

    match value.or_else(|| panel.lookup(&claim.name)) {
        Some(v) if !v.is_finite() => Err(MetricError::NonFinite {
            metric: claim.name.clone(),
        }),
        other => Ok(other),
    }
}

/// Recompute a single claim against `table`, narrowed by the claim's slice.
pub fn recompute_claim(
    claim: &Claim,
    table: &Table,
    panel: &PanelMetrics,
    tolerance_pct: f64,
) -> VerificationResult {
    let sliced;
    let working = match claim.slice.as_deref().and_then(slice_filters) {
        Some(filters) => {
            sliced = filter_table(table, &filters);
            &sliced
        }
        None => table,
    };

    match recompute_value(claim, working, panel) {
        Ok(Some(recomputed)) => VerificationResult::compared(claim, recomputed, tolerance_pct),
        Ok(None) => VerificationResult::unknown(claim, NOT_RECOMPUTABLE),
        Err(err) => {
            tracing::warn!(metric = %claim.name, error = %err, "Metric recomputation failed");
            VerificationResult::unknown(claim, err.to_string())
        }
    }
}

/// One result per claim, in claim order.
pub fn recompute_metrics(
    claims: &[Claim],
    table: &Table,
    dataset: &str,
    filters: &TableFilters,
    tolerance_pct: f64,
) -> Vec<VerificationResult> {
    let panel = compute_panel_metrics(table, dataset, filters);
    claims
        .iter()
        .map(|claim| recompute_claim(claim, table, &panel, tolerance_pct))
        .collect()
}
