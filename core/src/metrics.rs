//! Deterministic process metrics over an event table.
//!
//! Every function is total: an empty table or a table without the columns a
//! metric needs yields a neutral value instead of an error.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::columns::LogicalField;
use crate::stats;
use crate::table::{Cell, Table, TableFilters};

/// Assumed wait between tasks when no timestamps are available.
pub const DEFAULT_WAIT_SECONDS: f64 = 300.0;
/// Flow efficiency reported when neither lead time nor an estimate exists.
pub const CONSERVATIVE_FLOW_EFFICIENCY: f64 = 0.5;
pub const AGING_RECENT_DAYS: f64 = 7.0;
pub const AGING_STALE_DAYS: f64 = 14.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Share of lead time spent working, in `[0, 1]`.
///
/// Lead time comes from per-case `max(end) - min(start)` when both columns
/// exist; otherwise it is estimated as work time plus a fixed wait per row.
pub fn flow_efficiency(table: &Table) -> f64 {
    if table.is_empty() {
        return 0.0;
    }
    let (Some(duration_col), Some(case_col)) = (
        table.resolve(LogicalField::Duration),
        table.resolve(LogicalField::CaseId),
    ) else {
        return 0.0;
    };

    let work_seconds: f64 = table.values(duration_col).filter_map(Cell::as_f64).sum();

    if let Some(lead_seconds) = observed_lead_time(table, case_col) {
        if lead_seconds > 0.0 {
            return clamp_unit(work_seconds / lead_seconds);
        }
    }

    let estimated_lead = work_seconds + table.len() as f64 * DEFAULT_WAIT_SECONDS;
    if estimated_lead > 0.0 {
        return clamp_unit(work_seconds / estimated_lead);
    }
    CONSERVATIVE_FLOW_EFFICIENCY
}

fn clamp_unit(ratio: f64) -> f64 {
    if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) }
}

fn observed_lead_time(table: &Table, case_col: &str) -> Option<f64> {
    let start = table
        .resolve(LogicalField::Start)
        .and_then(|c| table.column_index(c))?;
    let end = table
        .resolve(LogicalField::End)
        .and_then(|c| table.column_index(c))?;

    let mut total = 0.0;
    let mut observed = false;
    for rows in table.group_rows(case_col).values() {
        let first = rows
            .iter()
            .filter_map(|&r| table.cell(r, start).as_timestamp())
            .min();
        let last = rows
            .iter()
            .filter_map(|&r| table.cell(r, end).as_timestamp())
            .max();
        if let (Some(first), Some(last)) = (first, last) {
            total += (last - first).num_milliseconds() as f64 / 1000.0;
            observed = true;
        }
    }
    observed.then_some(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgingBucket {
    Recent,
    Aging,
    Stale,
}

impl AgingBucket {
    pub const fn label(self) -> &'static str {
        match self {
            AgingBucket::Recent => "0-7d",
            AgingBucket::Aging => "8-14d",
            AgingBucket::Stale => ">14d",
        }
    }

    fn for_age_days(days: f64) -> Self {
        if days <= AGING_RECENT_DAYS {
            AgingBucket::Recent
        } else if days <= AGING_STALE_DAYS {
            AgingBucket::Aging
        } else {
            AgingBucket::Stale
        }
    }
}

/// Distinct cases per age bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AgingBuckets {
    #[serde(rename = "0-7d", default)]
    pub recent: usize,
    #[serde(rename = "8-14d", default)]
    pub aging: usize,
    #[serde(rename = ">14d", default)]
    pub stale: usize,
}

impl AgingBuckets {
    pub fn get(&self, bucket: AgingBucket) -> usize {
        match bucket {
            AgingBucket::Recent => self.recent,
            AgingBucket::Aging => self.aging,
            AgingBucket::Stale => self.stale,
        }
    }

    pub fn total(&self) -> usize {
        self.recent + self.aging + self.stale
    }

    fn bump(&mut self, bucket: AgingBucket) {
        match bucket {
            AgingBucket::Recent => self.recent += 1,
            AgingBucket::Aging => self.aging += 1,
            AgingBucket::Stale => self.stale += 1,
        }
    }
}

/// Bucket cases by the age of their first event, measured against the
/// latest start timestamp in the table. Cases with no parseable start
/// timestamp are not counted.
pub fn case_aging_buckets(table: &Table) -> AgingBuckets {
    let mut buckets = AgingBuckets::default();
    if table.is_empty() {
        return buckets;
    }
    let (Some(case_col), Some(start_col)) = (
        table.resolve(LogicalField::CaseId),
        table.resolve(LogicalField::Start),
    ) else {
        return buckets;
    };
    let Some(start) = table.column_index(start_col) else {
        return buckets;
    };

    let Some(anchor) = table.values(start_col).filter_map(Cell::as_timestamp).max() else {
        return buckets;
    };

    for rows in table.group_rows(case_col).values() {
        let first = rows
            .iter()
            .filter_map(|&r| table.cell(r, start).as_timestamp())
            .min();
        if let Some(first) = first {
            let age_days = (anchor - first).num_milliseconds() as f64 / 1000.0 / SECONDS_PER_DAY;
            buckets.bump(AgingBucket::for_age_days(age_days));
        }
    }
    buckets
}

/// Mean per-case total duration, in minutes.
pub fn throughput_minutes(table: &Table) -> f64 {
    if table.is_empty() {
        return 0.0;
    }
    let (Some(duration_col), Some(case_col)) = (
        table.resolve(LogicalField::Duration),
        table.resolve(LogicalField::CaseId),
    ) else {
        return 0.0;
    };
    let Some(duration) = table.column_index(duration_col) else {
        return 0.0;
    };

    let per_case: Vec<f64> = table
        .group_rows(case_col)
        .values()
        .map(|rows| {
            rows.iter()
                .filter_map(|&r| table.cell(r, duration).as_f64())
                .sum::<f64>()
        })
        .collect();

    stats::mean(&per_case).map_or(0.0, |seconds| seconds / 60.0)
}

/// Mean number of user changes between time-adjacent events of a case.
pub fn handoffs(table: &Table) -> f64 {
    if table.is_empty() {
        return 0.0;
    }
    let (Some(case_col), Some(user_col)) = (
        table.resolve(LogicalField::CaseId),
        table.resolve(LogicalField::User),
    ) else {
        return 0.0;
    };
    let Some(user) = table.column_index(user_col) else {
        return 0.0;
    };
    let time = table
        .resolve(LogicalField::Start)
        .and_then(|c| table.column_index(c));

    let per_case: Vec<f64> = table
        .group_rows(case_col)
        .into_values()
        .map(|mut rows| {
            if let Some(time) = time {
                // Stable sort; rows without a parseable timestamp go last.
                rows.sort_by_key(|&r| {
                    let ts = table.cell(r, time).as_timestamp();
                    (ts.is_none(), ts)
                });
            }
            rows.windows(2)
                .filter(|pair| table.cell(pair[0], user).key() != table.cell(pair[1], user).key())
                .count() as f64
        })
        .collect();

    stats::mean(&per_case).unwrap_or(0.0)
}

/// The metric panel for one dataset slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PanelMetrics {
    pub dataset: String,
    pub filters: TableFilters,
    /// Number of rows in the slice.
    pub case_count: usize,
    pub flow_efficiency: f64,
    pub throughput_minutes: f64,
    pub handoffs: f64,
    pub aging_buckets: AgingBuckets,
    pub avg_duration_seconds: Option<f64>,
    pub median_duration_seconds: Option<f64>,
    pub max_duration_seconds: Option<f64>,
    pub unique_activities: Option<usize>,
    pub most_common_activity: Option<String>,
    pub unique_users: Option<usize>,
}

impl PanelMetrics {
    /// Look up a panel value by metric name.
    pub fn lookup(&self, name: &str) -> Option<f64> {
        match name {
            "case_count" => Some(self.case_count as f64),
            "flow_efficiency" => Some(self.flow_efficiency),
            "throughput_minutes" => Some(self.throughput_minutes),
            "handoffs" => Some(self.handoffs),
            "aging_0-7d" => Some(self.aging_buckets.recent as f64),
            "aging_8-14d" => Some(self.aging_buckets.aging as f64),
            "aging_>14d" => Some(self.aging_buckets.stale as f64),
            "avg_duration_seconds" => self.avg_duration_seconds,
            "median_duration_seconds" => self.median_duration_seconds,
            "max_duration_seconds" => self.max_duration_seconds,
            "unique_activities" => self.unique_activities.map(|n| n as f64),
            "unique_users" => self.unique_users.map(|n| n as f64),
            _ => None,
        }
    }
}

pub fn compute_panel_metrics(table: &Table, dataset: &str, filters: &TableFilters) -> PanelMetrics {
    let durations = table
        .resolve(LogicalField::Duration)
        .map(|c| table.numeric_values(c))
        .unwrap_or_default();
    let activity_col = table.resolve(LogicalField::Activity);

    PanelMetrics {
        dataset: dataset.to_string(),
        filters: filters.clone(),
        case_count: table.len(),
        flow_efficiency: flow_efficiency(table),
        throughput_minutes: throughput_minutes(table),
        handoffs: handoffs(table),
        aging_buckets: case_aging_buckets(table),
        avg_duration_seconds: stats::mean(&durations),
        median_duration_seconds: stats::median(&durations),
        max_duration_seconds: stats::max(&durations),
        unique_activities: activity_col.map(|c| table.distinct_count(c)),
        most_common_activity: activity_col.and_then(|c| most_common(table, c)),
        unique_users: table
            .resolve(LogicalField::User)
            .map(|c| table.distinct_count(c)),
    }
}

/// Most frequent value; ties resolve to the lexicographically smallest.
fn most_common(table: &Table, column: &str) -> Option<String> {
    let mut best: Option<(String, usize)> = None;
    for (value, count) in table.value_counts(column) {
        if best.as_ref().is_none_or(|(_, top)| count > *top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(rows: serde_json::Value) -> Table {
        Table::from_json_str(&rows.to_string()).expect("fixture parses")
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn flow_efficiency_uses_observed_lead_time() {
        let t = table(json!([
            {"case_id": "A", "duration_seconds": 60, "start_time": "2025-10-01 10:00:00", "end_time": "2025-10-01 10:01:00"},
            {"case_id": "A", "duration_seconds": 60, "start_time": "2025-10-01 10:03:00", "end_time": "2025-10-01 10:04:00"},
        ]));
        assert!(approx(flow_efficiency(&t), 0.5));
    }

    #[test]
    fn flow_efficiency_estimates_wait_without_timestamps() {
        let t = table(json!([
            {"case_id": "A", "duration_seconds": 300},
            {"case_id": "B", "duration_seconds": 300},
        ]));
        assert!(approx(flow_efficiency(&t), 0.5));
    }

    #[test]
    fn flow_efficiency_is_clamped_to_unit_interval() {
        let t = table(json!([
            {"case_id": "A", "duration_seconds": 7200, "start_time": "2025-10-01 10:00:00", "end_time": "2025-10-01 10:01:00"},
        ]));
        assert_eq!(flow_efficiency(&t), 1.0);
    }

    #[test]
    fn flow_efficiency_without_work_or_rows_falls_back() {
        assert_eq!(flow_efficiency(&Table::default()), 0.0);
        let no_duration = table(json!([{"case_id": "A", "user": "x"}]));
        assert_eq!(flow_efficiency(&no_duration), 0.0);
    }

    #[test]
    fn aging_buckets_sum_to_cases_with_timestamps() {
        let t = table(json!([
            {"case_id": "A", "start_time": "2025-10-30 09:00:00"},
            {"case_id": "A", "start_time": "2025-10-31 09:00:00"},
            {"case_id": "B", "start_time": "2025-10-20 09:00:00"},
            {"case_id": "C", "start_time": "2025-10-01 09:00:00"},
            {"case_id": "D", "start_time": "2025-10-23 09:00:00"},
        ]));
        let buckets = case_aging_buckets(&t);
        assert_eq!(buckets, AgingBuckets { recent: 1, aging: 2, stale: 1 });
        assert_eq!(buckets.total(), 4);
    }

    #[test]
    fn aging_skips_cases_without_parseable_start() {
        let t = table(json!([
            {"case_id": "A", "start_time": "2025-10-01 09:00:00"},
            {"case_id": "B", "start_time": "garbage"},
        ]));
        assert_eq!(case_aging_buckets(&t).total(), 1);
    }

    #[test]
    fn throughput_is_mean_case_duration_in_minutes() {
        let t = table(json!([
            {"case_id": "A", "duration_seconds": 60},
            {"case_id": "A", "duration_seconds": 60},
            {"case_id": "B", "duration_seconds": 240},
        ]));
        assert!(approx(throughput_minutes(&t), 3.0));
    }

    #[test]
    fn handoffs_zero_for_single_user_cases() {
        let t = table(json!([
            {"case_id": "A", "user": "ana", "start_time": "2025-10-01 09:00:00"},
            {"case_id": "A", "user": "ana", "start_time": "2025-10-01 10:00:00"},
            {"case_id": "B", "user": "ana", "start_time": "2025-10-01 11:00:00"},
        ]));
        assert_eq!(handoffs(&t), 0.0);
    }

    #[test]
    fn handoffs_follow_time_order() {
        let t = table(json!([
            {"case_id": "A", "user": "ana", "start_time": "2025-10-01 11:00:00"},
            {"case_id": "A", "user": "ben", "start_time": "2025-10-01 09:00:00"},
            {"case_id": "A", "user": "ana", "start_time": "2025-10-01 10:00:00"},
            {"case_id": "B", "user": "cat", "start_time": "2025-10-01 09:00:00"},
        ]));
        // A: ben -> ana -> ana = 1 change, B: 0.
        assert!(approx(handoffs(&t), 0.5));
    }

    #[test]
    fn panel_metrics_cover_basic_statistics() {
        let t = table(json!([
            {"case_id": "A", "user": "ana", "activity": "Review", "duration_seconds": 10},
            {"case_id": "A", "user": "ben", "activity": "Review", "duration_seconds": 20},
            {"case_id": "B", "user": "ana", "activity": "Close", "duration_seconds": 30},
        ]));
        let panel = compute_panel_metrics(&t, "salesforce", &TableFilters::default());
        assert_eq!(panel.case_count, 3);
        assert_eq!(panel.avg_duration_seconds, Some(20.0));
        assert_eq!(panel.median_duration_seconds, Some(20.0));
        assert_eq!(panel.max_duration_seconds, Some(30.0));
        assert_eq!(panel.unique_activities, Some(2));
        assert_eq!(panel.most_common_activity.as_deref(), Some("Review"));
        assert_eq!(panel.unique_users, Some(2));
        assert_eq!(panel.lookup("case_count"), Some(3.0));
        assert_eq!(panel.lookup("nonsense"), None);
    }

    #[test]
    fn empty_table_yields_neutral_panel() {
        let panel = compute_panel_metrics(&Table::default(), "amadeus", &TableFilters::default());
        assert_eq!(panel.case_count, 0);
        assert_eq!(panel.flow_efficiency, 0.0);
        assert_eq!(panel.throughput_minutes, 0.0);
        assert_eq!(panel.handoffs, 0.0);
        assert_eq!(panel.aging_buckets, AgingBuckets::default());
        assert_eq!(panel.avg_duration_seconds, None);
    }

    #[test]
    fn aging_bucket_keys_serialize_with_labels() {
        let value = serde_json::to_value(AgingBuckets { recent: 1, aging: 2, stale: 3 })
            .expect("serializes");
        assert_eq!(value, json!({"0-7d": 1, "8-14d": 2, ">14d": 3}));
        assert_eq!(AgingBucket::Stale.label(), ">14d");
    }
}
