//! Daily KPI rollups over trace records.
//!
//! [`compute_kpi_panel`] is pure over an in-memory record list; the file
//! helpers below only locate, read and persist day files.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::stats;
use crate::trace::{TraceRecord, read_traces, trace_file_name};

/// Relative change between consecutive values of a metric that counts as
/// a contradiction within a session.
pub const CONTRADICTION_THRESHOLD: f64 = 0.10;
/// Endpoints that return generated answers. Matched by prefix.
pub const ANSWER_ENDPOINTS: &[&str] = &["/api/analyze", "/api/agent"];
/// Panel metrics that claims are compared against for parity.
pub const PARITY_METRICS: &[&str] = &[
    "flow_efficiency",
    "handoffs",
    "throughput_minutes",
    "aging_>14d",
    "case_count",
];
const DEFAULT_SESSION: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum RollupError {
    #[error("failed to write rollup {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("rollup could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LatencyStats {
    pub p50_total: Option<f64>,
    pub p95_total: Option<f64>,
    pub mean_total: Option<f64>,
    pub p50_model: Option<f64>,
    pub p95_model: Option<f64>,
    pub mean_model: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LatencyPanel {
    pub overall: LatencyStats,
    pub by_endpoint: BTreeMap<String, LatencyStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Adoption {
    /// Distinct users (falling back to the session id).
    pub wau: usize,
    pub sessions: usize,
    pub queries_per_session: f64,
    pub total_queries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Resolution {
    pub sessions_resolved_rate: Option<f64>,
    pub turns_to_resolution_p50: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct KpiPanel {
    /// `YYYYMMDD`
    pub date: String,
    pub trace_count: usize,
    pub grounded_accuracy_rate: Option<f64>,
    pub routing_accuracy: Option<f64>,
    /// Mean absolute percentage error per panel metric, plus `overall`.
    pub metric_parity_mape: BTreeMap<String, f64>,
    pub hallucination_rate: Option<f64>,
    pub contradiction_rate: Option<f64>,
    pub latency: LatencyPanel,
    pub adoption: Adoption,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EmptyRollup {
    pub date: String,
    pub trace_count: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum DailyRollup {
    Panel(KpiPanel),
    Empty(EmptyRollup),
}

impl DailyRollup {
    pub fn date(&self) -> &str {
        match self {
            DailyRollup::Panel(panel) => &panel.date,
            DailyRollup::Empty(empty) => &empty.date,
        }
    }

    pub fn trace_count(&self) -> usize {
        match self {
            DailyRollup::Panel(panel) => panel.trace_count,
            DailyRollup::Empty(_) => 0,
        }
    }

    fn empty(date: String, error: &str) -> Self {
        DailyRollup::Empty(EmptyRollup {
            date,
            trace_count: 0,
            error: error.to_string(),
        })
    }
}

fn session_key(record: &TraceRecord) -> &str {
    record.session_id.as_deref().unwrap_or(DEFAULT_SESSION)
}

/// Passed claims over evaluable claims, across every record that carried
/// numeric claims.
pub fn grounded_accuracy_rate(records: &[TraceRecord]) -> Option<f64> {
    let (passed, evaluable) = records
        .iter()
        .filter_map(|r| r.extracted_metrics.as_ref())
        .filter(|m| m.verification.has_numeric_claims)
        .fold((0, 0), |(passed, evaluable), m| {
            let v = &m.verification;
            (passed + v.claims_passed, evaluable + v.claims_passed + v.claims_failed)
        });
    stats::ratio(passed, evaluable)
}

pub fn routing_accuracy(records: &[TraceRecord]) -> Option<f64> {
    let outcomes: Vec<bool> = records.iter().filter_map(|r| r.router_correct).collect();
    stats::ratio(outcomes.iter().filter(|correct| **correct).count(), outcomes.len())
}

fn normalize_metric_name(name: &str) -> String {
    name.to_lowercase().replace(['_', ' '], "")
}

/// Mean of the stored `pct_err` (a fraction) of every verification result
/// that has one, bucketed by the first panel metric whose normalized name
/// contains, or is contained in, the claim name.
pub fn metric_parity_mape(records: &[TraceRecord]) -> BTreeMap<String, f64> {
    let panel: Vec<(&str, String)> = PARITY_METRICS
        .iter()
        .map(|name| (*name, normalize_metric_name(name)))
        .collect();

    let mut errors: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let results = records
        .iter()
        .filter_map(|r| r.extracted_metrics.as_ref())
        .flat_map(|m| m.verification.verification_results.iter());

    for result in results {
        let Some(pct_err) = result.pct_err else {
            continue;
        };
        let name = normalize_metric_name(&result.name);
        if name.is_empty() {
            continue;
        }
        let matched = panel
            .iter()
            .find(|(_, normalized)| normalized.contains(&name) || name.contains(normalized.as_str()));
        if let Some((metric, _)) = matched {
            errors.entry((*metric).to_string()).or_default().push(pct_err);
        }
    }

    let mut mape: BTreeMap<String, f64> = errors
        .iter()
        .filter_map(|(metric, values)| stats::mean(values).map(|m| (metric.clone(), m)))
        .collect();
    let all: Vec<f64> = errors.into_values().flatten().collect();
    if let Some(overall) = stats::mean(&all) {
        mape.insert("overall".to_string(), overall);
    }
    mape
}

fn is_answer_endpoint(endpoint: &str) -> bool {
    ANSWER_ENDPOINTS.iter().any(|prefix| endpoint.starts_with(prefix))
}

/// Share of answer responses carrying at least one unknown reference.
pub fn hallucination_rate(records: &[TraceRecord]) -> Option<f64> {
    let answers: Vec<&TraceRecord> = records
        .iter()
        .filter(|r| r.endpoint.as_deref().is_some_and(is_answer_endpoint))
        .collect();
    let flagged = answers
        .iter()
        .filter(|r| {
            r.extracted_metrics
                .as_ref()
                .and_then(|m| m.hallucination_check.as_ref())
                .is_some_and(|check| check.has_hallucinations)
        })
        .count();
    stats::ratio(flagged, answers.len())
}

/// Records grouped by session, each group in timestamp order.
fn sessions(records: &[TraceRecord]) -> BTreeMap<&str, Vec<&TraceRecord>> {
    let mut grouped: BTreeMap<&str, Vec<&TraceRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(session_key(record)).or_default().push(record);
    }
    for group in grouped.values_mut() {
        group.sort_by_key(|r| r.timestamp_utc);
    }
    grouped
}

/// Share of claim-bearing sessions in which some metric changed by more
/// than [`CONTRADICTION_THRESHOLD`] between consecutive mentions.
pub fn contradiction_rate(records: &[TraceRecord]) -> Option<f64> {
    let with_claims: Vec<TraceRecord> = records
        .iter()
        .filter(|r| r.has_numeric_claims())
        .cloned()
        .collect();
    let grouped = sessions(&with_claims);

    let contradicted = grouped
        .values()
        .filter(|group| {
            let mut history: HashMap<&str, Vec<f64>> = HashMap::new();
            for record in group.iter() {
                if let Some(metrics) = &record.extracted_metrics {
                    for claim in &metrics.verification.all_claims {
                        history.entry(claim.name.as_str()).or_default().push(claim.value);
                    }
                }
            }
            history.values().any(|values| {
                values.windows(2).any(|pair| {
                    pair[0] != 0.0 && (pair[1] - pair[0]).abs() / pair[0].abs() > CONTRADICTION_THRESHOLD
                })
            })
        })
        .count();

    stats::ratio(contradicted, grouped.len())
}

fn latency_stats<'a>(records: impl Iterator<Item = &'a TraceRecord> + Clone) -> LatencyStats {
    let total: Vec<f64> = records.clone().filter_map(|r| r.latency_ms_total).collect();
    let model: Vec<f64> = records.filter_map(|r| r.latency_ms_model).collect();
    LatencyStats {
        p50_total: stats::percentile(&total, 50.0),
        p95_total: stats::percentile(&total, 95.0),
        mean_total: stats::mean(&total),
        p50_model: stats::percentile(&model, 50.0),
        p95_model: stats::percentile(&model, 95.0),
        mean_model: stats::mean(&model),
    }
}

pub fn latency_panel(records: &[TraceRecord]) -> LatencyPanel {
    let endpoints: BTreeSet<&str> = records
        .iter()
        .filter_map(|r| r.endpoint.as_deref())
        .filter(|e| !e.is_empty())
        .collect();
    LatencyPanel {
        overall: latency_stats(records.iter()),
        by_endpoint: endpoints
            .into_iter()
            .map(|endpoint| {
                let matching = records
                    .iter()
                    .filter(move |r| r.endpoint.as_deref() == Some(endpoint));
                (endpoint.to_string(), latency_stats(matching))
            })
            .collect(),
    }
}

pub fn adoption(records: &[TraceRecord]) -> Adoption {
    let mut per_session: HashMap<&str, usize> = HashMap::new();
    let mut users: BTreeSet<&str> = BTreeSet::new();
    for record in records {
        let session = session_key(record);
        *per_session.entry(session).or_default() += 1;
        users.insert(record.user_id.as_deref().unwrap_or(session));
    }
    let counts: Vec<f64> = per_session.values().map(|n| *n as f64).collect();
    Adoption {
        wau: users.len(),
        sessions: per_session.len(),
        queries_per_session: stats::mean(&counts).unwrap_or(0.0),
        total_queries: records.len(),
    }
}

pub fn resolution(records: &[TraceRecord]) -> Resolution {
    let grouped = sessions(records);
    let turns: Vec<f64> = grouped
        .values()
        .filter_map(|group| group.iter().position(|r| r.resolved))
        .map(|index| (index + 1) as f64)
        .collect();
    Resolution {
        sessions_resolved_rate: stats::ratio(turns.len(), grouped.len()),
        turns_to_resolution_p50: stats::median(&turns),
    }
}

pub fn compute_kpi_panel(date: &str, records: &[TraceRecord]) -> KpiPanel {
    KpiPanel {
        date: date.to_string(),
        trace_count: records.len(),
        grounded_accuracy_rate: grounded_accuracy_rate(records),
        routing_accuracy: routing_accuracy(records),
        metric_parity_mape: metric_parity_mape(records),
        hallucination_rate: hallucination_rate(records),
        contradiction_rate: contradiction_rate(records),
        latency: latency_panel(records),
        adoption: adoption(records),
        resolution: resolution(records),
    }
}

fn date_from_trace_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.trim_start_matches("traces-").to_string())
        .unwrap_or_default()
}

/// Roll up one trace file.
pub fn rollup(trace_file: &Path) -> DailyRollup {
    let date = date_from_trace_path(trace_file);
    let records = read_traces(trace_file);
    if records.is_empty() {
        return DailyRollup::empty(date, "No traces found");
    }
    DailyRollup::Panel(compute_kpi_panel(&date, &records))
}

pub fn rollup_day(trace_dir: &Path, date: NaiveDate) -> DailyRollup {
    rollup(&trace_dir.join(trace_file_name(date)))
}

pub fn rollup_today(trace_dir: &Path) -> DailyRollup {
    let today = Utc::now().date_naive();
    let path = trace_dir.join(trace_file_name(today));
    if !path.exists() {
        return DailyRollup::empty(today.format("%Y%m%d").to_string(), "No traces for today");
    }
    rollup(&path)
}

/// Rollups for each day in `[start, end]` that has a trace file.
pub fn rollup_date_range(
    trace_dir: &Path,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<DailyRollup>, RollupError> {
    if start > end {
        return Err(RollupError::InvalidRange { start, end });
    }
    Ok(start
        .iter_days()
        .take_while(|day| *day <= end)
        .map(|day| trace_dir.join(trace_file_name(day)))
        .filter(|path| path.exists())
        .map(|path| rollup(&path))
        .collect())
}

/// Persist a rollup as pretty JSON at `<dir>/kpis-<date>.json`.
pub fn save_rollup(rollup: &DailyRollup, output_dir: &Path) -> Result<PathBuf, RollupError> {
    let path = output_dir.join(format!("kpis-{}.json", rollup.date()));
    let io_err = |source| RollupError::Io {
        path: path.display().to_string(),
        source,
    };
    fs::create_dir_all(output_dir).map_err(io_err)?;
    let body = serde_json::to_string_pretty(rollup)?;
    fs::write(&path, body).map_err(io_err)?;
    tracing::info!(path = %path.display(), "Saved KPI rollup");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::Claim;
    use crate::recompute::VerificationResult;
    use crate::schema::HallucinationCheck;
    use crate::trace::{ExtractedMetrics, TraceStore};
    use crate::verify::VerificationSummary;
    use chrono::{DateTime, TimeZone};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 1, 10, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn make_record(endpoint: &str, minute: u32, session: &str) -> TraceRecord {
        let mut record = TraceRecord::new(endpoint, at(minute));
        record.session_id = Some(session.to_string());
        record
    }

    fn claim(name: &str, value: f64) -> Claim {
        Claim {
            name: name.to_string(),
            slice: None,
            value,
            units: String::new(),
            raw_text: String::new(),
            from_facts_block: false,
        }
    }

    fn result(name: &str, claimed: f64, recomputed: f64) -> VerificationResult {
        VerificationResult {
            name: name.to_string(),
            claimed,
            recomputed: Some(recomputed),
            pass: Some((claimed - recomputed).abs() / recomputed.abs() <= 0.02),
            abs_err: Some((claimed - recomputed).abs()),
            pct_err: Some((claimed - recomputed).abs() / recomputed.abs()),
            error: None,
        }
    }

    fn with_claims(mut record: TraceRecord, claims: Vec<Claim>, results: Vec<VerificationResult>) -> TraceRecord {
        record.extracted_metrics = Some(ExtractedMetrics {
            verification: VerificationSummary::from_results(claims, results),
            hallucination_check: None,
        });
        record
    }

    fn approx(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn grounded_accuracy_counts_evaluable_claims() {
        let passing = with_claims(
            make_record("/api/analyze/salesforce", 0, "s1"),
            vec![claim("flow_efficiency", 0.62)],
            vec![result("flow_efficiency", 0.62, 0.62)],
        );
        let mixed = with_claims(
            make_record("/api/analyze/salesforce", 1, "s1"),
            vec![claim("flow_efficiency", 0.9), claim("throughput_minutes", 30.0)],
            vec![
                result("flow_efficiency", 0.9, 0.5),
                result("throughput_minutes", 30.0, 30.0),
            ],
        );
        let plain = make_record("/api/kpis/today", 2, "s1");
        let rate = grounded_accuracy_rate(&[passing, mixed, plain]);
        assert!(approx(rate, 2.0 / 3.0));
        assert_eq!(grounded_accuracy_rate(&[]), None);
    }

    #[test]
    fn routing_accuracy_ignores_unrouted_records() {
        let mut correct = make_record("/api/agent", 0, "s1");
        correct.set_router(Some("salesforce".into()), Some("salesforce".into()));
        let mut wrong = make_record("/api/agent", 1, "s1");
        wrong.set_router(Some("salesforce".into()), Some("amadeus".into()));
        let unrouted = make_record("/api/agent", 2, "s1");
        assert!(approx(routing_accuracy(&[correct, wrong, unrouted]), 0.5));
    }

    #[test]
    fn mape_matches_panel_names_loosely() {
        let record = with_claims(
            make_record("/api/analyze/salesforce", 0, "s1"),
            vec![claim("avg_handoffs", 11.0), claim("flow_efficiency", 0.5)],
            vec![result("avg_handoffs", 11.0, 10.0), result("Flow Efficiency", 0.5, 0.5)],
        );
        let mape = metric_parity_mape(&[record]);
        assert!(approx(mape.get("handoffs").copied(), 0.1));
        assert!(approx(mape.get("flow_efficiency").copied(), 0.0));
        assert!(approx(mape.get("overall").copied(), 0.05));
    }

    #[test]
    fn mape_averages_stored_pct_err() {
        let mut zero_recomputed = result("case_count", 0.5, 1.0);
        zero_recomputed.recomputed = Some(0.0);
        zero_recomputed.pct_err = Some(0.5);
        let mut stored = result("handoffs", 11.0, 10.0);
        stored.pct_err = Some(0.25);
        let mut unknown = result("throughput_minutes", 40.0, 10.0);
        unknown.recomputed = None;
        unknown.pct_err = None;

        let record = with_claims(
            make_record("/api/analyze/salesforce", 0, "s1"),
            vec![claim("handoffs", 11.0), claim("case_count", 0.5), claim("throughput_minutes", 40.0)],
            vec![stored, zero_recomputed, unknown],
        );
        let mape = metric_parity_mape(&[record]);
        assert!(approx(mape.get("handoffs").copied(), 0.25));
        assert!(approx(mape.get("case_count").copied(), 0.5));
        assert!(!mape.contains_key("throughput_minutes"));
        assert!(approx(mape.get("overall").copied(), 0.375));
    }

    #[test]
    fn hallucination_rate_counts_answer_endpoints_by_prefix() {
        let mut flagged = make_record("/api/analyze/salesforce", 0, "s1");
        flagged.extracted_metrics = Some(ExtractedMetrics {
            verification: VerificationSummary::default(),
            hallucination_check: Some(HallucinationCheck {
                has_hallucinations: true,
                checked: true,
                ..HallucinationCheck::default()
            }),
        });
        let clean = make_record("/api/analyze/amadeus", 1, "s1");
        let other = make_record("/api/kpis/today", 2, "s1");
        assert!(approx(hallucination_rate(&[flagged, clean, other]), 0.5));
    }

    #[test]
    fn contradiction_when_consecutive_values_drift() {
        let first = with_claims(make_record("/api/agent", 0, "s1"), vec![claim("flow_efficiency", 0.6)], vec![]);
        let second = with_claims(make_record("/api/agent", 1, "s1"), vec![claim("flow_efficiency", 0.8)], vec![]);
        assert!(approx(contradiction_rate(&[second, first]), 1.0));
    }

    #[test]
    fn small_drift_is_not_a_contradiction() {
        let first = with_claims(make_record("/api/agent", 0, "s1"), vec![claim("flow_efficiency", 0.6)], vec![]);
        let second = with_claims(make_record("/api/agent", 1, "s1"), vec![claim("flow_efficiency", 0.61)], vec![]);
        assert!(approx(contradiction_rate(&[first, second]), 0.0));
        assert_eq!(contradiction_rate(&[make_record("/api/agent", 0, "s1")]), None);
    }

    #[test]
    fn latency_percentiles_overall_and_per_endpoint() {
        let records: Vec<TraceRecord> = [100.0, 200.0, 300.0, 400.0]
            .into_iter()
            .enumerate()
            .map(|(i, latency)| {
                let endpoint = if i % 2 == 0 { "/api/agent" } else { "/health" };
                let mut record = make_record(endpoint, i as u32, "s1");
                record.latency_ms_total = Some(latency);
                record
            })
            .collect();
        let panel = latency_panel(&records);
        assert!(approx(panel.overall.p50_total, 250.0));
        assert!(approx(panel.overall.mean_total, 250.0));
        assert_eq!(panel.overall.p50_model, None);
        assert!(approx(panel.by_endpoint["/api/agent"].p50_total, 200.0));
        assert!(approx(panel.by_endpoint["/health"].p95_total, 390.0));
    }

    #[test]
    fn adoption_falls_back_to_session_for_users() {
        let mut a = make_record("/api/agent", 0, "s1");
        a.user_id = Some("u1".into());
        let b = make_record("/api/agent", 1, "s1");
        let c = make_record("/api/agent", 2, "s2");
        let adoption = adoption(&[a, b, c]);
        assert_eq!(adoption.wau, 3);
        assert_eq!(adoption.sessions, 2);
        assert_eq!(adoption.total_queries, 3);
        assert!((adoption.queries_per_session - 1.5).abs() < 1e-9);
    }

    #[test]
    fn resolution_tracks_first_resolved_turn() {
        let first = make_record("/api/agent", 0, "s1");
        let mut second = make_record("/api/agent", 1, "s1");
        second.resolved = true;
        let unresolved = make_record("/api/agent", 2, "s2");
        let resolution = resolution(&[first, second, unresolved]);
        assert!(approx(resolution.sessions_resolved_rate, 0.5));
        assert!(approx(resolution.turns_to_resolution_p50, 2.0));
    }

    #[test]
    fn empty_trace_file_reports_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("traces-20251001.jsonl");
        fs::write(&path, "").expect("write");
        let rollup = rollup(&path);
        assert_eq!(
            rollup,
            DailyRollup::Empty(EmptyRollup {
                date: "20251001".into(),
                trace_count: 0,
                error: "No traces found".into(),
            })
        );
    }

    #[test]
    fn rollup_reads_store_output_and_saves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TraceStore::new(dir.path().join("traces"));
        store.append(&with_claims(
            make_record("/api/analyze/salesforce", 0, "s1"),
            vec![claim("handoffs", 2.0)],
            vec![result("handoffs", 2.0, 2.0)],
        ));
        store.append(&make_record("/api/kpis/today", 1, "s1"));

        let date = at(0).date_naive();
        let DailyRollup::Panel(panel) = rollup_day(store.dir(), date) else {
            panic!("expected a panel");
        };
        assert_eq!(panel.date, "20251001");
        assert_eq!(panel.trace_count, 2);
        assert!(approx(panel.grounded_accuracy_rate, 1.0));

        let saved = save_rollup(&DailyRollup::Panel(panel.clone()), &dir.path().join("kpis"))
            .expect("saves");
        assert!(saved.ends_with("kpis-20251001.json"));
        let reread: DailyRollup =
            serde_json::from_str(&fs::read_to_string(saved).expect("read")).expect("parses");
        assert_eq!(reread, DailyRollup::Panel(panel));
    }

    #[test]
    fn date_range_skips_missing_days() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TraceStore::new(dir.path());
        store.append(&make_record("/api/agent", 0, "s1"));

        let start = NaiveDate::from_ymd_opt(2025, 9, 29).expect("valid date");
        let end = NaiveDate::from_ymd_opt(2025, 10, 2).expect("valid date");
        let rollups = rollup_date_range(dir.path(), start, end).expect("valid range");
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].date(), "20251001");

        assert!(rollup_date_range(dir.path(), end, start).is_err());
    }
}
