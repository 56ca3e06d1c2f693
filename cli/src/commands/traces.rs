use chrono::NaiveDate;
use clap::Args;
use serde_json::{Value, json};
use taskmine_core::trace::{TraceRecord, TraceStore};

use crate::commands::rollup::LogDirArg;
use crate::util::{exit_error, parse_day, print_json};

#[derive(Args, Clone)]
pub struct TracesArgs {
    /// Day to inspect as YYYYMMDD (defaults to today, UTC)
    #[arg(long)]
    pub date: Option<String>,

    /// Number of most recent records to show
    #[arg(long, default_value_t = 20)]
    pub tail: usize,

    #[command(flatten)]
    pub logs: LogDirArg,
}

/// One line per record: the fields an operator scans for.
pub fn summarize(records: &[TraceRecord], tail: usize) -> Vec<Value> {
    let skip = records.len().saturating_sub(tail);
    records
        .iter()
        .skip(skip)
        .map(|r| {
            json!({
                "timestamp_utc": r.timestamp_utc,
                "endpoint": r.endpoint,
                "status_code": r.status_code,
                "dataset": r.dataset,
                "intent": r.intent,
                "latency_ms_total": r.latency_ms_total,
                "error": r.error,
            })
        })
        .collect()
}

pub fn run(args: TracesArgs) -> i32 {
    let date: NaiveDate = match args.date.as_deref() {
        Some(raw) => parse_day(raw).unwrap_or_else(|e| exit_error(&format!("Invalid --date: {e}"), None)),
        None => chrono::Utc::now().date_naive(),
    };
    let store = TraceStore::new(args.logs.trace_dir());
    let records = store.read_day(date);
    tracing::debug!(%date, total = records.len(), "Read trace records");

    print_json(&json!({
        "date": date.format("%Y%m%d").to_string(),
        "total": records.len(),
        "records": summarize(&records, args.tail),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn keeps_only_the_last_records_in_order() {
        let records: Vec<TraceRecord> = (0..5)
            .map(|minute| {
                let at = Utc.with_ymd_and_hms(2025, 10, 1, 9, minute, 0).unwrap();
                let mut record = TraceRecord::new(format!("/api/call/{minute}"), at);
                record.latency_ms_total = Some(f64::from(minute) * 10.0);
                record
            })
            .collect();

        let lines = summarize(&records, 2);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["endpoint"], json!("/api/call/3"));
        assert_eq!(lines[1]["endpoint"], json!("/api/call/4"));
        assert_eq!(lines[1]["latency_ms_total"], json!(40.0));
        assert!(lines[1]["error"].is_null());

        assert_eq!(summarize(&records, 50).len(), 5);
    }
}
