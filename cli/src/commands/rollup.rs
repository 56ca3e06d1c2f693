use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::Args;
use serde_json::json;
use taskmine_core::rollup::{self, DailyRollup};

use crate::util::{exit_error, parse_day, print_json};

#[derive(Args, Clone)]
pub struct LogDirArg {
    /// Log root; traces are read from <log-dir>/traces
    #[arg(long, env = "LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,
}

impl LogDirArg {
    pub fn trace_dir(&self) -> PathBuf {
        self.log_dir.join("traces")
    }

    pub fn kpi_dir(&self) -> PathBuf {
        self.log_dir.join("kpis")
    }
}

#[derive(Args, Clone)]
pub struct RollupArgs {
    /// Day to roll up as YYYYMMDD (defaults to today, UTC)
    #[arg(long)]
    pub date: Option<String>,

    #[command(flatten)]
    pub logs: LogDirArg,

    /// Also write the panel to <log-dir>/kpis/kpis-<date>.json
    #[arg(long)]
    pub save: bool,
}

#[derive(Args, Clone)]
pub struct RollupRangeArgs {
    /// First day, YYYYMMDD
    #[arg(long)]
    pub start: String,

    /// Last day (inclusive), YYYYMMDD
    #[arg(long)]
    pub end: String,

    #[command(flatten)]
    pub logs: LogDirArg,
}

fn day_arg(raw: &str, flag: &str) -> NaiveDate {
    parse_day(raw).unwrap_or_else(|e| exit_error(&format!("Invalid --{flag}: {e}"), None))
}

pub fn rollup_for(trace_dir: &Path, date: Option<NaiveDate>) -> DailyRollup {
    match date {
        Some(day) => rollup::rollup_day(trace_dir, day),
        None => rollup::rollup_today(trace_dir),
    }
}

pub fn run(args: RollupArgs) -> i32 {
    let date = args.date.as_deref().map(|raw| day_arg(raw, "date"));
    let panel = rollup_for(&args.logs.trace_dir(), date);

    if !args.save {
        return print_json(&panel);
    }
    match rollup::save_rollup(&panel, &args.logs.kpi_dir()) {
        Ok(path) => {
            tracing::info!(path = %path.display(), "Saved KPI panel");
            print_json(&json!({"path": path.display().to_string(), "rollup": panel}))
        }
        Err(e) => exit_error(
            &format!("Failed to save rollup: {e}"),
            Some("Check that --log-dir is writable."),
        ),
    }
}

pub fn run_range(args: RollupRangeArgs) -> i32 {
    let start = day_arg(&args.start, "start");
    let end = day_arg(&args.end, "end");
    match rollup::rollup_date_range(&args.logs.trace_dir(), start, end) {
        Ok(panels) => print_json(&panels),
        Err(e) => exit_error(&e.to_string(), Some("--start must not be after --end.")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use taskmine_core::trace::{TraceRecord, TraceStore};

    #[test]
    fn rolls_up_an_explicit_day() {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogDirArg {
            log_dir: dir.path().to_path_buf(),
        };
        let store = TraceStore::new(logs.trace_dir());
        let at = Utc.with_ymd_and_hms(2025, 10, 1, 12, 0, 0).unwrap();
        store.try_append(&TraceRecord::new("/api/analyze/salesforce", at)).unwrap();

        let day = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        let panel = rollup_for(&logs.trace_dir(), Some(day));
        assert_eq!(panel.date(), "20251001");
        assert_eq!(panel.trace_count(), 1);

        let empty = rollup_for(&logs.trace_dir(), NaiveDate::from_ymd_opt(2025, 10, 2));
        assert_eq!(empty.trace_count(), 0);
    }
}
