//! Append-only daily JSONL trace store.
//!
//! One record per request, one file per UTC day (`traces-YYYYMMDD.jsonl`).
//! Appending never fails the caller; write errors are logged and dropped.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::schema::HallucinationCheck;
use crate::verify::VerificationSummary;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("trace record could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Verification output stored with a trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExtractedMetrics {
    #[serde(flatten)]
    pub verification: VerificationSummary,
    #[serde(default)]
    pub hallucination_check: Option<HallucinationCheck>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TraceRecord {
    pub timestamp_utc: DateTime<Utc>,
    #[serde(default)]
    pub request_id: Option<Uuid>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub filters: Value,
    #[serde(default)]
    pub request_bytes: Option<u64>,
    #[serde(default)]
    pub response_bytes: Option<u64>,
    #[serde(default)]
    pub latency_ms_total: Option<f64>,
    #[serde(default)]
    pub latency_ms_model: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_prompt: Option<u64>,
    #[serde(default)]
    pub tokens_completion: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub extracted_metrics: Option<ExtractedMetrics>,
    #[serde(default)]
    pub router_selected: Option<String>,
    #[serde(default)]
    pub router_should_have_selected: Option<String>,
    #[serde(default)]
    pub router_correct: Option<bool>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub resolved: bool,
}

impl TraceRecord {
    pub fn new(endpoint: impl Into<String>, timestamp_utc: DateTime<Utc>) -> Self {
        Self {
            timestamp_utc,
            request_id: Some(Uuid::now_v7()),
            endpoint: Some(endpoint.into()),
            status_code: None,
            dataset: None,
            intent: None,
            filters: Value::Null,
            request_bytes: None,
            response_bytes: None,
            latency_ms_total: None,
            latency_ms_model: None,
            model: None,
            tokens_prompt: None,
            tokens_completion: None,
            error: None,
            extracted_metrics: None,
            router_selected: None,
            router_should_have_selected: None,
            router_correct: None,
            session_id: None,
            user_id: None,
            resolved: false,
        }
    }

    /// Record the routing decision. Correctness is only known when the
    /// query named a dataset.
    pub fn set_router(&mut self, selected: Option<String>, should_have_selected: Option<String>) {
        self.router_correct = match (&selected, &should_have_selected) {
            (_, None) => None,
            (selected, Some(expected)) => Some(selected.as_deref() == Some(expected.as_str())),
        };
        self.router_selected = selected;
        self.router_should_have_selected = should_have_selected;
    }

    pub fn has_numeric_claims(&self) -> bool {
        self.extracted_metrics
            .as_ref()
            .is_some_and(|m| m.verification.has_numeric_claims)
    }
}

pub fn trace_file_name(date: NaiveDate) -> String {
    format!("traces-{}.jsonl", date.format("%Y%m%d"))
}

#[derive(Debug, Clone)]
pub struct TraceStore {
    dir: PathBuf,
}

impl TraceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(trace_file_name(date))
    }

    /// Append a record to its day file. Failures are logged, never returned.
    pub fn append(&self, record: &TraceRecord) {
        if let Err(e) = self.try_append(record) {
            tracing::warn!(error = %e, endpoint = ?record.endpoint, "Failed to append trace record");
        }
    }

    /// Append as a single write of one complete line so concurrent appenders
    /// never interleave within a record.
    pub fn try_append(&self, record: &TraceRecord) -> Result<PathBuf, TraceError> {
        let path = self.day_file(record.timestamp_utc.date_naive());
        let io_err = |source| TraceError::Io {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(&line).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        Ok(path)
    }

    pub fn read_day(&self, date: NaiveDate) -> Vec<TraceRecord> {
        read_traces(&self.day_file(date))
    }
}

/// Read a day file, skipping blank and unparseable lines. A missing file
/// reads as empty.
pub fn read_traces(path: &Path) -> Vec<TraceRecord> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "Failed to open trace file");
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else {
            skipped += 1;
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<TraceRecord>(line) {
            Ok(record) => records.push(record),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::debug!(skipped, path = %path.display(), "Skipped malformed trace lines");
    }
    records
}
