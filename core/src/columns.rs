//! Column resolution across heterogeneous dataset schemas.
//!
//! Datasets name the same logical field differently (`case_id` vs `case`,
//! `user` vs `agent_profile_id`). Every consumer resolves columns through
//! [`find_column`] with the candidate lists on [`LogicalField`].

use serde::Serialize;
use utoipa::ToSchema;

/// A logical field that metrics and filters need, independent of the
/// physical column name a dataset happens to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogicalField {
    CaseId,
    Duration,
    User,
    Team,
    Activity,
    Start,
    End,
    Process,
    Title,
}

impl LogicalField {
    pub const ALL: [LogicalField; 9] = [
        LogicalField::CaseId,
        LogicalField::Duration,
        LogicalField::User,
        LogicalField::Team,
        LogicalField::Activity,
        LogicalField::Start,
        LogicalField::End,
        LogicalField::Process,
        LogicalField::Title,
    ];

    /// Candidate column names in priority order.
    pub const fn candidates(self) -> &'static [&'static str] {
        match self {
            LogicalField::CaseId => &["case_id", "case", "id"],
            LogicalField::Duration => &["duration_seconds", "duration", "task_duration", "elapsed"],
            LogicalField::User => &["user", "resource", "agent_profile_id", "agent"],
            LogicalField::Team => &["team", "teams"],
            LogicalField::Activity => &["activity", "step", "original_activity"],
            LogicalField::Start => &["start_time", "start", "timestamp"],
            LogicalField::End => &["end_time", "end"],
            LogicalField::Process => &["process_name", "process", "application", "window"],
            LogicalField::Title => &["window_title", "title"],
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LogicalField::CaseId => "case_id",
            LogicalField::Duration => "duration",
            LogicalField::User => "user",
            LogicalField::Team => "team",
            LogicalField::Activity => "activity",
            LogicalField::Start => "start",
            LogicalField::End => "end",
            LogicalField::Process => "process",
            LogicalField::Title => "title",
        }
    }
}

/// Resolve the first column matching `candidates`.
///
/// Exact case-insensitive matches win, checked in candidate priority order.
/// Otherwise the first column (in table order) whose lowercase name contains
/// any candidate as a substring is returned.
pub fn find_column<'a, S: AsRef<str>>(columns: &'a [S], candidates: &[&str]) -> Option<&'a str> {
    let lowered: Vec<String> = columns.iter().map(|c| c.as_ref().to_lowercase()).collect();

    for candidate in candidates {
        let candidate = candidate.to_lowercase();
        if let Some(index) = lowered.iter().position(|column| *column == candidate) {
            return Some(columns[index].as_ref());
        }
    }

    lowered
        .iter()
        .position(|column| {
            candidates
                .iter()
                .any(|candidate| column.contains(&candidate.to_lowercase()))
        })
        .map(|index| columns[index].as_ref())
}
