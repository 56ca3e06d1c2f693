//! Dashboard panel views with per-dataset capability tables.
//!
//! A dataset profile lists which views it supports. Asking for a view the
//! profile marks unsupported is an error, never a silent empty panel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::columns::LogicalField;
use crate::metrics::{PanelMetrics, compute_panel_metrics};
use crate::stats;
use crate::table::{Table, TableFilters};

pub const TOP_N: usize = 20;
pub const TEAM_THRESHOLD_PERCENTILE: f64 = 80.0;

/// Activity names containing any of these are treated as case completion
/// steps rather than bottlenecks.
const COMPLETION_MARKERS: &[&str] = &[
    "complete", "close", "finish", "done", "end", "final", "submit", "approve", "reject",
    "cancel", "archive", "delete", "terminate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PanelView {
    Summary,
    Bottlenecks,
    TeamPerformance,
    AppUsage,
    TimeAnalysis,
    ProcessAnalysis,
    UserEfficiency,
}

impl PanelView {
    pub const ALL: [PanelView; 7] = [
        PanelView::Summary,
        PanelView::Bottlenecks,
        PanelView::TeamPerformance,
        PanelView::AppUsage,
        PanelView::TimeAnalysis,
        PanelView::ProcessAnalysis,
        PanelView::UserEfficiency,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            PanelView::Summary => "summary",
            PanelView::Bottlenecks => "bottlenecks",
            PanelView::TeamPerformance => "team_performance",
            PanelView::AppUsage => "app_usage",
            PanelView::TimeAnalysis => "time_analysis",
            PanelView::ProcessAnalysis => "process_analysis",
            PanelView::UserEfficiency => "user_efficiency",
        }
    }
}

impl fmt::Display for PanelView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown panel view: {0}")]
pub struct UnknownView(pub String);

impl FromStr for PanelView {
    type Err = UnknownView;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        PanelView::ALL
            .into_iter()
            .find(|view| view.as_str() == raw)
            .ok_or_else(|| UnknownView(raw.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RankedValue {
    pub key: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum ViewData {
    Summary {
        metrics: PanelMetrics,
        unique_teams: Option<usize>,
    },
    Bottlenecks {
        /// Mean duration (seconds) per activity, slowest first.
        activities: Vec<RankedValue>,
        excluded_completion_activities: usize,
    },
    TeamPerformance {
        /// Mean duration (seconds) per team, slowest first.
        teams: Vec<RankedValue>,
        p80_threshold: Option<f64>,
        above_threshold: Vec<String>,
        at_or_below_threshold: Vec<String>,
    },
    AppUsage {
        /// Event count per application, most used first.
        applications: Vec<RankedValue>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("view {view} is not supported for dataset {dataset}")]
    Unsupported { dataset: String, view: PanelView },
    #[error("unknown dataset profile: {0}")]
    UnknownDataset(String),
}

pub type ViewHandler = fn(&Table, &str) -> ViewData;

#[derive(Clone, Copy)]
pub enum Capability {
    Supported(ViewHandler),
    Unsupported,
}

pub struct DatasetProfile {
    pub name: &'static str,
    pub label: &'static str,
    capabilities: &'static [(PanelView, Capability)],
}

pub static SALESFORCE: DatasetProfile = DatasetProfile {
    name: "salesforce",
    label: "Salesforce task mining",
    capabilities: &[
        (PanelView::Summary, Capability::Supported(summary_view)),
        (PanelView::Bottlenecks, Capability::Supported(bottlenecks_view)),
        (PanelView::TeamPerformance, Capability::Supported(team_performance_view)),
        (PanelView::AppUsage, Capability::Supported(app_usage_view)),
        (PanelView::TimeAnalysis, Capability::Unsupported),
        (PanelView::ProcessAnalysis, Capability::Unsupported),
        (PanelView::UserEfficiency, Capability::Unsupported),
    ],
};

pub static AMADEUS: DatasetProfile = DatasetProfile {
    name: "amadeus",
    label: "Amadeus booking process",
    capabilities: &[
        (PanelView::Summary, Capability::Supported(summary_view)),
        (PanelView::Bottlenecks, Capability::Supported(bottlenecks_view)),
        (PanelView::TeamPerformance, Capability::Unsupported),
        (PanelView::AppUsage, Capability::Unsupported),
        (PanelView::TimeAnalysis, Capability::Unsupported),
        (PanelView::ProcessAnalysis, Capability::Unsupported),
        (PanelView::UserEfficiency, Capability::Unsupported),
    ],
};

pub static PROFILES: [&DatasetProfile; 2] = [&SALESFORCE, &AMADEUS];

impl DatasetProfile {
    pub fn for_dataset(name: &str) -> Option<&'static DatasetProfile> {
        PROFILES.into_iter().find(|profile| profile.name == name)
    }

    pub fn capability(&self, view: PanelView) -> Capability {
        self.capabilities
            .iter()
            .find(|(candidate, _)| *candidate == view)
            .map_or(Capability::Unsupported, |(_, capability)| *capability)
    }

    pub fn supported_views(&self) -> Vec<PanelView> {
        PanelView::ALL
            .into_iter()
            .filter(|view| matches!(self.capability(*view), Capability::Supported(_)))
            .collect()
    }

    pub fn render(&self, view: PanelView, table: &Table) -> Result<ViewData, ViewError> {
        match self.capability(view) {
            Capability::Supported(handler) => Ok(handler(table, self.name)),
            Capability::Unsupported => Err(ViewError::Unsupported {
                dataset: self.name.to_string(),
                view,
            }),
        }
    }
}

pub fn render_view(dataset: &str, view: PanelView, table: &Table) -> Result<ViewData, ViewError> {
    DatasetProfile::for_dataset(dataset)
        .ok_or_else(|| ViewError::UnknownDataset(dataset.to_string()))?
        .render(view, table)
}

fn summary_view(table: &Table, dataset: &str) -> ViewData {
    ViewData::Summary {
        metrics: compute_panel_metrics(table, dataset, &TableFilters::default()),
        unique_teams: table
            .resolve(LogicalField::Team)
            .map(|c| table.distinct_count(c)),
    }
}

/// Mean numeric duration per group key, slowest first. Groups without any
/// numeric duration are left out.
fn mean_duration_by(table: &Table, field: LogicalField) -> Vec<RankedValue> {
    let (Some(group_col), Some(duration)) = (
        table.resolve(field),
        table
            .resolve(LogicalField::Duration)
            .and_then(|c| table.column_index(c)),
    ) else {
        return Vec::new();
    };

    let mut ranked: Vec<RankedValue> = table
        .group_rows(group_col)
        .into_iter()
        .filter_map(|(key, rows)| {
            let values: Vec<f64> = rows
                .iter()
                .filter_map(|&r| table.cell(r, duration).as_f64())
                .collect();
            stats::mean(&values).map(|value| RankedValue { key, value })
        })
        .collect();
    ranked.sort_by(|a, b| b.value.total_cmp(&a.value));
    ranked
}

fn is_completion_activity(name: &str) -> bool {
    let lowered = name.to_lowercase();
    COMPLETION_MARKERS.iter().any(|marker| lowered.contains(marker))
}

fn bottlenecks_view(table: &Table, _dataset: &str) -> ViewData {
    let (completion, mut activities): (Vec<RankedValue>, Vec<RankedValue>) =
        mean_duration_by(table, LogicalField::Activity)
            .into_iter()
            .partition(|ranked| is_completion_activity(&ranked.key));
    activities.truncate(TOP_N);
    ViewData::Bottlenecks {
        activities,
        excluded_completion_activities: completion.len(),
    }
}

fn team_performance_view(table: &Table, _dataset: &str) -> ViewData {
    let teams = mean_duration_by(table, LogicalField::Team);
    let means: Vec<f64> = teams.iter().map(|t| t.value).collect();
    let threshold = stats::percentile(&means, TEAM_THRESHOLD_PERCENTILE);

    let (above, at_or_below): (Vec<&RankedValue>, Vec<&RankedValue>) = teams
        .iter()
        .partition(|t| threshold.is_some_and(|limit| t.value > limit));

    ViewData::TeamPerformance {
        above_threshold: above.iter().map(|t| t.key.clone()).collect(),
        at_or_below_threshold: at_or_below.iter().map(|t| t.key.clone()).collect(),
        p80_threshold: threshold,
        teams,
    }
}

fn app_usage_view(table: &Table, _dataset: &str) -> ViewData {
    let mut applications: Vec<RankedValue> = table
        .resolve(LogicalField::Process)
        .map(|c| table.value_counts(c))
        .unwrap_or_default()
        .into_iter()
        .map(|(key, count)| RankedValue {
            key,
            value: count as f64,
        })
        .collect();
    applications.sort_by(|a, b| b.value.total_cmp(&a.value));
    applications.truncate(TOP_N);
    ViewData::AppUsage { applications }
}
