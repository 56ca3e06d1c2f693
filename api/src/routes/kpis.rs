use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use taskmine_core::error::ApiError;
use taskmine_core::rollup::{self, DailyRollup, RollupError};

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/kpis", get(get_kpi_range))
        .route("/api/kpis/today", get(get_kpis_today))
        .route("/api/kpis/{date}", get(get_kpis_for_date))
        .route("/api/kpis/{date}/save", post(save_kpis_for_date))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RangeQuery {
    /// First day, `YYYYMMDD`
    pub start: Option<String>,
    /// Last day (inclusive), `YYYYMMDD`
    pub end: Option<String>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct SavedRollupResponse {
    pub path: String,
    pub rollup: DailyRollup,
}

fn parse_day(raw: &str, field: &str) -> Result<NaiveDate, AppError> {
    let invalid = || AppError::Validation {
        message: format!("'{raw}' is not a YYYYMMDD date"),
        field: Some(field.to_string()),
        received: Some(serde_json::Value::String(raw.to_string())),
        docs_hint: Some("Dates are compact UTC days, e.g. 20251001.".to_string()),
    };
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|_| invalid())
}

/// Rollups read trace files from disk; keep them off the async workers.
async fn blocking<T: Send + 'static>(
    work: impl FnOnce() -> Result<T, RollupError> + Send + 'static,
) -> Result<T, AppError> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::Internal(format!("rollup task failed: {e}")))?
        .map_err(AppError::from)
}

/// KPI panel for the current UTC day
#[utoipa::path(
    get,
    path = "/api/kpis/today",
    responses(
        (status = 200, description = "Today's KPI panel, or an empty marker", body = DailyRollup)
    ),
    tag = "kpis"
)]
pub async fn get_kpis_today(State(state): State<AppState>) -> Result<Json<DailyRollup>, AppError> {
    let dir = state.traces.dir().to_path_buf();
    let panel = blocking(move || Ok(rollup::rollup_today(&dir))).await?;
    Ok(Json(panel))
}

/// KPI panel for one day
#[utoipa::path(
    get,
    path = "/api/kpis/{date}",
    params(
        ("date" = String, Path, description = "Day as YYYYMMDD")
    ),
    responses(
        (status = 200, description = "KPI panel, or an empty marker", body = DailyRollup),
        (status = 400, description = "Malformed date", body = ApiError)
    ),
    tag = "kpis"
)]
pub async fn get_kpis_for_date(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<DailyRollup>, AppError> {
    let day = parse_day(&date, "date")?;
    let dir = state.traces.dir().to_path_buf();
    let panel = blocking(move || Ok(rollup::rollup_day(&dir, day))).await?;
    Ok(Json(panel))
}

/// Compute and persist the KPI panel for one day
#[utoipa::path(
    post,
    path = "/api/kpis/{date}/save",
    params(
        ("date" = String, Path, description = "Day as YYYYMMDD")
    ),
    responses(
        (status = 200, description = "Saved panel and its file path", body = SavedRollupResponse),
        (status = 400, description = "Malformed date", body = ApiError),
        (status = 500, description = "Panel could not be written", body = ApiError)
    ),
    tag = "kpis"
)]
pub async fn save_kpis_for_date(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<SavedRollupResponse>, AppError> {
    let day = parse_day(&date, "date")?;
    let trace_dir = state.traces.dir().to_path_buf();
    let kpi_dir = state.kpi_dir.clone();
    let (path, panel): (PathBuf, DailyRollup) = blocking(move || {
        let panel = rollup::rollup_day(&trace_dir, day);
        let path = rollup::save_rollup(&panel, &kpi_dir)?;
        Ok((path, panel))
    })
    .await?;

    tracing::info!(date = %date, path = %path.display(), traces = panel.trace_count(), "Saved KPI panel");
    Ok(Json(SavedRollupResponse {
        path: path.display().to_string(),
        rollup: panel,
    }))
}

/// KPI panels for every day with traces in a range
#[utoipa::path(
    get,
    path = "/api/kpis",
    params(RangeQuery),
    responses(
        (status = 200, description = "One panel per day that has a trace file", body = Vec<DailyRollup>),
        (status = 400, description = "Missing or malformed range", body = ApiError)
    ),
    tag = "kpis"
)]
pub async fn get_kpi_range(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<DailyRollup>>, AppError> {
    let required = |value: Option<String>, field: &str| {
        value.ok_or_else(|| AppError::validation(format!("'{field}' is required"), field, None))
    };
    let start = parse_day(&required(query.start, "start")?, "start")?;
    let end = parse_day(&required(query.end, "end")?, "end")?;

    let dir = state.traces.dir().to_path_buf();
    let panels = blocking(move || rollup::rollup_date_range(&dir, start, end)).await?;
    Ok(Json(panels))
}
