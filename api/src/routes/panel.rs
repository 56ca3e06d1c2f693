use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Json, Router};
use taskmine_core::error::ApiError;
use taskmine_core::views::{PanelView, ViewData, render_view};

use crate::error::AppError;
use crate::middleware::trace_log::TraceAnnotation;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/panel/{dataset}/{view}", get(get_panel))
}

/// Render a panel view for a dataset
///
/// Views are dispatched through the dataset's capability table; asking for
/// a view the dataset does not offer is a 400 with the supported list.
#[utoipa::path(
    get,
    path = "/api/panel/{dataset}/{view}",
    params(
        ("dataset" = String, Path, description = "Dataset name"),
        ("view" = String, Path, description = "Panel view, e.g. 'bottlenecks'")
    ),
    responses(
        (status = 200, description = "View data", body = ViewData),
        (status = 400, description = "Unknown or unsupported view", body = ApiError),
        (status = 404, description = "Dataset not loaded", body = ApiError)
    ),
    tag = "panel"
)]
pub async fn get_panel(
    State(state): State<AppState>,
    Path((dataset, view)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let view: PanelView = view.parse().map_err(|_| AppError::Validation {
        message: format!("Unknown panel view '{view}'"),
        field: Some("view".to_string()),
        received: Some(serde_json::Value::String(view.clone())),
        docs_hint: Some(format!(
            "Known views: {}",
            PanelView::ALL.map(PanelView::as_str).join(", ")
        )),
    })?;

    let table = state.dataset(&dataset)?;
    let data = render_view(&dataset, view, &table)?;

    let annotation = TraceAnnotation::for_dataset(&dataset, view.as_str());
    Ok((Extension(annotation), Json(data)))
}
