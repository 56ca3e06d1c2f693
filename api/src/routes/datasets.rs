use std::collections::BTreeMap;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use taskmine_core::columns::LogicalField;
use taskmine_core::views::{DatasetProfile, PanelView};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/datasets", get(list_datasets))
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct DatasetInfo {
    pub name: String,
    pub label: Option<String>,
    pub rows: usize,
    pub columns: Vec<String>,
    /// Physical column behind each logical field, `null` when unresolved.
    pub resolved_columns: BTreeMap<String, Option<String>>,
    pub supported_views: Vec<PanelView>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct DatasetsResponse {
    pub datasets: Vec<DatasetInfo>,
}

/// List loaded datasets
#[utoipa::path(
    get,
    path = "/api/datasets",
    responses(
        (status = 200, description = "Loaded datasets with resolved columns", body = DatasetsResponse)
    ),
    tag = "datasets"
)]
pub async fn list_datasets(State(state): State<AppState>) -> Json<DatasetsResponse> {
    let datasets = state
        .datasets
        .iter()
        .map(|(name, table)| {
            let profile = DatasetProfile::for_dataset(name);
            DatasetInfo {
                name: name.clone(),
                label: profile.map(|p| p.label.to_string()),
                rows: table.len(),
                columns: table.columns().to_vec(),
                resolved_columns: LogicalField::ALL
                    .into_iter()
                    .map(|field| {
                        (
                            field.as_str().to_string(),
                            table.resolve(field).map(str::to_string),
                        )
                    })
                    .collect(),
                supported_views: profile.map(|p| p.supported_views()).unwrap_or_default(),
            }
        })
        .collect();

    Json(DatasetsResponse { datasets })
}
