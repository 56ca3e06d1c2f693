use std::collections::BTreeSet;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use taskmine_core::error::ApiError;
use taskmine_core::schema::VocabularyKind;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/schema/{dataset}", get(get_schema))
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct SchemaResponse {
    pub dataset: String,
    /// Bumped every time the vocabulary is rebuilt.
    pub generation: u64,
    pub columns: BTreeSet<String>,
    pub activities: BTreeSet<String>,
    pub teams: BTreeSet<String>,
    pub users: BTreeSet<String>,
    pub processes: BTreeSet<String>,
    pub window_titles: BTreeSet<String>,
}

/// Known vocabulary for a dataset
#[utoipa::path(
    get,
    path = "/api/schema/{dataset}",
    params(
        ("dataset" = String, Path, description = "Dataset name")
    ),
    responses(
        (status = 200, description = "Valid column names and entity values", body = SchemaResponse),
        (status = 404, description = "Dataset not loaded", body = ApiError)
    ),
    tag = "schema"
)]
pub async fn get_schema(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
) -> Result<Json<SchemaResponse>, AppError> {
    let schema = state.schema();
    let vocabulary = schema.vocabulary(&dataset).ok_or_else(|| AppError::NotFound {
        resource: format!("dataset/{dataset}"),
    })?;
    let terms = |kind: VocabularyKind| vocabulary.terms(kind).values().clone();

    Ok(Json(SchemaResponse {
        generation: schema.generation(),
        columns: terms(VocabularyKind::Columns),
        activities: terms(VocabularyKind::Activities),
        teams: terms(VocabularyKind::Teams),
        users: terms(VocabularyKind::Users),
        processes: terms(VocabularyKind::Processes),
        window_titles: terms(VocabularyKind::WindowTitles),
        dataset,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::state::fixture_state;

    #[tokio::test]
    async fn lists_dataset_vocabulary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = router().with_state(fixture_state(dir.path()));
        let response = app
            .oneshot(Request::get("/api/schema/salesforce").body(Body::empty()).expect("valid request"))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body: Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(body["dataset"], json!("salesforce"));
        assert_eq!(body["teams"], json!(["Ops", "Sales"]));
        assert_eq!(body["users"], json!(["ana", "ben", "cat"]));
        assert_eq!(body["processes"], json!(["crm", "mail"]));
        assert_eq!(body["window_titles"], json!([]));
    }

    #[tokio::test]
    async fn unknown_dataset_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = router().with_state(fixture_state(dir.path()));
        let response = app
            .oneshot(Request::get("/api/schema/jira").body(Body::empty()).expect("valid request"))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
