use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use taskmine_core::error::ApiError;
use taskmine_core::routing::RouterDecision;
use taskmine_core::schema::HallucinationCheck;
use taskmine_core::table::{TableFilters, filter_table};
use taskmine_core::trace::ExtractedMetrics;
use taskmine_core::verify::VerificationSummary;

use crate::error::AppError;
use crate::extract::AppJson;
use crate::middleware::trace_log::TraceAnnotation;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/analyze/{dataset}", post(analyze_answer))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct AnalyzeRequest {
    /// The generated answer to verify
    pub answer_text: String,
    /// The user question, used for the routing check
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub filters: TableFilters,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_prompt: Option<u64>,
    #[serde(default)]
    pub tokens_completion: Option<u64>,
    #[serde(default)]
    pub latency_ms_model: Option<f64>,
    /// Overrides the configured relative tolerance
    #[serde(default)]
    pub tolerance_pct: Option<f64>,
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct AnalyzeResponse {
    pub dataset: String,
    pub slice_rows: usize,
    pub verification: VerificationSummary,
    pub hallucination_check: HallucinationCheck,
    pub router: RouterDecision,
}

/// Verify a generated answer against a dataset
///
/// Extracts numeric claims from `answer_text`, recomputes each one from the
/// filtered dataset and flags references to columns, teams or activities
/// the dataset does not contain.
#[utoipa::path(
    post,
    path = "/api/analyze/{dataset}",
    params(
        ("dataset" = String, Path, description = "Dataset name (e.g. 'salesforce')")
    ),
    request_body = AnalyzeRequest,
    responses(
        (status = 200, description = "Verification result", body = AnalyzeResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 404, description = "Dataset not loaded", body = ApiError)
    ),
    tag = "analyze"
)]
pub async fn analyze_answer(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    AppJson(req): AppJson<AnalyzeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tolerance_pct = match req.tolerance_pct {
        Some(t) if !t.is_finite() || t < 0.0 => {
            return Err(AppError::validation(
                "tolerance_pct must be a non-negative number",
                "tolerance_pct",
                Some(serde_json::json!(t)),
            ));
        }
        Some(t) => t,
        None => state.verifier.tolerance_pct(),
    };

    let table = state.dataset(&dataset)?;
    let slice = filter_table(&table, &req.filters);
    let verification = state.verifier.verify_with_tolerance(
        &req.answer_text,
        &slice,
        &dataset,
        &req.filters,
        tolerance_pct,
    );
    let hallucination_check = state.references.validate(&req.answer_text, &dataset);
    let router = RouterDecision::evaluate(&dataset, req.query.as_deref());

    tracing::info!(
        dataset = %dataset,
        slice_rows = slice.len(),
        claims = verification.all_claims.len(),
        grounded = ?verification.grounded_accuracy_pass,
        hallucinations = hallucination_check.unknown_entities.len(),
        "Analyzed answer"
    );

    let annotation = TraceAnnotation {
        dataset: Some(dataset.clone()),
        intent: req.intent.clone().or_else(|| Some("analyze".to_string())),
        filters: serde_json::to_value(&req.filters).ok(),
        model: req.model,
        tokens_prompt: req.tokens_prompt,
        tokens_completion: req.tokens_completion,
        latency_ms_model: req.latency_ms_model,
        extracted_metrics: Some(ExtractedMetrics {
            verification: verification.clone(),
            hallucination_check: Some(hallucination_check.clone()),
        }),
        router: Some(router.clone()),
        session_id: req.session_id,
        user_id: req.user_id,
        resolved: req.resolved,
        error: None,
    };

    Ok((
        Extension(annotation),
        Json(AnalyzeResponse {
            dataset,
            slice_rows: slice.len(),
            verification,
            hallucination_check,
            router,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::state::fixture_state;

    async fn post_json(uri: &str, body: Value) -> (StatusCode, Value) {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = router().with_state(fixture_state(dir.path()));
        let response = app
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("valid request"),
            )
            .await
            .expect("infallible");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn verifies_grounded_answer() {
        let (status, body) = post_json(
            "/api/analyze/salesforce",
            json!({"answer_text": "The average duration is 17.5 seconds.", "query": "salesforce durations?"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["slice_rows"], json!(4));
        assert_eq!(body["verification"]["grounded_accuracy_pass"], json!(true));
        assert_eq!(body["router"]["correct"], json!(true));
        assert_eq!(body["hallucination_check"]["checked"], json!(true));
    }

    #[tokio::test]
    async fn filters_narrow_the_slice() {
        let (status, body) = post_json(
            "/api/analyze/salesforce",
            json!({"answer_text": "cases: 1", "filters": {"team": "Sales"}}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["slice_rows"], json!(2));
        assert_eq!(body["verification"]["claims_passed"], json!(1));
        assert_eq!(body["router"]["correct"], Value::Null);
    }

    #[tokio::test]
    async fn unknown_dataset_is_not_found() {
        let (status, body) = post_json("/api/analyze/nope", json!({"answer_text": "x"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("not_found"));
    }

    #[tokio::test]
    async fn missing_answer_text_is_a_validation_error() {
        let (status, body) = post_json("/api/analyze/salesforce", json!({"query": "x"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], json!("answer_text"));
    }

    #[tokio::test]
    async fn negative_tolerance_is_rejected() {
        let (status, body) = post_json(
            "/api/analyze/salesforce",
            json!({"answer_text": "cases: 1", "tolerance_pct": -0.5}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], json!("tolerance_pct"));
    }
}
