use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use taskmine_core::error::{self, ApiError};
use taskmine_core::rollup::RollupError;
use taskmine_core::views::ViewError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Unknown dataset or missing resource (404)
    NotFound { resource: String },
    /// The dataset profile does not offer this view (400)
    UnsupportedView {
        dataset: String,
        view: String,
        supported: Vec<String>,
    },
    /// Internal error (500)
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>, field: &str, received: Option<serde_json::Value>) -> Self {
        AppError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
            received,
            docs_hint: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message: format!("{resource} not found"),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: Some("GET /api/datasets lists the datasets that are loaded.".to_string()),
                },
            ),
            AppError::UnsupportedView {
                dataset,
                view,
                supported,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::UNSUPPORTED_VIEW.to_string(),
                    message: format!("View '{view}' is not available for dataset '{dataset}'"),
                    field: Some("view".to_string()),
                    received: Some(serde_json::Value::String(view)),
                    request_id,
                    docs_hint: Some(format!("Supported views: {}", supported.join(", "))),
                },
            ),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl From<ViewError> for AppError {
    fn from(err: ViewError) -> Self {
        match err {
            ViewError::Unsupported { dataset, view } => {
                let supported = taskmine_core::views::DatasetProfile::for_dataset(&dataset)
                    .map(|profile| {
                        profile
                            .supported_views()
                            .into_iter()
                            .map(|v| v.as_str().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                AppError::UnsupportedView {
                    dataset,
                    view: view.as_str().to_string(),
                    supported,
                }
            }
            ViewError::UnknownDataset(dataset) => AppError::NotFound {
                resource: format!("dataset/{dataset}"),
            },
        }
    }
}

impl From<RollupError> for AppError {
    fn from(err: RollupError) -> Self {
        match err {
            RollupError::InvalidRange { .. } => AppError::Validation {
                message: err.to_string(),
                field: Some("start".to_string()),
                received: None,
                docs_hint: Some("start must not be after end (both YYYYMMDD).".to_string()),
            },
            other => AppError::Internal(other.to_string()),
        }
    }
}
