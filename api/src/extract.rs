//! Custom extractors that convert axum rejections to structured AppError responses.
//!
//! Use `AppJson<T>` in place of `axum::Json<T>` in handler signatures so a
//! malformed body yields the same JSON error shape as every other failure.

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};

use crate::error::AppError;

/// JSON extractor that converts deserialization errors to structured `AppError` responses.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(map_json_rejection(rejection)),
        }
    }
}

/// Convert a `JsonRejection` to a structured `AppError::Validation`.
pub fn map_json_rejection(rejection: JsonRejection) -> AppError {
    let body_text = rejection.body_text();
    let field_hint = extract_field_from_serde_message(&body_text);

    AppError::Validation {
        message: format!("Invalid request body: {body_text}"),
        field: Some(field_hint.unwrap_or_else(|| "body".to_string())),
        received: None,
        docs_hint: Some(
            "Check the request body against the endpoint's schema (GET /api-doc/openapi.json)."
                .to_string(),
        ),
    }
}

/// Pull the field name out of serde's "missing field `x`" / "unknown field `x`".
fn extract_field_from_serde_message(msg: &str) -> Option<String> {
    ["missing field `", "unknown field `"].iter().find_map(|marker| {
        let after = &msg[msg.find(marker)? + marker.len()..];
        after.find('`').map(|end| after[..end].to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_missing_field_name() {
        let msg = "Failed to deserialize the JSON body: missing field `answer_text` at line 1 column 2";
        assert_eq!(
            extract_field_from_serde_message(msg),
            Some("answer_text".to_string())
        );
    }

    #[test]
    fn extracts_unknown_field_name() {
        let msg = "unknown field `foo`, expected one of `bar`, `baz`";
        assert_eq!(extract_field_from_serde_message(msg), Some("foo".to_string()));
    }

    #[test]
    fn returns_none_for_generic_error() {
        let msg = "invalid type: string, expected f64";
        assert_eq!(extract_field_from_serde_message(msg), None);
    }
}
