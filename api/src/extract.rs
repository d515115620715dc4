//! Extractors that turn axum rejections into structured `AppError` responses.
//!
//! `AppJson<T>` and `AppQuery<T>` replace `axum::Json<T>` / `axum::extract::Query<T>`
//! in handler signatures so malformed input gets the same JSON error body as
//! every other validation failure.

use axum::{
    Json,
    extract::{
        FromRequest, FromRequestParts, Query, Request,
        rejection::{JsonRejection, QueryRejection},
    },
    http::request::Parts,
};

use crate::error::AppError;

const SCHEMA_HINT: &str =
    "Check the request against the endpoint's schema (GET /api-doc/openapi.json).";

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

pub struct AppQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(AppQuery(value)),
            Err(rejection) => Err(rejection_to_validation(
                "query",
                "Invalid query string",
                &rejection.body_text(),
            )),
        }
    }
}

pub fn map_json_rejection(rejection: JsonRejection) -> AppError {
    rejection_to_validation("body", "Invalid request body", &rejection.body_text())
}

fn rejection_to_validation(fallback_field: &str, prefix: &str, body_text: &str) -> AppError {
    AppError::Validation {
        message: format!("{prefix}: {body_text}"),
        field: Some(
            extract_field_from_serde_message(body_text)
                .unwrap_or_else(|| fallback_field.to_string()),
        ),
        received: None,
        docs_hint: Some(SCHEMA_HINT.to_string()),
    }
}

/// Pull the field name out of serde's "missing field `x`" / "unknown field `x`" messages.
fn extract_field_from_serde_message(msg: &str) -> Option<String> {
    ["missing field `", "unknown field `"]
        .iter()
        .find_map(|marker| {
            let after = &msg[msg.find(marker)? + marker.len()..];
            after.find('`').map(|end| after[..end].to_string())
        })
}
