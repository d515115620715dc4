use axum::extract::State;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tripwire_core::decision::{Decision, DenyReason};
use tripwire_core::identity::{Category, IdentityKey};
use tripwire_core::violations::ViolationOutcome;

use crate::auth::AdminKey;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::middleware::annotate_rate_headers;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/check", post(check_request))
        .route("/v1/violations", post(report_violation))
}

/// Subject of a decision or violation, as resolved by the calling router.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SubjectRequest {
    /// Client IPv4/IPv6 address
    pub remote_address: String,
    /// Authenticated user id; omitted for anonymous traffic
    #[serde(default)]
    pub user_id: Option<String>,
    /// Route category label (e.g. "login", "2fa_setup")
    pub category: String,
}

impl SubjectRequest {
    fn resolve(&self) -> Result<(IdentityKey, Category), AppError> {
        let identity = IdentityKey::from_parts(&self.remote_address, self.user_id.as_deref())?;
        let category = Category::parse(&self.category)?;
        Ok((identity, category))
    }
}

/// Decide whether a request may proceed
///
/// Identity blocks are checked first, then geo blocks and the adaptive
/// hourly budget. Always answers 200; the body carries the decision.
#[utoipa::path(
    post,
    path = "/v1/check",
    request_body = SubjectRequest,
    responses(
        (status = 200, description = "Decision for this request", body = Decision),
        (status = 400, description = "Malformed address or category", body = tripwire_core::error::ApiError)
    ),
    tag = "decisions"
)]
pub async fn check_request(
    State(state): State<AppState>,
    AppJson(req): AppJson<SubjectRequest>,
) -> Result<Response, AppError> {
    let (identity, category) = req.resolve()?;
    let id = identity.to_string();

    let decision = match state.engine.block_remaining(&id).await {
        Ok(Some(retry_after_secs)) => Decision::deny(DenyReason::IpBlocked, retry_after_secs),
        Ok(None) => state.engine.check_and_track(&identity, category).await,
        Err(err) => {
            tracing::error!(error = %err, identity = %id, "block lookup failed, continuing");
            state.engine.check_and_track(&identity, category).await
        }
    };

    let mut response = Json(&decision).into_response();
    annotate_rate_headers(response.headers_mut(), &decision);
    if let Decision::Deny {
        retry_after_secs, ..
    } = decision
    {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    }
    Ok(response)
}

/// Report a violation of a fixed per-route limit
///
/// Violations escalate to identity blocks, so reporters authenticate with
/// an admin key.
#[utoipa::path(
    post,
    path = "/v1/violations",
    request_body = SubjectRequest,
    responses(
        (status = 200, description = "Post-increment window counts", body = ViolationOutcome),
        (status = 400, description = "Malformed address or category", body = tripwire_core::error::ApiError),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError),
        (status = 503, description = "Counter store unavailable", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "decisions"
)]
pub async fn report_violation(
    reporter: AdminKey,
    State(state): State<AppState>,
    AppJson(req): AppJson<SubjectRequest>,
) -> Result<Json<ViolationOutcome>, AppError> {
    let (identity, category) = req.resolve()?;
    let id = identity.to_string();
    let outcome = state.engine.record_violation(category, &id).await?;
    tracing::debug!(reporter = %reporter.key_prefix, identity = %id, category = %category, "violation reported");
    Ok(Json(outcome))
}
