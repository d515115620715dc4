use std::convert::Infallible;
use std::net::IpAddr;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tripwire_core::error::ValidationError;
use tripwire_core::identity::{Category, IdentityKey, parse_remote_address, validate_identity};
use tripwire_core::thresholds::{
    AdaptiveThresholds, Period, RescaleAction, ViolationThresholds, ViolationThresholdsUpdate,
};
use tripwire_core::violations::{
    BlockStatus, BlockedIdentity, IdentityStats, PatternReport, ViolationRecord, ViolationStats,
};

use crate::auth::AdminKey;
use crate::engine::{DEFAULT_BLOCK_DURATION, now_millis};
use crate::error::AppError;
use crate::extract::{AppJson, AppQuery};
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;
const MAX_REASON_LEN: usize = 500;

pub fn read_router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/admin/abuse/thresholds",
            get(get_thresholds),
        )
        .route(
            "/v1/admin/abuse/adaptive-thresholds",
            get(get_adaptive_thresholds),
        )
        .route("/v1/admin/abuse/pattern", get(get_pattern))
        .route("/v1/admin/abuse/block-status", get(get_block_status))
        .route("/v1/admin/abuse/stats", get(get_stats))
        .route("/v1/admin/abuse/violations", get(list_violations))
        .route("/v1/admin/abuse/blocked", get(list_blocked))
        .route("/v1/admin/abuse/identities/{identity}", get(get_identity))
        .route("/v1/admin/abuse/alerts/stream", get(alert_stream))
}

pub fn write_router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/admin/abuse/thresholds",
            post(update_thresholds).put(replace_thresholds),
        )
        .route(
            "/v1/admin/abuse/adaptive-thresholds/rescale",
            post(rescale_adaptive_thresholds),
        )
        .route("/v1/admin/abuse/block", post(create_block))
        .route(
            "/v1/admin/abuse/identities/{identity}/unblock",
            post(unblock_identity),
        )
}

// --- Request / response types ---

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RescaleRequest {
    /// Current system load in [0, 1]
    pub load_factor: f64,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RescaleResponse {
    pub action: RescaleAction,
    pub thresholds: AdaptiveThresholds,
}

/// Block either an identity or a remote address (geo block), not both.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct BlockRequest {
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub remote_address: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Block length in seconds (default 86400)
    #[serde(default)]
    pub duration: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Identity,
    Geo,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct BlockResponse {
    pub kind: BlockKind,
    pub target: String,
    pub blocked_until: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct UnblockResponse {
    pub identity: String,
    /// False when there was no active block (still a success)
    pub was_blocked: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StatsResponse {
    pub period: Period,
    pub categories: Vec<ViolationStats>,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct PatternQuery {
    pub identity: String,
    pub category: String,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct BlockStatusQuery {
    pub identity: String,
    /// Geo-block lookup address; derived from the identity when omitted
    #[serde(default)]
    pub remote_address: Option<String>,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct StatsQuery {
    /// Restrict to one category; all known categories when omitted
    #[serde(default)]
    pub category: Option<String>,
    /// hourly | daily | weekly (default hourly)
    #[serde(default)]
    pub period: Option<String>,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ViolationsQuery {
    pub category: String,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

fn period_or_hourly(raw: Option<&str>) -> Result<Period, ValidationError> {
    raw.map(Period::parse).transpose().map(|p| p.unwrap_or(Period::Hourly))
}

fn clamp_limit(limit: Option<i64>) -> usize {
    limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT as i64)
        .clamp(1, MAX_HISTORY_LIMIT as i64) as usize
}

fn normalize_reason(reason: Option<String>) -> Result<Option<String>, ValidationError> {
    let Some(reason) = reason else {
        return Ok(None);
    };
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_REASON_LEN {
        return Err(ValidationError::new(
            "reason",
            "reason must be at most 500 characters",
        ));
    }
    Ok(Some(trimmed.to_string()))
}

fn block_duration(seconds: Option<i64>) -> Result<Duration, ValidationError> {
    match seconds {
        None => Ok(DEFAULT_BLOCK_DURATION),
        Some(secs) if secs > 0 => Ok(Duration::from_secs(secs as u64)),
        Some(secs) => Err(
            ValidationError::new("duration", "duration must be a positive number of seconds")
                .with_received(serde_json::json!(secs)),
        ),
    }
}

// --- Thresholds ---

/// Current violation thresholds
#[utoipa::path(
    get,
    path = "/v1/admin/abuse/thresholds",
    responses(
        (status = 200, description = "Violation thresholds", body = ViolationThresholds),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn get_thresholds(
    _admin: AdminKey,
    State(state): State<AppState>,
) -> Json<ViolationThresholds> {
    Json(state.engine.violation_thresholds())
}

/// Partially update violation thresholds
#[utoipa::path(
    post,
    path = "/v1/admin/abuse/thresholds",
    request_body = ViolationThresholdsUpdate,
    responses(
        (status = 200, description = "Thresholds now in effect", body = ViolationThresholds),
        (status = 400, description = "Non-positive threshold", body = tripwire_core::error::ApiError),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn update_thresholds(
    admin: AdminKey,
    State(state): State<AppState>,
    AppJson(update): AppJson<ViolationThresholdsUpdate>,
) -> Result<Json<ViolationThresholds>, AppError> {
    let applied = state.engine.update_violation_thresholds(&update).await?;
    tracing::info!(admin = %admin.key_prefix, "violation thresholds changed via admin API");
    Ok(Json(applied))
}

/// Replace all violation thresholds
#[utoipa::path(
    put,
    path = "/v1/admin/abuse/thresholds",
    request_body = ViolationThresholdsUpdate,
    responses(
        (status = 200, description = "Thresholds now in effect", body = ViolationThresholds),
        (status = 400, description = "Missing or non-positive threshold", body = tripwire_core::error::ApiError),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn replace_thresholds(
    admin: AdminKey,
    State(state): State<AppState>,
    AppJson(update): AppJson<ViolationThresholdsUpdate>,
) -> Result<Json<ViolationThresholds>, AppError> {
    for (field, value) in [
        ("hourly", update.hourly),
        ("daily", update.daily),
        ("weekly", update.weekly),
    ] {
        if value.is_none() {
            return Err(AppError::validation(
                field,
                format!("{field} is required when replacing thresholds"),
            ));
        }
    }
    let applied = state.engine.update_violation_thresholds(&update).await?;
    tracing::info!(admin = %admin.key_prefix, "violation thresholds replaced via admin API");
    Ok(Json(applied))
}

/// Current adaptive request budgets
#[utoipa::path(
    get,
    path = "/v1/admin/abuse/adaptive-thresholds",
    responses(
        (status = 200, description = "Adaptive thresholds by pattern and period", body = AdaptiveThresholds),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn get_adaptive_thresholds(
    _admin: AdminKey,
    State(state): State<AppState>,
) -> Json<AdaptiveThresholds> {
    Json(state.engine.adaptive_thresholds())
}

/// Rescale adaptive budgets for the current load
#[utoipa::path(
    post,
    path = "/v1/admin/abuse/adaptive-thresholds/rescale",
    request_body = RescaleRequest,
    responses(
        (status = 200, description = "Rescaled table", body = RescaleResponse),
        (status = 400, description = "load_factor outside [0, 1]", body = tripwire_core::error::ApiError),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn rescale_adaptive_thresholds(
    _admin: AdminKey,
    State(state): State<AppState>,
    AppJson(req): AppJson<RescaleRequest>,
) -> Result<Json<RescaleResponse>, AppError> {
    let (thresholds, action) = state
        .engine
        .update_adaptive_thresholds(req.load_factor)
        .await?;
    Ok(Json(RescaleResponse { action, thresholds }))
}

// --- Blocks ---

/// Install an identity block or a geo block
#[utoipa::path(
    post,
    path = "/v1/admin/abuse/block",
    request_body = BlockRequest,
    responses(
        (status = 200, description = "Block installed", body = BlockResponse),
        (status = 400, description = "Invalid target or duration", body = tripwire_core::error::ApiError),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError),
        (status = 503, description = "Counter store unavailable", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn create_block(
    admin: AdminKey,
    State(state): State<AppState>,
    AppJson(req): AppJson<BlockRequest>,
) -> Result<Json<BlockResponse>, AppError> {
    let reason = normalize_reason(req.reason)?;
    let duration = block_duration(req.duration)?;

    let (kind, target, blocked_until) = match (req.identity, req.remote_address) {
        (Some(identity), None) => {
            let identity = validate_identity(&identity)?;
            let until = state
                .engine
                .block_identity(&identity, reason.as_deref(), duration)
                .await?;
            (BlockKind::Identity, identity, until)
        }
        (None, Some(remote_address)) => {
            let addr = parse_remote_address(&remote_address)?;
            let until = state
                .engine
                .block_geographic(addr, reason.as_deref(), duration)
                .await?;
            (BlockKind::Geo, addr.to_string(), until)
        }
        _ => {
            return Err(AppError::validation(
                "identity",
                "provide exactly one of identity or remote_address",
            ));
        }
    };

    tracing::info!(admin = %admin.key_prefix, kind = ?kind, target = %target, "block requested via admin API");
    Ok(Json(BlockResponse {
        kind,
        target,
        blocked_until,
    }))
}

/// Lift an identity block (idempotent)
#[utoipa::path(
    post,
    path = "/v1/admin/abuse/identities/{identity}/unblock",
    params(("identity" = String, Path, description = "Identity key, e.g. ip=1.2.3.4,user=anonymous")),
    responses(
        (status = 200, description = "Identity is not blocked", body = UnblockResponse),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError),
        (status = 503, description = "Counter store unavailable", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn unblock_identity(
    _admin: AdminKey,
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<UnblockResponse>, AppError> {
    let identity = validate_identity(&identity)?;
    let was_blocked = state.engine.unblock(&identity).await?;
    Ok(Json(UnblockResponse {
        identity,
        was_blocked,
    }))
}

/// Identity and geo block state for one subject
#[utoipa::path(
    get,
    path = "/v1/admin/abuse/block-status",
    params(BlockStatusQuery),
    responses(
        (status = 200, description = "Block status in both namespaces", body = BlockStatus),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError),
        (status = 503, description = "Counter store unavailable", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn get_block_status(
    _admin: AdminKey,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<BlockStatusQuery>,
) -> Result<Json<BlockStatus>, AppError> {
    let identity = validate_identity(&query.identity)?;
    let remote_address: Option<IpAddr> = match query.remote_address.as_deref() {
        Some(raw) => Some(parse_remote_address(raw)?),
        None => identity
            .parse::<IdentityKey>()
            .ok()
            .map(|key| key.remote_address),
    };
    let status = state
        .engine
        .block_status(&identity, remote_address)
        .await?;
    Ok(Json(status))
}

/// Active identity blocks
#[utoipa::path(
    get,
    path = "/v1/admin/abuse/blocked",
    responses(
        (status = 200, description = "Blocked identities, soonest expiry first", body = Vec<BlockedIdentity>),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError),
        (status = 503, description = "Counter store unavailable", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn list_blocked(
    _admin: AdminKey,
    State(state): State<AppState>,
) -> Result<Json<Vec<BlockedIdentity>>, AppError> {
    Ok(Json(state.insights.blocked_identities().await?))
}

// --- Queries ---

/// Current cadence classification
#[utoipa::path(
    get,
    path = "/v1/admin/abuse/pattern",
    params(PatternQuery),
    responses(
        (status = 200, description = "Classification result", body = PatternReport),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError),
        (status = 503, description = "Counter store unavailable", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn get_pattern(
    _admin: AdminKey,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<PatternQuery>,
) -> Result<Json<PatternReport>, AppError> {
    let identity = validate_identity(&query.identity)?;
    let category = Category::parse(&query.category)?;
    let pattern = state
        .engine
        .classifier()
        .classify(&identity, category, now_millis())
        .await?;
    Ok(Json(PatternReport {
        identity,
        category,
        pattern,
    }))
}

/// Violation aggregates per category
#[utoipa::path(
    get,
    path = "/v1/admin/abuse/stats",
    params(StatsQuery),
    responses(
        (status = 200, description = "Windowed violation statistics", body = StatsResponse),
        (status = 400, description = "Unknown period or malformed category", body = tripwire_core::error::ApiError),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError),
        (status = 503, description = "Counter store unavailable", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn get_stats(
    _admin: AdminKey,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<StatsQuery>,
) -> Result<Json<StatsResponse>, AppError> {
    let period = period_or_hourly(query.period.as_deref())?;
    let categories = match query.category.as_deref() {
        Some(raw) => vec![Category::parse(raw)?],
        None => Category::ALL.to_vec(),
    };
    let mut stats = Vec::with_capacity(categories.len());
    for category in categories {
        stats.push(state.insights.violation_stats(category, period).await?);
    }
    Ok(Json(StatsResponse {
        period,
        categories: stats,
    }))
}

/// Recent violations for one category, newest first
#[utoipa::path(
    get,
    path = "/v1/admin/abuse/violations",
    params(ViolationsQuery),
    responses(
        (status = 200, description = "Violation records", body = Vec<ViolationRecord>),
        (status = 400, description = "Unknown period or malformed category", body = tripwire_core::error::ApiError),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError),
        (status = 503, description = "Counter store unavailable", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn list_violations(
    _admin: AdminKey,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<ViolationsQuery>,
) -> Result<Json<Vec<ViolationRecord>>, AppError> {
    let category = Category::parse(&query.category)?;
    let period = period_or_hourly(query.period.as_deref())?;
    let limit = clamp_limit(query.limit);
    Ok(Json(
        state
            .insights
            .violation_history(category, period, limit)
            .await?,
    ))
}

/// Violation summary for one identity
#[utoipa::path(
    get,
    path = "/v1/admin/abuse/identities/{identity}",
    params(("identity" = String, Path, description = "Identity key, e.g. ip=1.2.3.4,user=anonymous")),
    responses(
        (status = 200, description = "Identity statistics (empty when unknown)", body = IdentityStats),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError),
        (status = 503, description = "Counter store unavailable", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn get_identity(
    _admin: AdminKey,
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<IdentityStats>, AppError> {
    let identity = validate_identity(&identity)?;
    Ok(Json(state.insights.identity_stats(&identity).await?))
}

/// Live alert feed (Server-Sent Events)
#[utoipa::path(
    get,
    path = "/v1/admin/abuse/alerts/stream",
    responses(
        (status = 200, description = "Alert events, one JSON object per `alert` event", body = String, content_type = "text/event-stream"),
        (status = 401, description = "Missing or invalid admin key", body = tripwire_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn alert_stream(
    _admin: AdminKey,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.alert_feed.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = match rx.recv().await {
            Ok(alert) => Event::default()
                .event("alert")
                .json_data(&alert)
                .unwrap_or_else(|_| Event::default().comment("unserializable alert")),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "alert stream subscriber lagging");
                Event::default().comment(format!("skipped {skipped} alerts"))
            }
            Err(RecvError::Closed) => return None,
        };
        Some((Ok::<_, Infallible>(event), rx))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use tokio::sync::broadcast;
    use tower::ServiceExt;
    use tripwire_core::auth::generate_api_key;

    use super::*;
    use crate::alerting::{FEED_CAPACITY, alert_channel};
    use crate::config::AppConfig;
    use crate::routes;
    use crate::store::MemoryStore;

    struct Harness {
        app: Router,
        state: AppState,
        key: String,
    }

    fn harness() -> Harness {
        let (key, hash) = generate_api_key();
        let config = AppConfig {
            admin_key_hashes: vec![hash],
            ..AppConfig::default()
        };
        let (sender, _rx) = alert_channel(64);
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        let state = AppState::new(Arc::new(MemoryStore::new()), &config, sender, feed);
        let app = routes::router(&state, false).with_state(state.clone());
        Harness { app, state, key }
    }

    fn request(method: &str, uri: &str, key: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let mut req = builder.body(body).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("198.51.100.200:7000".parse::<SocketAddr>().unwrap()));
        req
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn admin_routes_require_a_configured_key() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(request("GET", "/v1/admin/abuse/thresholds", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let (stranger, _) = generate_api_key();
        let response = h
            .app
            .oneshot(request("GET", "/v1/admin/abuse/thresholds", Some(&stranger), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(response).await["error"], "unauthorized");
    }

    #[tokio::test]
    async fn thresholds_can_be_patched_and_replaced() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/admin/abuse/thresholds",
                Some(&h.key),
                Some(serde_json::json!({ "weekly": 3 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json(response).await,
            serde_json::json!({ "hourly": 10, "daily": 30, "weekly": 3 })
        );

        let response = h
            .app
            .clone()
            .oneshot(request(
                "PUT",
                "/v1/admin/abuse/thresholds",
                Some(&h.key),
                Some(serde_json::json!({ "hourly": 5 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["field"], "daily");

        let response = h
            .app
            .oneshot(request(
                "POST",
                "/v1/admin/abuse/thresholds",
                Some(&h.key),
                Some(serde_json::json!({ "hourly": 0 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(h.state.engine.violation_thresholds().weekly, 3);
        assert_eq!(h.state.engine.violation_thresholds().hourly, 10);
    }

    #[tokio::test]
    async fn block_then_status_then_unblock() {
        let h = harness();
        let identity = "ip=192.0.2.40,user=anonymous";

        let response = h
            .app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/admin/abuse/block",
                Some(&h.key),
                Some(serde_json::json!({ "identity": identity, "reason": "  credential stuffing ", "duration": 600 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["kind"], "identity");

        let response = h
            .app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/admin/abuse/block",
                Some(&h.key),
                Some(serde_json::json!({ "remote_address": "192.0.2.40" })),
            ))
            .await
            .unwrap();
        assert_eq!(json(response).await["kind"], "geo");

        let response = h
            .app
            .clone()
            .oneshot(request(
                "GET",
                "/v1/admin/abuse/block-status?identity=ip%3D192.0.2.40%2Cuser%3Danonymous",
                Some(&h.key),
                None,
            ))
            .await
            .unwrap();
        let status = json(response).await;
        assert_eq!(status["blocked"], true);
        assert_eq!(status["reason"], "credential stuffing");
        assert_eq!(status["geo_blocked"], true);

        let unblock_uri = "/v1/admin/abuse/identities/ip%3D192.0.2.40%2Cuser%3Danonymous/unblock";
        for expected in [true, false] {
            let response = h
                .app
                .clone()
                .oneshot(request("POST", unblock_uri, Some(&h.key), None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(json(response).await["was_blocked"], expected);
        }
        assert!(!h.state.engine.is_blocked(identity).await.unwrap());
    }

    #[tokio::test]
    async fn block_requires_exactly_one_target() {
        let h = harness();
        let response = h
            .app
            .oneshot(request(
                "POST",
                "/v1/admin/abuse/block",
                Some(&h.key),
                Some(serde_json::json!({ "identity": "ip=192.0.2.41,user=anonymous", "remote_address": "192.0.2.41" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn violation_reports_require_a_configured_key() {
        let h = harness();
        let body = serde_json::json!({ "remote_address": "192.0.2.43", "category": "login" });
        for key in [None, Some(generate_api_key().0)] {
            let response = h
                .app
                .clone()
                .oneshot(request("POST", "/v1/violations", key.as_deref(), Some(body.clone())))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        assert!(
            !h.state
                .engine
                .store()
                .exists(&crate::store::keys::violation_counter(
                    Period::Hourly,
                    Category::Login,
                    "ip=192.0.2.43,user=anonymous",
                ))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn reported_violations_show_up_in_stats_and_history() {
        let h = harness();
        for _ in 0..3 {
            let response = h
                .app
                .clone()
                .oneshot(request(
                    "POST",
                    "/v1/violations",
                    Some(&h.key),
                    Some(serde_json::json!({ "remote_address": "192.0.2.42", "category": "2fa_setup" })),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = h
            .app
            .clone()
            .oneshot(request(
                "GET",
                "/v1/admin/abuse/stats?category=2fa_setup&period=daily",
                Some(&h.key),
                None,
            ))
            .await
            .unwrap();
        let stats = json(response).await;
        assert_eq!(stats["period"], "daily");
        assert_eq!(stats["categories"][0]["total"], 3);
        assert_eq!(stats["categories"][0]["unique_identities"], 1);

        let response = h
            .app
            .clone()
            .oneshot(request(
                "GET",
                "/v1/admin/abuse/violations?category=2fa_setup&limit=2",
                Some(&h.key),
                None,
            ))
            .await
            .unwrap();
        let history = json(response).await;
        assert_eq!(history.as_array().unwrap().len(), 2);
        assert_eq!(history[0]["identity"], "ip=192.0.2.42,user=anonymous");

        let response = h
            .app
            .oneshot(request(
                "GET",
                "/v1/admin/abuse/identities/ip%3D192.0.2.42%2Cuser%3Danonymous",
                Some(&h.key),
                None,
            ))
            .await
            .unwrap();
        let identity = json(response).await;
        assert_eq!(identity["total_violations"], 3);
        assert_eq!(identity["violations_by_category"]["2fa_setup"], 3);
    }

    #[tokio::test]
    async fn check_reports_identity_blocks_and_budget_headers() {
        let h = harness();
        let body = serde_json::json!({ "remote_address": "192.0.2.43", "category": "login" });

        let response = h
            .app
            .clone()
            .oneshot(request("POST", "/v1/check", None, Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "99");
        assert_eq!(json(response).await["decision"], "allow");

        h.state
            .engine
            .block_identity("ip=192.0.2.43,user=anonymous", None, Duration::from_secs(60))
            .await
            .unwrap();
        let response = h
            .app
            .oneshot(request("POST", "/v1/check", None, Some(body)))
            .await
            .unwrap();
        assert!(response.headers().contains_key("retry-after"));
        let decision = json(response).await;
        assert_eq!(decision["decision"], "deny");
        assert_eq!(decision["reason"], "IP_BLOCKED");
    }

    #[tokio::test]
    async fn malformed_check_input_is_a_structured_400() {
        let h = harness();
        let response = h
            .app
            .oneshot(request(
                "POST",
                "/v1/check",
                None,
                Some(serde_json::json!({ "remote_address": "not-an-ip", "category": "login" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["field"], "remote_address");
    }

    #[tokio::test]
    async fn rescale_rejects_out_of_range_load() {
        let h = harness();
        let response = h
            .app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/admin/abuse/adaptive-thresholds/rescale",
                Some(&h.key),
                Some(serde_json::json!({ "load_factor": 0.95 })),
            ))
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["action"], "tightened");
        assert_eq!(body["thresholds"]["normal"]["hourly"], 70);

        let response = h
            .app
            .oneshot(request(
                "POST",
                "/v1/admin/abuse/adaptive-thresholds/rescale",
                Some(&h.key),
                Some(serde_json::json!({ "load_factor": -0.1 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn history_limit_is_clamped() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), 500);
    }
}
