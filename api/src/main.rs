use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod alerting;
mod auth;
mod classifier;
mod config;
mod engine;
mod error;
mod extract;
mod insights;
mod middleware;
mod routes;
mod state;
mod store;

use alerting::{AlertDispatcher, FEED_CAPACITY, LogNotifier, WebhookNotifier, alert_channel};
use store::MemoryStore;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Tripwire API",
        version = "0.1.0",
        description = "Adaptive abuse detection and rate limiting. Routers ask for a decision per request; operators tune thresholds and lift blocks through the admin API."
    ),
    paths(
        routes::health::health_check,
        routes::check::check_request,
        routes::check::report_violation,
        routes::admin::get_thresholds,
        routes::admin::update_thresholds,
        routes::admin::replace_thresholds,
        routes::admin::get_adaptive_thresholds,
        routes::admin::rescale_adaptive_thresholds,
        routes::admin::create_block,
        routes::admin::unblock_identity,
        routes::admin::get_block_status,
        routes::admin::list_blocked,
        routes::admin::get_pattern,
        routes::admin::get_stats,
        routes::admin::list_violations,
        routes::admin::get_identity,
        routes::admin::alert_stream,
    ),
    components(schemas(
        HealthResponse,
        routes::check::SubjectRequest,
        routes::admin::RescaleRequest,
        routes::admin::RescaleResponse,
        routes::admin::BlockRequest,
        routes::admin::BlockKind,
        routes::admin::BlockResponse,
        routes::admin::UnblockResponse,
        routes::admin::StatsResponse,
        tripwire_core::error::ApiError,
        tripwire_core::decision::Decision,
        tripwire_core::decision::DenyReason,
        tripwire_core::thresholds::Period,
        tripwire_core::thresholds::Pattern,
        tripwire_core::thresholds::ViolationThresholds,
        tripwire_core::thresholds::ViolationThresholdsUpdate,
        tripwire_core::thresholds::PeriodBudget,
        tripwire_core::thresholds::AdaptiveThresholds,
        tripwire_core::thresholds::RescaleAction,
        tripwire_core::violations::ViolationRecord,
        tripwire_core::violations::ViolationCounts,
        tripwire_core::violations::ViolationOutcome,
        tripwire_core::violations::ViolationStats,
        tripwire_core::violations::PeriodCounts,
        tripwire_core::violations::IdentityStats,
        tripwire_core::violations::BlockedIdentity,
        tripwire_core::violations::BlockStatus,
        tripwire_core::violations::PatternReport,
        tripwire_core::alerts::Alert,
        tripwire_core::alerts::AlertField,
        tripwire_core::alerts::AlertKind,
        tripwire_core::alerts::Severity,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tripwire_api=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = config::AppConfig::from_env();
    if config.admin_key_hashes.is_empty() {
        tracing::warn!("TRIPWIRE_ADMIN_KEY_HASHES is empty, admin API will reject every request");
    }

    // Counter store with background expiry sweep
    let store = Arc::new(MemoryStore::new());
    let _janitor = store.spawn_janitor(config.janitor_interval);

    // Alert pipeline: engine -> bounded queue -> dispatcher -> feed + notifiers
    let (alerts, alert_rx) = alert_channel(config.alert_queue_capacity);
    let (alert_feed, _) = broadcast::channel(FEED_CAPACITY);
    let mut dispatcher =
        AlertDispatcher::new(alert_rx, alert_feed.clone()).with_notifier(Arc::new(LogNotifier));
    if let Some(url) = config.alert_webhook_url.as_deref() {
        match WebhookNotifier::new(url) {
            Ok(webhook) => dispatcher = dispatcher.with_notifier(Arc::new(webhook)),
            Err(err) => tracing::warn!(error = %err, "alert webhook disabled"),
        }
    }
    let _dispatcher = dispatcher.spawn();

    let app_state = state::AppState::new(store, &config, alerts, alert_feed);

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::router(&app_state, true))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(
        %addr,
        hourly = config.violation_thresholds.hourly,
        daily = config.violation_thresholds.daily,
        weekly = config.violation_thresholds.weekly,
        "tripwire API listening"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listen address");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}
