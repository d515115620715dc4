use std::convert::Infallible;
use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::Response;
use axum::response::IntoResponse;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use tower::{Layer, Service, ServiceExt};
use tower_governor::{
    GovernorError, GovernorLayer, governor::GovernorConfigBuilder,
    key_extractor::SmartIpKeyExtractor,
};
use tripwire_core::identity::Category;

use super::request_identity;
use crate::engine::AbuseEngine;
use crate::error::AppError;
use crate::store::ceil_secs;

type AdminRateLimitLayer =
    GovernorLayer<SmartIpKeyExtractor, governor::middleware::NoOpMiddleware, axum::body::Body>;

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Rate limit for the admin API: 60 requests per minute per IP, burst 30.
pub fn admin_layer() -> AdminRateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_second(1)
            .burst_size(30)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for admin"),
    )
    .error_handler(json_error_handler)
}

/// JSON error body in ApiError format with Retry-After header.
fn json_error_handler(err: GovernorError) -> Response<axum::body::Body> {
    match err {
        GovernorError::TooManyRequests { wait_time, .. } => AppError::RateLimited {
            retry_after_secs: wait_time.max(1),
        }
        .into_response(),
        GovernorError::UnableToExtractKey => {
            AppError::Internal("unable to determine client address for rate limiting".to_string())
                .into_response()
        }
        GovernorError::Other { msg, .. } => {
            AppError::Internal(msg.unwrap_or_default().to_string()).into_response()
        }
    }
}

/// Fixed GCRA limit per identity for sensitive routes. Tripping it records
/// an enforcement violation with the engine, which is what feeds the
/// hourly/daily/weekly escalation.
#[derive(Clone)]
pub struct StrictRouteLimitLayer {
    limiter: Arc<KeyedLimiter>,
    engine: Arc<AbuseEngine>,
    category: Category,
    trust_forwarded_for: bool,
}

impl StrictRouteLimitLayer {
    pub fn per_minute(
        engine: Arc<AbuseEngine>,
        category: Category,
        requests: NonZeroU32,
        trust_forwarded_for: bool,
    ) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(requests))),
            engine,
            category,
            trust_forwarded_for,
        }
    }
}

impl<S> Layer<S> for StrictRouteLimitLayer {
    type Service = StrictRouteLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        StrictRouteLimitService {
            inner,
            limiter: self.limiter.clone(),
            engine: self.engine.clone(),
            category: self.category,
            trust_forwarded_for: self.trust_forwarded_for,
        }
    }
}

#[derive(Clone)]
pub struct StrictRouteLimitService<S> {
    inner: S,
    limiter: Arc<KeyedLimiter>,
    engine: Arc<AbuseEngine>,
    category: Category,
    trust_forwarded_for: bool,
}

impl<S> Service<Request> for StrictRouteLimitService<S>
where
    S: Service<Request, Response = axum::response::Response, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = axum::response::Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let engine = self.engine.clone();
        let category = self.category;

        let identity = request_identity(&req, self.trust_forwarded_for).map(|key| key.to_string());
        let wait = identity.as_ref().and_then(|id| {
            self.limiter
                .check_key(id)
                .err()
                .map(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
        });

        Box::pin(async move {
            let (Some(id), Some(wait)) = (identity, wait) else {
                return Ok(ready.oneshot(req).await.into_response());
            };

            tracing::warn!(identity = %id, category = %category, "strict route limit exceeded");
            match engine.record_violation(category, &id).await {
                Ok(outcome) => tracing::debug!(
                    identity = %id,
                    hourly = outcome.counts.hourly,
                    weekly = outcome.counts.weekly,
                    blocked = outcome.blocked,
                    "violation recorded"
                ),
                Err(err) => {
                    tracing::error!(error = %err, identity = %id, "failed to record violation")
                }
            }
            Ok(AppError::RateLimited {
                retry_after_secs: ceil_secs(wait).max(1),
            }
            .into_response())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::Router;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::StatusCode;
    use axum::routing::post;
    use tripwire_core::thresholds::{Period, ViolationThresholds};

    use super::*;
    use crate::engine::tests::engine_with;
    use crate::store::{CounterStore, MemoryStore, keys};

    fn request(addr: &str) -> Request {
        let mut req = Request::builder()
            .method("POST")
            .uri("/v1/admin/abuse/block")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(format!("{addr}:6000").parse::<SocketAddr>().unwrap()));
        req
    }

    #[tokio::test]
    async fn tripping_the_limit_records_a_violation() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _rx) = engine_with(store.clone(), ViolationThresholds::default());
        let layer = StrictRouteLimitLayer::per_minute(
            Arc::new(engine),
            Category::Admin,
            NonZeroU32::new(2).unwrap(),
            false,
        );
        let app = Router::new()
            .route("/v1/admin/abuse/block", post(|| async { "ok" }))
            .layer(layer);

        for _ in 0..2 {
            let response = app.clone().oneshot(request("192.0.2.30")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(request("192.0.2.30")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));

        let counter = store
            .get(&keys::violation_counter(
                Period::Hourly,
                Category::Admin,
                "ip=192.0.2.30,user=anonymous",
            ))
            .await
            .unwrap();
        assert_eq!(counter.as_deref(), Some("1"));

        // separate identities get separate buckets
        let response = app.oneshot(request("192.0.2.31")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
