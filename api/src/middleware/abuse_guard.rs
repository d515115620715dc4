use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service, ServiceExt};
use tripwire_core::decision::{Decision, DenyReason};
use tripwire_core::identity::Category;

use super::{annotate_rate_headers, request_identity};
use crate::engine::AbuseEngine;
use crate::error::AppError;

/// Runs every request through the abuse engine: identity blocks first, then
/// geo blocks and the adaptive budget. Store trouble lets the request through.
#[derive(Clone)]
pub struct AbuseGuardLayer {
    engine: Arc<AbuseEngine>,
    /// Fixed category; derived from the path when unset
    category: Option<Category>,
    trust_forwarded_for: bool,
}

impl AbuseGuardLayer {
    pub fn new(engine: Arc<AbuseEngine>, trust_forwarded_for: bool) -> Self {
        Self {
            engine,
            category: None,
            trust_forwarded_for,
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
}

impl<S> Layer<S> for AbuseGuardLayer {
    type Service = AbuseGuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AbuseGuardService {
            inner,
            engine: self.engine.clone(),
            category: self.category,
            trust_forwarded_for: self.trust_forwarded_for,
        }
    }
}

#[derive(Clone)]
pub struct AbuseGuardService<S> {
    inner: S,
    engine: Arc<AbuseEngine>,
    category: Option<Category>,
    trust_forwarded_for: bool,
}

impl<S> Service<Request> for AbuseGuardService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let engine = self.engine.clone();
        let category = self
            .category
            .unwrap_or_else(|| Category::from_path(req.uri().path()));
        let identity = request_identity(&req, self.trust_forwarded_for);

        Box::pin(async move {
            let Some(identity) = identity else {
                tracing::debug!(path = %req.uri().path(), "no client address, abuse guard skipped");
                return Ok(ready.oneshot(req).await.into_response());
            };

            let id = identity.to_string();
            match engine.block_remaining(&id).await {
                Ok(Some(retry_after_secs)) => {
                    tracing::warn!(identity = %id, category = %category, "request denied: identity blocked");
                    return Ok(AppError::Denied {
                        reason: DenyReason::IpBlocked,
                        retry_after_secs,
                    }
                    .into_response());
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(error = %err, identity = %id, "block lookup failed, allowing request");
                }
            }

            let decision = engine.check_and_track(&identity, category).await;
            if let Decision::Deny {
                reason,
                retry_after_secs,
                ..
            } = decision
            {
                return Ok(AppError::Denied {
                    reason,
                    retry_after_secs,
                }
                .into_response());
            }

            let mut response = ready.oneshot(req).await.into_response();
            annotate_rate_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tripwire_core::thresholds::ViolationThresholds;

    use super::*;
    use crate::engine::tests::engine_with;
    use crate::store::MemoryStore;
    use crate::store::testing::UnavailableStore;

    fn app(engine: Arc<AbuseEngine>) -> Router {
        Router::new()
            .route("/v1/auth/login", get(|| async { "ok" }))
            .layer(AbuseGuardLayer::new(engine, false))
    }

    fn request(addr: &str) -> Request {
        let mut req = Request::builder()
            .uri("/v1/auth/login")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(format!("{addr}:5000").parse::<SocketAddr>().unwrap()));
        req
    }

    fn memory_engine() -> Arc<AbuseEngine> {
        let (engine, _rx) = engine_with(Arc::new(MemoryStore::new()), ViolationThresholds::default());
        Arc::new(engine)
    }

    #[tokio::test]
    async fn allowed_requests_carry_budget_headers() {
        let response = app(memory_engine())
            .oneshot(request("192.0.2.20"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "100");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "99");
    }

    #[tokio::test]
    async fn identity_block_is_enforced_before_the_engine() {
        let engine = memory_engine();
        engine
            .block_identity("ip=192.0.2.21,user=anonymous", None, Duration::from_secs(300))
            .await
            .unwrap();
        let response = app(engine).oneshot(request("192.0.2.21")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let retry: u64 = response.headers()["retry-after"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry > 0 && retry <= 300);
    }

    #[tokio::test]
    async fn geo_block_returns_403() {
        let engine = memory_engine();
        engine
            .block_geographic("192.0.2.22".parse().unwrap(), None, Duration::from_secs(300))
            .await
            .unwrap();
        let response = app(engine).oneshot(request("192.0.2.22")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unavailable_store_lets_traffic_through() {
        let (engine, _rx) = engine_with(Arc::new(UnavailableStore), ViolationThresholds::default());
        let response = app(Arc::new(engine))
            .oneshot(request("192.0.2.23"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}
