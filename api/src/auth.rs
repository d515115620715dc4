use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{FromRequestParts, Request};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service, ServiceExt};
use tripwire_core::auth::{digests_match, hash_token, is_api_key, key_prefix};

use crate::error::AppError;
use crate::state::AppState;

/// Admin caller authenticated by a `tw_sk_` bearer key.
///
/// Resolved once by [`InjectAdminLayer`] so the abuse guard can key its
/// counters on the caller; handlers read it back through the extractor.
#[derive(Debug, Clone)]
pub struct AdminKey {
    /// First eight hex chars of the key, safe to log
    pub key_prefix: String,
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn authenticate(token: &str, accepted: &[String]) -> Option<AdminKey> {
    if !is_api_key(token) {
        return None;
    }
    let digest = hash_token(token);
    // check every entry so timing does not reveal which one matched
    let matched = accepted
        .iter()
        .fold(false, |found, candidate| digests_match(&digest, candidate) | found);
    matched.then(|| AdminKey {
        key_prefix: key_prefix(token),
    })
}

// --- Tower Layer/Service for admin key injection ---

/// Injects [`AdminKey`] into request extensions when the bearer token is a
/// configured admin key. Requests without one pass through untouched.
#[derive(Clone)]
pub struct InjectAdminLayer {
    accepted: Arc<[String]>,
}

impl InjectAdminLayer {
    pub fn new(accepted: Arc<[String]>) -> Self {
        Self { accepted }
    }
}

impl<S> Layer<S> for InjectAdminLayer {
    type Service = InjectAdminService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InjectAdminService {
            inner,
            accepted: Arc::clone(&self.accepted),
        }
    }
}

#[derive(Clone)]
pub struct InjectAdminService<S> {
    inner: S,
    accepted: Arc<[String]>,
}

impl<S> Service<Request> for InjectAdminService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);

        if let Some(admin) =
            extract_bearer_token(req.headers()).and_then(|token| authenticate(token, &self.accepted))
        {
            req.extensions_mut().insert(admin);
        }

        Box::pin(async move { Ok(ready.oneshot(req).await.into_response()) })
    }
}

// --- Extractor (used by handlers) ---

impl FromRequestParts<AppState> for AdminKey {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Fast path: injection layer already validated the token
        if let Some(admin) = parts.extensions.get::<AdminKey>() {
            return Ok(admin.clone());
        }

        let token = extract_bearer_token(&parts.headers).ok_or_else(|| AppError::Unauthorized {
            message: "Missing admin credential".to_string(),
            docs_hint: Some(
                "Include 'Authorization: Bearer tw_sk_...' with a configured admin key.".to_string(),
            ),
        })?;

        authenticate(token, &state.admin_key_hashes).ok_or_else(|| {
            tracing::warn!(
                path = %parts.uri.path(),
                key_prefix = %key_prefix(token),
                "admin authorization failed"
            );
            AppError::Unauthorized {
                message: "Invalid admin credential".to_string(),
                docs_hint: Some(
                    "Generate a key with 'tripwire admin create-key' and add its hash to TRIPWIRE_ADMIN_KEY_HASHES."
                        .to_string(),
                ),
            }
        })
    }
}
