use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderValue};
use tripwire_core::decision::Decision;
use tripwire_core::identity::IdentityKey;

use crate::auth::AdminKey;

pub mod abuse_guard;
pub mod rate_limit;

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Resolve the caller's identity key from the connection (or the first
/// `X-Forwarded-For` hop when trusted) and the authenticated admin key.
pub fn request_identity(req: &Request, trust_forwarded_for: bool) -> Option<IdentityKey> {
    let remote_address = trust_forwarded_for
        .then(|| forwarded_for(req.headers()))
        .flatten()
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })?;
    let user_id = req
        .extensions()
        .get::<AdminKey>()
        .map(|admin| format!("admin:{}", admin.key_prefix));
    Some(IdentityKey::new(remote_address, user_id))
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Budget headers for allowed decisions; fail-open allows carry none.
pub fn annotate_rate_headers(headers: &mut HeaderMap, decision: &Decision) {
    if let Decision::Allow {
        limit: Some(limit),
        remaining: Some(remaining),
        ..
    } = decision
    {
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(*limit));
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(*remaining));
    }
}
