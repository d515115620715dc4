use serde_json::json;

use crate::util::{api_request, exit_error, segment};

pub async fn block(
    api_url: &str,
    token: &str,
    identity: Option<&str>,
    remote_address: Option<&str>,
    reason: Option<&str>,
    duration: Option<i64>,
) -> i32 {
    let mut body = match (identity, remote_address) {
        (Some(identity), None) => json!({ "identity": identity }),
        (None, Some(address)) => json!({ "remote_address": address }),
        _ => exit_error(
            "Exactly one of --identity or --remote-address is required",
            Some("--identity blocks one client; --remote-address installs a geo block."),
        ),
    };
    if let Some(reason) = reason {
        body["reason"] = json!(reason);
    }
    if let Some(duration) = duration {
        body["duration"] = json!(duration);
    }

    api_request(
        api_url,
        reqwest::Method::POST,
        "/v1/admin/abuse/block",
        Some(token),
        Some(body),
        &[],
        false,
    )
    .await
}

pub async fn unblock(api_url: &str, token: &str, identity: &str) -> i32 {
    api_request(
        api_url,
        reqwest::Method::POST,
        &format!("/v1/admin/abuse/identities/{}/unblock", segment(identity)),
        Some(token),
        None,
        &[],
        false,
    )
    .await
}

pub async fn status(
    api_url: &str,
    token: &str,
    identity: &str,
    remote_address: Option<&str>,
) -> i32 {
    let mut query = vec![("identity".to_string(), identity.to_string())];
    if let Some(address) = remote_address {
        query.push(("remote_address".to_string(), address.to_string()));
    }
    api_request(
        api_url,
        reqwest::Method::GET,
        "/v1/admin/abuse/block-status",
        Some(token),
        None,
        &query,
        false,
    )
    .await
}

pub async fn list(api_url: &str, token: &str) -> i32 {
    api_request(
        api_url,
        reqwest::Method::GET,
        "/v1/admin/abuse/blocked",
        Some(token),
        None,
        &[],
        false,
    )
    .await
}
