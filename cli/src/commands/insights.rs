use crate::util::{api_request, segment};

pub async fn pattern(api_url: &str, token: &str, identity: &str, category: &str) -> i32 {
    let query = vec![
        ("identity".to_string(), identity.to_string()),
        ("category".to_string(), category.to_string()),
    ];
    api_request(
        api_url,
        reqwest::Method::GET,
        "/v1/admin/abuse/pattern",
        Some(token),
        None,
        &query,
        false,
    )
    .await
}

pub async fn stats(api_url: &str, token: &str, category: Option<&str>, period: &str) -> i32 {
    let mut query = vec![("period".to_string(), period.to_string())];
    if let Some(category) = category {
        query.push(("category".to_string(), category.to_string()));
    }
    api_request(
        api_url,
        reqwest::Method::GET,
        "/v1/admin/abuse/stats",
        Some(token),
        None,
        &query,
        false,
    )
    .await
}

pub async fn violations(
    api_url: &str,
    token: &str,
    category: &str,
    period: &str,
    limit: Option<u32>,
) -> i32 {
    let mut query = vec![
        ("category".to_string(), category.to_string()),
        ("period".to_string(), period.to_string()),
    ];
    if let Some(limit) = limit {
        query.push(("limit".to_string(), limit.to_string()));
    }
    api_request(
        api_url,
        reqwest::Method::GET,
        "/v1/admin/abuse/violations",
        Some(token),
        None,
        &query,
        false,
    )
    .await
}

pub async fn identity(api_url: &str, token: &str, identity: &str) -> i32 {
    api_request(
        api_url,
        reqwest::Method::GET,
        &format!("/v1/admin/abuse/identities/{}", segment(identity)),
        Some(token),
        None,
        &[],
        false,
    )
    .await
}
