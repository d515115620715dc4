use clap::Args;
use serde_json::json;

use crate::util::api_request;

/// Subject of a decision or violation report
#[derive(Args)]
pub struct SubjectArgs {
    /// Client IPv4/IPv6 address
    #[arg(long)]
    pub remote_address: String,
    /// Authenticated user id (omit for anonymous traffic)
    #[arg(long)]
    pub user_id: Option<String>,
    /// Route category (e.g. login, register, 2fa_setup)
    #[arg(long, default_value = "default")]
    pub category: String,
}

impl SubjectArgs {
    fn body(&self) -> serde_json::Value {
        let mut body = json!({
            "remote_address": self.remote_address,
            "category": self.category,
        });
        if let Some(user_id) = &self.user_id {
            body["user_id"] = json!(user_id);
        }
        body
    }
}

/// Ask for an allow/deny decision. `--include` shows the rate-limit headers.
pub async fn check(api_url: &str, subject: SubjectArgs, include: bool) -> i32 {
    api_request(
        api_url,
        reqwest::Method::POST,
        "/v1/check",
        None,
        Some(subject.body()),
        &[],
        include,
    )
    .await
}

/// Report a violation. Requires an admin key, since violations escalate to blocks.
pub async fn report_violation(
    api_url: &str,
    token: &str,
    subject: SubjectArgs,
    include: bool,
) -> i32 {
    api_request(
        api_url,
        reqwest::Method::POST,
        "/v1/violations",
        Some(token),
        Some(subject.body()),
        &[],
        include,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_subject_omits_user_id() {
        let subject = SubjectArgs {
            remote_address: "192.0.2.1".to_string(),
            user_id: None,
            category: "login".to_string(),
        };
        assert_eq!(
            subject.body(),
            json!({ "remote_address": "192.0.2.1", "category": "login" })
        );
    }
}
