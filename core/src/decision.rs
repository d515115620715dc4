use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::thresholds::Pattern;

/// Machine-readable reason attached to a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    GeoBlocked,
    RateLimitExceeded,
    IpBlocked,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::GeoBlocked => "GEO_BLOCKED",
            DenyReason::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            DenyReason::IpBlocked => "IP_BLOCKED",
        }
    }
}

/// Outcome of a per-request check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    Allow {
        /// Hourly request budget in effect; absent when the check failed open
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remaining: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<Pattern>,
    },
    Deny {
        reason: DenyReason,
        retry_after_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
    },
}

impl Decision {
    /// Allow without budget information (store unreachable).
    pub fn fail_open() -> Self {
        Decision::Allow {
            limit: None,
            remaining: None,
            pattern: None,
        }
    }

    pub fn deny(reason: DenyReason, retry_after_secs: u64) -> Self {
        Decision::Deny {
            reason,
            retry_after_secs,
            limit: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Decision::Deny { reason, .. } => Some(*reason),
            Decision::Allow { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Decision, DenyReason};
    use crate::thresholds::Pattern;

    #[test]
    fn deny_serializes_reason_code_and_retry_hint() {
        let value = serde_json::to_value(Decision::deny(DenyReason::GeoBlocked, 120)).unwrap();
        assert_eq!(value["decision"], "deny");
        assert_eq!(value["reason"], "GEO_BLOCKED");
        assert_eq!(value["retry_after_secs"], 120);
    }

    #[test]
    fn allow_omits_missing_budget() {
        let value = serde_json::to_value(Decision::fail_open()).unwrap();
        assert_eq!(value, serde_json::json!({ "decision": "allow" }));

        let value = serde_json::to_value(Decision::Allow {
            limit: Some(100),
            remaining: Some(99),
            pattern: Some(Pattern::Normal),
        })
        .unwrap();
        assert_eq!(value["remaining"], 99);
        assert_eq!(value["pattern"], "normal");
    }

    #[test]
    fn reason_labels_match_wire_codes() {
        for reason in [
            DenyReason::GeoBlocked,
            DenyReason::RateLimitExceeded,
            DenyReason::IpBlocked,
        ] {
            let wire = serde_json::to_value(reason).unwrap();
            assert_eq!(wire, reason.as_str());
        }
    }
}
