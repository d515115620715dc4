use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::identity::Category;
use crate::thresholds::{Pattern, Period};

/// One enforcement violation. Appended, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ViolationRecord {
    #[schema(value_type = String, example = "login")]
    pub category: Category,
    /// Identity key (`ip=<addr>,user=<id>`)
    pub identity: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
}

/// Post-increment window counts returned by a recorded violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ViolationCounts {
    pub hourly: u64,
    pub daily: u64,
    pub weekly: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ViolationOutcome {
    pub counts: ViolationCounts,
    /// Whether this violation put the identity over the weekly limit
    pub blocked: bool,
}

/// Aggregate over a category's violations inside one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ViolationStats {
    #[schema(value_type = String, example = "login")]
    pub category: Category,
    pub period: Period,
    pub total: u64,
    pub unique_identities: u64,
    pub unique_remote_addresses: u64,
}

/// Windowed violation counts for a single identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PeriodCounts {
    pub hourly: u64,
    pub daily: u64,
    pub weekly: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IdentityStats {
    pub identity: String,
    pub total_violations: u64,
    /// Category label → count within the retention window
    pub violations_by_category: BTreeMap<String, u64>,
    pub violations_by_period: PeriodCounts,
    pub is_blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BlockedIdentity {
    pub identity: String,
    pub blocked_until: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Both block namespaces for one subject. Identity and geo blocks are
/// independent; either may be active without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BlockStatus {
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub geo_blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PatternReport {
    pub identity: String,
    #[schema(value_type = String, example = "login")]
    pub category: Category,
    pub pattern: Pattern,
}
