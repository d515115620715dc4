use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Embed colour used by chat-style webhook receivers.
    pub fn color(self) -> u32 {
        match self {
            Severity::Info => 0x3498db,
            Severity::Warning => 0xf1c40f,
            Severity::Critical => 0xe74c3c,
        }
    }
}

/// What crossed which line. Lets consumers route alerts without parsing titles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ViolationThreshold,
    SuspiciousActivityBlocked,
    RateLimitExceeded,
    GeoBlocked,
    IdentityBlocked,
    IdentityUnblocked,
    ThresholdsUpdated,
    AdaptiveThresholdsUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AlertField {
    pub name: String,
    pub value: String,
}

/// Structured alert produced by the engine. Delivery is best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Alert {
    pub kind: AlertKind,
    pub title: String,
    pub description: String,
    pub fields: Vec<AlertField>,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            description: description.into(),
            fields: Vec::new(),
            severity,
            timestamp: Utc::now(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push(AlertField {
            name: name.into(),
            value: value.to_string(),
        });
        self
    }

    pub fn field_value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| field.value.as_str())
    }
}
