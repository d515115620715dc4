use std::time::Duration;

use tripwire_core::thresholds::ViolationThresholds;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_ALERT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_JANITOR_INTERVAL_SECS: u64 = 60;

/// Process configuration, read once at startup. Malformed values fall back
/// to their defaults with a warning instead of aborting boot.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Lowercase SHA-256 hex digests of accepted admin keys
    pub admin_key_hashes: Vec<String>,
    pub alert_webhook_url: Option<String>,
    pub alert_queue_capacity: usize,
    pub janitor_interval: Duration,
    pub violation_thresholds: ViolationThresholds,
    pub trust_forwarded_for: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            admin_key_hashes: Vec::new(),
            alert_webhook_url: None,
            alert_queue_capacity: DEFAULT_ALERT_QUEUE_CAPACITY,
            janitor_interval: Duration::from_secs(DEFAULT_JANITOR_INTERVAL_SECS),
            violation_thresholds: ViolationThresholds::default(),
            trust_forwarded_for: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let thresholds = defaults.violation_thresholds;
        Self {
            port: parsed(&lookup, "PORT", defaults.port, |v| *v > 0),
            admin_key_hashes: admin_key_hashes(lookup("TRIPWIRE_ADMIN_KEY_HASHES")),
            alert_webhook_url: lookup("TRIPWIRE_ALERT_WEBHOOK_URL")
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty()),
            alert_queue_capacity: parsed(
                &lookup,
                "TRIPWIRE_ALERT_QUEUE_CAPACITY",
                defaults.alert_queue_capacity,
                |v| *v > 0,
            ),
            janitor_interval: Duration::from_secs(parsed(
                &lookup,
                "TRIPWIRE_JANITOR_INTERVAL_SECS",
                DEFAULT_JANITOR_INTERVAL_SECS,
                |v| *v > 0,
            )),
            violation_thresholds: ViolationThresholds {
                hourly: parsed(&lookup, "TRIPWIRE_VIOLATION_HOURLY", thresholds.hourly, |v| *v > 0),
                daily: parsed(&lookup, "TRIPWIRE_VIOLATION_DAILY", thresholds.daily, |v| *v > 0),
                weekly: parsed(&lookup, "TRIPWIRE_VIOLATION_WEEKLY", thresholds.weekly, |v| *v > 0),
            },
            trust_forwarded_for: matches!(
                lookup("TRIPWIRE_TRUST_FORWARDED_FOR")
                    .unwrap_or_default()
                    .trim()
                    .to_lowercase()
                    .as_str(),
                "1" | "true" | "yes" | "on"
            ),
        }
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            tracing::warn!(variable = name, value = %raw, default = %default, "invalid config value, using default");
            default
        }
    }
}

fn admin_key_hashes(raw: Option<String>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|digest| digest.trim().to_lowercase())
        .filter(|digest| !digest.is_empty())
        .filter(|digest| {
            let ok = digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit());
            if !ok {
                tracing::warn!("ignoring malformed entry in TRIPWIRE_ADMIN_KEY_HASHES");
            }
            ok
        })
        .collect()
}
