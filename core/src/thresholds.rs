use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ValidationError;

/// Rolling window over which counts are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hourly,
    Daily,
    Weekly,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Hourly, Period::Daily, Period::Weekly];

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Hourly => "hourly",
            Period::Daily => "daily",
            Period::Weekly => "weekly",
        }
    }

    /// Window length; also the expiry armed on the period's counters.
    pub fn window_secs(self) -> u64 {
        match self {
            Period::Hourly => 3_600,
            Period::Daily => 86_400,
            Period::Weekly => 604_800,
        }
    }

    pub fn window_millis(self) -> i64 {
        self.window_secs() as i64 * 1_000
    }

    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value.trim().to_lowercase().as_str() {
            "hourly" | "hour" | "1h" => Ok(Period::Hourly),
            "daily" | "day" | "24h" => Ok(Period::Daily),
            "weekly" | "week" | "7d" => Ok(Period::Weekly),
            _ => Err(
                ValidationError::new("period", "period must be one of hourly, daily, weekly")
                    .with_received(serde_json::json!(value)),
            ),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cadence classification that selects which adaptive budget applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    Normal,
    Suspicious,
    Blocked,
}

impl Pattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Pattern::Normal => "normal",
            Pattern::Suspicious => "suspicious",
            Pattern::Blocked => "blocked",
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Violation counts per window that trigger alerts (and, weekly, a block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ViolationThresholds {
    pub hourly: u64,
    pub daily: u64,
    pub weekly: u64,
}

impl Default for ViolationThresholds {
    fn default() -> Self {
        Self {
            hourly: 10,
            daily: 30,
            weekly: 100,
        }
    }
}

impl ViolationThresholds {
    pub fn get(&self, period: Period) -> u64 {
        match period {
            Period::Hourly => self.hourly,
            Period::Daily => self.daily,
            Period::Weekly => self.weekly,
        }
    }

    /// Apply a partial update. Either every supplied field is valid and the
    /// merged value is returned, or nothing changes.
    pub fn merged(&self, update: &ViolationThresholdsUpdate) -> Result<Self, ValidationError> {
        Ok(Self {
            hourly: checked_threshold("hourly", update.hourly, self.hourly)?,
            daily: checked_threshold("daily", update.daily, self.daily)?,
            weekly: checked_threshold("weekly", update.weekly, self.weekly)?,
        })
    }
}

fn checked_threshold(field: &str, value: Option<i64>, current: u64) -> Result<u64, ValidationError> {
    match value {
        None => Ok(current),
        Some(v) if v >= 1 => Ok(v as u64),
        Some(v) => Err(ValidationError::new(field, "threshold must be a positive integer")
            .with_received(serde_json::json!(v))),
    }
}

/// Partial update of [`ViolationThresholds`]; missing fields keep their value.
///
/// Fields are signed so a negative input reaches validation instead of
/// failing deserialization with an opaque error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ViolationThresholdsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly: Option<i64>,
}

/// Permitted request counts for one pattern, per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PeriodBudget {
    pub hourly: u64,
    pub daily: u64,
    pub weekly: u64,
}

impl PeriodBudget {
    pub const fn new(hourly: u64, daily: u64, weekly: u64) -> Self {
        Self {
            hourly,
            daily,
            weekly,
        }
    }

    pub fn get(&self, period: Period) -> u64 {
        match period {
            Period::Hourly => self.hourly,
            Period::Daily => self.daily,
            Period::Weekly => self.weekly,
        }
    }

    fn scaled(&self, numerator: u64, denominator: u64) -> Self {
        let scale = |value: u64| {
            value
                .saturating_mul(numerator)
                .checked_div(denominator)
                .unwrap_or(value)
                .max(MIN_ADAPTIVE_BUDGET)
        };
        Self {
            hourly: scale(self.hourly),
            daily: scale(self.daily),
            weekly: scale(self.weekly),
        }
    }
}

const MIN_ADAPTIVE_BUDGET: u64 = 1;
const HIGH_LOAD: f64 = 0.8;
const LOW_LOAD: f64 = 0.3;

/// Request budgets keyed by pattern × period. Global, never per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AdaptiveThresholds {
    pub normal: PeriodBudget,
    pub suspicious: PeriodBudget,
    pub blocked: PeriodBudget,
}

impl Default for AdaptiveThresholds {
    fn default() -> Self {
        Self {
            normal: PeriodBudget::new(100, 1_000, 5_000),
            suspicious: PeriodBudget::new(50, 500, 2_500),
            blocked: PeriodBudget::new(10, 100, 500),
        }
    }
}

/// Direction of a load-driven rescale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RescaleAction {
    Tightened,
    Relaxed,
    Unchanged,
}

impl AdaptiveThresholds {
    pub fn budget(&self, pattern: Pattern, period: Period) -> u64 {
        match pattern {
            Pattern::Normal => self.normal.get(period),
            Pattern::Suspicious => self.suspicious.get(period),
            Pattern::Blocked => self.blocked.get(period),
        }
    }

    /// Rescale every leaf for the given load factor in `[0, 1]`.
    ///
    /// Above 0.8 every budget becomes `floor(v * 0.7)`, below 0.3
    /// `floor(v * 1.3)`; otherwise nothing changes. Integer arithmetic keeps
    /// the floor exact. Budgets never drop below 1.
    pub fn rescaled(&self, load_factor: f64) -> Result<(Self, RescaleAction), ValidationError> {
        if !load_factor.is_finite() || !(0.0..=1.0).contains(&load_factor) {
            return Err(
                ValidationError::new("load_factor", "load_factor must be within [0, 1]")
                    .with_received(serde_json::json!(load_factor)),
            );
        }
        let (numerator, denominator, action) = if load_factor > HIGH_LOAD {
            (7, 10, RescaleAction::Tightened)
        } else if load_factor < LOW_LOAD {
            (13, 10, RescaleAction::Relaxed)
        } else {
            return Ok((*self, RescaleAction::Unchanged));
        };
        Ok((
            Self {
                normal: self.normal.scaled(numerator, denominator),
                suspicious: self.suspicious.scaled(numerator, denominator),
                blocked: self.blocked.scaled(numerator, denominator),
            },
            action,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(table: &AdaptiveThresholds) -> [u64; 9] {
        [
            table.normal.hourly,
            table.normal.daily,
            table.normal.weekly,
            table.suspicious.hourly,
            table.suspicious.daily,
            table.suspicious.weekly,
            table.blocked.hourly,
            table.blocked.daily,
            table.blocked.weekly,
        ]
    }

    #[test]
    fn period_windows_match_counter_expiry() {
        assert_eq!(Period::Hourly.window_secs(), 3_600);
        assert_eq!(Period::Daily.window_secs(), 86_400);
        assert_eq!(Period::Weekly.window_secs(), 604_800);
        assert_eq!(Period::Weekly.window_millis(), 604_800_000);
    }

    #[test]
    fn period_parse_accepts_aliases_and_rejects_unknown() {
        assert_eq!(Period::parse("Hourly").unwrap(), Period::Hourly);
        assert_eq!(Period::parse("24h").unwrap(), Period::Daily);
        assert!(Period::parse("monthly").is_err());
    }

    #[test]
    fn partial_update_keeps_missing_fields() {
        let current = ViolationThresholds::default();
        let merged = current
            .merged(&ViolationThresholdsUpdate {
                hourly: Some(5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(merged.hourly, 5);
        assert_eq!(merged.daily, 30);
        assert_eq!(merged.weekly, 100);
    }

    #[test]
    fn partial_update_rejects_non_positive_values() {
        let current = ViolationThresholds::default();
        let err = current
            .merged(&ViolationThresholdsUpdate {
                hourly: Some(5),
                weekly: Some(-1),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.field, "weekly");
        assert!(
            current
                .merged(&ViolationThresholdsUpdate {
                    daily: Some(0),
                    ..Default::default()
                })
                .is_err()
        );
    }

    #[test]
    fn high_load_tightens_every_leaf_by_thirty_percent() {
        let original = AdaptiveThresholds::default();
        let (scaled, action) = original.rescaled(0.9).unwrap();
        assert_eq!(action, RescaleAction::Tightened);
        for (before, after) in leaves(&original).iter().zip(leaves(&scaled)) {
            assert_eq!(after, before * 7 / 10);
        }
        assert_eq!(scaled.normal, PeriodBudget::new(70, 700, 3_500));
        assert_eq!(scaled.blocked, PeriodBudget::new(7, 70, 350));
    }

    #[test]
    fn low_load_relaxes_every_leaf_by_thirty_percent() {
        let original = AdaptiveThresholds::default();
        let (scaled, action) = original.rescaled(0.1).unwrap();
        assert_eq!(action, RescaleAction::Relaxed);
        for (before, after) in leaves(&original).iter().zip(leaves(&scaled)) {
            assert_eq!(after, before * 13 / 10);
        }
        assert_eq!(scaled.suspicious, PeriodBudget::new(65, 650, 3_250));
    }

    #[test]
    fn moderate_load_leaves_table_unchanged() {
        let original = AdaptiveThresholds::default();
        for load in [0.3, 0.5, 0.8] {
            let (scaled, action) = original.rescaled(load).unwrap();
            assert_eq!(action, RescaleAction::Unchanged);
            assert_eq!(scaled, original);
        }
    }

    #[test]
    fn rescale_rejects_out_of_range_load() {
        let original = AdaptiveThresholds::default();
        assert!(original.rescaled(1.5).is_err());
        assert!(original.rescaled(-0.1).is_err());
        assert!(original.rescaled(f64::NAN).is_err());
    }

    #[test]
    fn repeated_tightening_never_reaches_zero() {
        let mut table = AdaptiveThresholds::default();
        for _ in 0..40 {
            table = table.rescaled(0.95).unwrap().0;
        }
        assert!(leaves(&table).iter().all(|leaf| *leaf >= 1));
    }

    #[test]
    fn budget_lookup_selects_pattern_and_period() {
        let table = AdaptiveThresholds::default();
        assert_eq!(table.budget(Pattern::Normal, Period::Hourly), 100);
        assert_eq!(table.budget(Pattern::Suspicious, Period::Daily), 500);
        assert_eq!(table.budget(Pattern::Blocked, Period::Weekly), 500);
    }
}
