//! Rate/Abuse Engine.
//!
//! Hot path: geo-block check, cadence classification, adaptive hourly
//! request budget. Violation path: append the record, bump the three window
//! counters, alert on exact threshold crossings and escalate to an identity
//! block past the weekly limit.
//!
//! Every shared mutation goes through [`CounterStore`] primitives. The only
//! in-process state is the two threshold tables, swapped whole on update.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tripwire_core::alerts::{Alert, AlertKind, Severity};
use tripwire_core::decision::{Decision, DenyReason};
use tripwire_core::error::ValidationError;
use tripwire_core::identity::{Category, IdentityKey};
use tripwire_core::thresholds::{
    AdaptiveThresholds, Pattern, Period, PeriodBudget, RescaleAction, ViolationThresholds,
    ViolationThresholdsUpdate,
};
use tripwire_core::violations::{BlockStatus, ViolationCounts, ViolationOutcome, ViolationRecord};

use crate::alerting::AlertSender;
use crate::classifier::PatternClassifier;
use crate::store::{CounterStore, StoreError, ceil_secs, keys};

pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(86_400);
/// Upper bound for admin-installed blocks.
pub const MAX_BLOCK_DURATION: Duration = Duration::from_secs(30 * 86_400);
const WEEKLY_BLOCK_REASON: &str = "weekly violation threshold exceeded";
/// Violation records are kept as long as the longest window.
pub(crate) const VIOLATION_RETENTION: Period = Period::Weekly;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Value stored under identity- and geo-block keys. Presence of the key is
/// what blocks; the record only carries context for admin views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BlockRecord {
    pub until: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BlockRecord {
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

pub struct AbuseEngine {
    store: Arc<dyn CounterStore>,
    classifier: PatternClassifier,
    violation_thresholds: ArcSwap<ViolationThresholds>,
    adaptive_thresholds: ArcSwap<AdaptiveThresholds>,
    alerts: AlertSender,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn window(period: Period) -> Duration {
    Duration::from_secs(period.window_secs())
}

fn until_from_ttl(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl?;
    chrono::Duration::from_std(ttl)
        .ok()
        .map(|remaining| Utc::now() + remaining)
}

fn budget_summary(budget: &PeriodBudget) -> String {
    format!("{}/{}/{}", budget.hourly, budget.daily, budget.weekly)
}

fn validate_duration(duration: Duration) -> Result<(), ValidationError> {
    if duration.is_zero() || duration > MAX_BLOCK_DURATION {
        return Err(ValidationError::new(
            "duration",
            "duration must be between 1 and 2592000 seconds",
        )
        .with_received(serde_json::json!(duration.as_secs())));
    }
    Ok(())
}

impl AbuseEngine {
    pub fn new(
        store: Arc<dyn CounterStore>,
        alerts: AlertSender,
        violation_thresholds: ViolationThresholds,
    ) -> Self {
        Self {
            classifier: PatternClassifier::new(Arc::clone(&store)),
            store,
            violation_thresholds: ArcSwap::from_pointee(violation_thresholds),
            adaptive_thresholds: ArcSwap::from_pointee(AdaptiveThresholds::default()),
            alerts,
        }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn classifier(&self) -> &PatternClassifier {
        &self.classifier
    }

    pub fn violation_thresholds(&self) -> ViolationThresholds {
        **self.violation_thresholds.load()
    }

    pub fn adaptive_thresholds(&self) -> AdaptiveThresholds {
        **self.adaptive_thresholds.load()
    }

    /// Per-request decision. Store failures allow the request.
    pub async fn check_and_track(&self, identity: &IdentityKey, category: Category) -> Decision {
        match self.try_check(identity, category).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    identity = %identity,
                    category = %category,
                    "abuse check failed, allowing request"
                );
                Decision::fail_open()
            }
        }
    }

    async fn try_check(
        &self,
        identity: &IdentityKey,
        category: Category,
    ) -> Result<Decision, StoreError> {
        let remote_address = identity.remote_address.to_string();
        let geo_key = keys::geo_block(&remote_address);
        if self.store.exists(&geo_key).await? {
            let remaining = self
                .store
                .ttl(&geo_key)
                .await?
                .map(ceil_secs)
                .unwrap_or(DEFAULT_BLOCK_DURATION.as_secs())
                .max(1);
            tracing::warn!(remote_address = %remote_address, category = %category, "request denied: geo block");
            return Ok(Decision::deny(DenyReason::GeoBlocked, remaining));
        }

        let id = identity.to_string();
        let now_ms = now_millis();
        self.classifier.record_sample(&id, category, now_ms).await?;
        let mut pattern = self.classifier.classify(&id, category, now_ms).await?;
        // callers that skip the block check still get the tightest budget
        if self.store.exists(&keys::blocked(&id)).await? {
            pattern = Pattern::Blocked;
        }

        let limit = self
            .adaptive_thresholds
            .load()
            .budget(pattern, Period::Hourly);
        let count = self
            .store
            .increment(&keys::request_counter(category, &id), window(Period::Hourly))
            .await?
            .max(0) as u64;

        if count > limit {
            // the limit can drop mid-window, so latch the alert on its own key
            let alerted = self
                .store
                .increment(&keys::rate_alert(category, &id), window(Period::Hourly))
                .await?;
            if alerted == 1 {
                self.alerts.emit(
                    Alert::new(
                        AlertKind::RateLimitExceeded,
                        Severity::Warning,
                        "Adaptive rate limit exceeded",
                        format!("{id} exceeded the hourly {category} request budget"),
                    )
                    .field("identity", &id)
                    .field("category", category)
                    .field("pattern", pattern)
                    .field("limit", limit)
                    .field("count", count),
                );
            }
            tracing::warn!(
                identity = %id,
                category = %category,
                pattern = %pattern,
                limit,
                count,
                "request denied: adaptive rate limit"
            );
            return Ok(Decision::Deny {
                reason: DenyReason::RateLimitExceeded,
                retry_after_secs: Period::Hourly.window_secs(),
                limit: Some(limit),
            });
        }

        Ok(Decision::Allow {
            limit: Some(limit),
            remaining: Some(limit - count),
            pattern: Some(pattern),
        })
    }

    /// Record an enforcement violation raised by a fixed per-route limiter.
    pub async fn record_violation(
        &self,
        category: Category,
        identity: &str,
    ) -> Result<ViolationOutcome, EngineError> {
        let now_ms = now_millis();
        let record = ViolationRecord {
            category,
            identity: identity.to_string(),
            timestamp: now_ms,
        };
        let list_key = keys::violations(category);
        self.store
            .append_timestamped(&list_key, now_ms, &serde_json::to_string(&record)?)
            .await?;
        self.store
            .prune_range(&list_key, i64::MIN, now_ms - VIOLATION_RETENTION.window_millis() - 1)
            .await?;

        let thresholds = self.violation_thresholds();
        let mut counts = ViolationCounts {
            hourly: 0,
            daily: 0,
            weekly: 0,
        };
        for period in Period::ALL {
            let key = keys::violation_counter(period, category, identity);
            let count = self.store.increment(&key, window(period)).await?.max(0) as u64;
            match period {
                Period::Hourly => counts.hourly = count,
                Period::Daily => counts.daily = count,
                Period::Weekly => counts.weekly = count,
            }
            let threshold = thresholds.get(period);
            // exact equality: later violations above the line stay quiet
            if count == threshold {
                self.alerts.emit(
                    Alert::new(
                        AlertKind::ViolationThreshold,
                        Severity::Warning,
                        format!("{period} violation threshold reached"),
                        format!("{identity} reached {count} {category} violations"),
                    )
                    .field("identity", identity)
                    .field("category", category)
                    .field("period", period)
                    .field("count", count)
                    .field("threshold", threshold),
                );
            }
        }

        let mut blocked = false;
        if counts.weekly >= thresholds.weekly {
            let block_key = keys::blocked(identity);
            let newly_blocked = !self.store.exists(&block_key).await?;
            self.install_block(&block_key, Some(WEEKLY_BLOCK_REASON), DEFAULT_BLOCK_DURATION)
                .await?;
            if newly_blocked {
                tracing::warn!(
                    identity,
                    category = %category,
                    weekly = counts.weekly,
                    "identity blocked after weekly violations"
                );
                self.alerts.emit(
                    Alert::new(
                        AlertKind::SuspiciousActivityBlocked,
                        Severity::Critical,
                        "Suspicious activity blocked",
                        format!("{identity} blocked for 24h after {} weekly violations", counts.weekly),
                    )
                    .field("identity", identity)
                    .field("category", category)
                    .field("weekly_count", counts.weekly)
                    .field("threshold", thresholds.weekly),
                );
            }
            blocked = true;
        }

        Ok(ViolationOutcome { counts, blocked })
    }

    async fn install_block(
        &self,
        key: &str,
        reason: Option<&str>,
        duration: Duration,
    ) -> Result<DateTime<Utc>, EngineError> {
        let until = Utc::now()
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(1));
        let record = BlockRecord {
            until: until.timestamp_millis(),
            reason: reason.map(str::to_string),
        };
        self.store
            .set_with_ttl(key, &serde_json::to_string(&record)?, duration)
            .await?;
        Ok(until)
    }

    pub async fn is_blocked(&self, identity: &str) -> Result<bool, StoreError> {
        self.store.exists(&keys::blocked(identity)).await
    }

    /// Seconds left on an identity block, `None` when not blocked.
    pub async fn block_remaining(&self, identity: &str) -> Result<Option<u64>, StoreError> {
        let key = keys::blocked(identity);
        if !self.store.exists(&key).await? {
            return Ok(None);
        }
        let remaining = self
            .store
            .ttl(&key)
            .await?
            .map(ceil_secs)
            .unwrap_or(DEFAULT_BLOCK_DURATION.as_secs());
        Ok(Some(remaining.max(1)))
    }

    /// Both block namespaces. The geo half is only consulted when a remote
    /// address is supplied.
    pub async fn block_status(
        &self,
        identity: &str,
        remote_address: Option<IpAddr>,
    ) -> Result<BlockStatus, StoreError> {
        let (blocked, until, reason) = self.read_block(&keys::blocked(identity)).await?;
        let (geo_blocked, geo_until, geo_reason) = match remote_address {
            Some(addr) => self.read_block(&keys::geo_block(&addr.to_string())).await?,
            None => (false, None, None),
        };
        Ok(BlockStatus {
            blocked,
            until,
            reason,
            geo_blocked,
            geo_until,
            geo_reason,
        })
    }

    async fn read_block(
        &self,
        key: &str,
    ) -> Result<(bool, Option<DateTime<Utc>>, Option<String>), StoreError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok((false, None, None));
        };
        let until = until_from_ttl(self.store.ttl(key).await?);
        let reason = BlockRecord::parse(&raw).and_then(|record| record.reason);
        Ok((true, until, reason))
    }

    /// Install or overwrite a geo block for a remote address.
    pub async fn block_geographic(
        &self,
        remote_address: IpAddr,
        reason: Option<&str>,
        duration: Duration,
    ) -> Result<DateTime<Utc>, EngineError> {
        validate_duration(duration)?;
        let address = remote_address.to_string();
        let until = self
            .install_block(&keys::geo_block(&address), reason, duration)
            .await?;
        tracing::warn!(
            remote_address = %address,
            duration_secs = duration.as_secs(),
            reason = reason.unwrap_or(""),
            "geo block installed"
        );
        self.alerts.emit(
            Alert::new(
                AlertKind::GeoBlocked,
                Severity::Warning,
                "Geographic block installed",
                format!("{address} blocked until {}", until.to_rfc3339()),
            )
            .field("remote_address", &address)
            .field("reason", reason.unwrap_or("unspecified"))
            .field("duration_secs", duration.as_secs()),
        );
        Ok(until)
    }

    /// Install or overwrite an identity block on admin request.
    pub async fn block_identity(
        &self,
        identity: &str,
        reason: Option<&str>,
        duration: Duration,
    ) -> Result<DateTime<Utc>, EngineError> {
        validate_duration(duration)?;
        let until = self
            .install_block(&keys::blocked(identity), reason, duration)
            .await?;
        tracing::warn!(
            identity,
            duration_secs = duration.as_secs(),
            reason = reason.unwrap_or(""),
            "identity block installed"
        );
        self.alerts.emit(
            Alert::new(
                AlertKind::IdentityBlocked,
                Severity::Warning,
                "Identity blocked",
                format!("{identity} blocked until {}", until.to_rfc3339()),
            )
            .field("identity", identity)
            .field("reason", reason.unwrap_or("unspecified"))
            .field("duration_secs", duration.as_secs()),
        );
        Ok(until)
    }

    /// Remove an identity block. Succeeds whether or not one existed;
    /// returns whether a block was actually lifted.
    pub async fn unblock(&self, identity: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete(&keys::blocked(identity)).await?;
        tracing::info!(identity, removed, "identity unblocked");
        self.alerts.emit(
            Alert::new(
                AlertKind::IdentityUnblocked,
                Severity::Info,
                "Identity unblocked",
                format!("{identity} was unblocked by an administrator"),
            )
            .field("identity", identity)
            .field("was_blocked", removed),
        );
        Ok(removed)
    }

    /// Partial update; missing fields keep their value. Invalid input changes nothing.
    pub async fn update_violation_thresholds(
        &self,
        update: &ViolationThresholdsUpdate,
    ) -> Result<ViolationThresholds, EngineError> {
        // validates every supplied field up front; the fields are independent
        // of the current table so the swap below cannot fail
        self.violation_thresholds().merged(update)?;
        let mut applied = self.violation_thresholds();
        self.violation_thresholds.rcu(|current| {
            applied = current.merged(update).unwrap_or(**current);
            applied
        });

        tracing::info!(
            hourly = applied.hourly,
            daily = applied.daily,
            weekly = applied.weekly,
            "violation thresholds updated"
        );
        self.alerts.emit(
            Alert::new(
                AlertKind::ThresholdsUpdated,
                Severity::Info,
                "Violation thresholds updated",
                "New violation thresholds are in effect",
            )
            .field("hourly", applied.hourly)
            .field("daily", applied.daily)
            .field("weekly", applied.weekly),
        );
        Ok(applied)
    }

    /// Rescale every adaptive budget for the given load factor.
    pub async fn update_adaptive_thresholds(
        &self,
        load_factor: f64,
    ) -> Result<(AdaptiveThresholds, RescaleAction), EngineError> {
        self.adaptive_thresholds().rescaled(load_factor)?;
        let mut outcome = (self.adaptive_thresholds(), RescaleAction::Unchanged);
        self.adaptive_thresholds.rcu(|current| {
            outcome = current
                .rescaled(load_factor)
                .unwrap_or((**current, RescaleAction::Unchanged));
            outcome.0
        });

        let (table, action) = outcome;
        tracing::info!(load_factor, action = ?action, "adaptive thresholds rescaled");
        self.alerts.emit(
            Alert::new(
                AlertKind::AdaptiveThresholdsUpdated,
                Severity::Info,
                "Adaptive thresholds updated",
                format!("Load factor {load_factor:.2}, budgets {action:?}"),
            )
            .field("load_factor", format!("{load_factor:.2}"))
            .field("normal", budget_summary(&table.normal))
            .field("suspicious", budget_summary(&table.suspicious))
            .field("blocked", budget_summary(&table.blocked)),
        );
        Ok((table, action))
    }
}
