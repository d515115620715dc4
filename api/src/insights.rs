//! Admin Query Surface: read-side aggregation over the counter store.
//!
//! Store failures propagate so operators can tell "nothing recorded" from
//! "store is down".

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tripwire_core::identity::{Category, IdentityKey};
use tripwire_core::thresholds::Period;
use tripwire_core::violations::{
    BlockedIdentity, IdentityStats, PeriodCounts, ViolationRecord, ViolationStats,
};

use crate::engine::{BlockRecord, VIOLATION_RETENTION, now_millis};
use crate::store::{CounterStore, StoreResult, keys};

#[derive(Clone)]
pub struct AbuseInsights {
    store: Arc<dyn CounterStore>,
}

fn until_from_ttl(ttl: Option<std::time::Duration>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl?).ok().map(|remaining| now + remaining)
}

fn remote_address_of(identity: &str) -> Option<String> {
    identity
        .parse::<IdentityKey>()
        .ok()
        .map(|key| key.remote_address.to_string())
}

impl AbuseInsights {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Records for one category inside the retention window, oldest first.
    /// Older entries are pruned on the way.
    async fn records(&self, category: Category, now_ms: i64) -> StoreResult<Vec<ViolationRecord>> {
        let key = keys::violations(category);
        let oldest = now_ms - VIOLATION_RETENTION.window_millis();
        self.store.prune_range(&key, i64::MIN, oldest - 1).await?;
        let raw = self.store.range_by_score(&key, oldest, i64::MAX).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str::<ViolationRecord>(entry) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::debug!(key = %key, error = %err, "skipping unreadable violation record");
                    None
                }
            })
            .collect())
    }

    pub async fn violation_stats(
        &self,
        category: Category,
        period: Period,
    ) -> StoreResult<ViolationStats> {
        self.violation_stats_at(category, period, now_millis()).await
    }

    pub(crate) async fn violation_stats_at(
        &self,
        category: Category,
        period: Period,
        now_ms: i64,
    ) -> StoreResult<ViolationStats> {
        let since = now_ms - period.window_millis();
        let records = self.records(category, now_ms).await?;
        let in_window: Vec<&ViolationRecord> = records
            .iter()
            .filter(|record| record.timestamp >= since)
            .collect();
        let identities: HashSet<&str> = in_window
            .iter()
            .map(|record| record.identity.as_str())
            .collect();
        let remote_addresses: HashSet<String> = identities
            .iter()
            .filter_map(|identity| remote_address_of(identity))
            .collect();

        Ok(ViolationStats {
            category,
            period,
            total: in_window.len() as u64,
            unique_identities: identities.len() as u64,
            unique_remote_addresses: remote_addresses.len() as u64,
        })
    }

    /// Newest first, at most `limit` records.
    pub async fn violation_history(
        &self,
        category: Category,
        period: Period,
        limit: usize,
    ) -> StoreResult<Vec<ViolationRecord>> {
        self.violation_history_at(category, period, limit, now_millis())
            .await
    }

    pub(crate) async fn violation_history_at(
        &self,
        category: Category,
        period: Period,
        limit: usize,
        now_ms: i64,
    ) -> StoreResult<Vec<ViolationRecord>> {
        let since = now_ms - period.window_millis();
        let records = self.records(category, now_ms).await?;
        Ok(records
            .into_iter()
            .rev()
            .filter(|record| record.timestamp >= since)
            .take(limit)
            .collect())
    }

    /// Every active identity block, soonest expiry first.
    pub async fn blocked_identities(&self) -> StoreResult<Vec<BlockedIdentity>> {
        let now = Utc::now();
        let pattern = format!("{}*", keys::BLOCKED_PREFIX);
        let mut blocked = Vec::new();
        for key in self.store.keys_matching(&pattern).await? {
            // may have expired since the scan
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let Some(blocked_until) = until_from_ttl(self.store.ttl(&key).await?, now) else {
                continue;
            };
            let identity = key
                .strip_prefix(keys::BLOCKED_PREFIX)
                .unwrap_or(&key)
                .to_string();
            blocked.push(BlockedIdentity {
                identity,
                blocked_until,
                reason: BlockRecord::parse(&raw).and_then(|record| record.reason),
            });
        }
        blocked.sort_by(|a, b| {
            a.blocked_until
                .cmp(&b.blocked_until)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        Ok(blocked)
    }

    pub async fn identity_stats(&self, identity: &str) -> StoreResult<IdentityStats> {
        self.identity_stats_at(identity, now_millis()).await
    }

    pub(crate) async fn identity_stats_at(
        &self,
        identity: &str,
        now_ms: i64,
    ) -> StoreResult<IdentityStats> {
        let pattern = format!("{}*", keys::VIOLATIONS_PREFIX);
        let mut by_category: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_period = PeriodCounts::default();
        let mut total = 0u64;

        for key in self.store.keys_matching(&pattern).await? {
            let label = key.strip_prefix(keys::VIOLATIONS_PREFIX).unwrap_or(&key);
            let Ok(category) = Category::parse(label) else {
                continue;
            };
            for record in self.records(category, now_ms).await? {
                if record.identity != identity {
                    continue;
                }
                total += 1;
                *by_category.entry(category.to_string()).or_default() += 1;
                let age = now_ms - record.timestamp;
                if age < Period::Hourly.window_millis() {
                    by_period.hourly += 1;
                }
                if age < Period::Daily.window_millis() {
                    by_period.daily += 1;
                }
                by_period.weekly += 1;
            }
        }

        let block_key = keys::blocked(identity);
        let is_blocked = self.store.exists(&block_key).await?;
        let blocked_until = if is_blocked {
            until_from_ttl(self.store.ttl(&block_key).await?, Utc::now())
        } else {
            None
        };

        Ok(IdentityStats {
            identity: identity.to_string(),
            total_violations: total,
            violations_by_category: by_category,
            violations_by_period: by_period,
            is_blocked,
            blocked_until,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{drain, engine_with};
    use crate::store::MemoryStore;
    use crate::store::testing::UnavailableStore;
    use std::time::Duration;
    use tripwire_core::alerts::AlertKind;
    use tripwire_core::thresholds::ViolationThresholds;

    const NOW: i64 = 1_760_000_000_000;
    const HOUR_MS: i64 = 3_600_000;
    const DAY_MS: i64 = 24 * HOUR_MS;

    async fn seed(store: &MemoryStore, category: Category, identity: &str, timestamp: i64) {
        let record = ViolationRecord {
            category,
            identity: identity.to_string(),
            timestamp,
        };
        store
            .append_timestamped(
                &keys::violations(category),
                timestamp,
                &serde_json::to_string(&record).unwrap(),
            )
            .await
            .unwrap();
    }

    fn insights(store: &Arc<MemoryStore>) -> AbuseInsights {
        AbuseInsights::new(store.clone())
    }

    #[tokio::test]
    async fn stats_are_windowed_per_period() {
        let store = Arc::new(MemoryStore::new());
        let a = "ip=10.1.0.1,user=anonymous";
        let b = "ip=10.1.0.1,user=alice";
        let c = "ip=10.1.0.2,user=anonymous";
        seed(&store, Category::Login, a, NOW - 10_000).await;
        seed(&store, Category::Login, b, NOW - 20_000).await;
        seed(&store, Category::Login, c, NOW - 2 * HOUR_MS).await;
        seed(&store, Category::Login, c, NOW - 3 * DAY_MS).await;

        let insights = insights(&store);
        let hourly = insights
            .violation_stats_at(Category::Login, Period::Hourly, NOW)
            .await
            .unwrap();
        assert_eq!(hourly.total, 2);
        assert_eq!(hourly.unique_identities, 2);
        assert_eq!(hourly.unique_remote_addresses, 1);

        let daily = insights
            .violation_stats_at(Category::Login, Period::Daily, NOW)
            .await
            .unwrap();
        assert_eq!(daily.total, 3);
        assert_eq!(daily.unique_remote_addresses, 2);

        let weekly = insights
            .violation_stats_at(Category::Login, Period::Weekly, NOW)
            .await
            .unwrap();
        assert_eq!(weekly.total, 4);
        assert_eq!(weekly.unique_identities, 3);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = Arc::new(MemoryStore::new());
        for offset in 1..=5 {
            seed(&store, Category::Payment, "ip=10.2.0.1,user=anonymous", NOW - offset * 1_000).await;
        }
        let history = insights(&store)
            .violation_history_at(Category::Payment, Period::Hourly, 3, NOW)
            .await
            .unwrap();
        let timestamps: Vec<i64> = history.iter().map(|record| record.timestamp).collect();
        assert_eq!(timestamps, vec![NOW - 1_000, NOW - 2_000, NOW - 3_000]);
    }

    #[tokio::test]
    async fn records_past_retention_are_pruned_on_read() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, Category::Upload, "ip=10.3.0.1,user=anonymous", NOW - 8 * DAY_MS).await;
        seed(&store, Category::Upload, "ip=10.3.0.1,user=anonymous", NOW - HOUR_MS * 2).await;

        let stats = insights(&store)
            .violation_stats_at(Category::Upload, Period::Weekly, NOW)
            .await
            .unwrap();
        assert_eq!(stats.total, 1);

        let remaining = store
            .range_by_score(&keys::violations(Category::Upload), i64::MIN, i64::MAX)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn identity_stats_span_categories() {
        let store = Arc::new(MemoryStore::new());
        let id = "ip=10.4.0.1,user=anonymous";
        seed(&store, Category::Login, id, NOW - 1_000).await;
        seed(&store, Category::Login, id, NOW - 2 * DAY_MS).await;
        seed(&store, Category::TwoFactorVerify, id, NOW - 5 * HOUR_MS).await;
        seed(&store, Category::Login, "ip=10.4.0.2,user=anonymous", NOW - 1_000).await;

        let stats = insights(&store).identity_stats_at(id, NOW).await.unwrap();
        assert_eq!(stats.total_violations, 3);
        assert_eq!(stats.violations_by_category.get("login"), Some(&2));
        assert_eq!(stats.violations_by_category.get("2fa_verify"), Some(&1));
        assert_eq!(
            stats.violations_by_period,
            PeriodCounts {
                hourly: 1,
                daily: 2,
                weekly: 3
            }
        );
        assert!(!stats.is_blocked);
        assert_eq!(stats.blocked_until, None);
    }

    #[tokio::test]
    async fn unknown_identity_reads_as_empty() {
        let store = Arc::new(MemoryStore::new());
        let stats = insights(&store)
            .identity_stats("ip=10.5.0.1,user=nobody")
            .await
            .unwrap();
        assert_eq!(stats.total_violations, 0);
        assert!(stats.violations_by_category.is_empty());
    }

    #[tokio::test]
    async fn ninth_and_tenth_login_violations() {
        let store = Arc::new(MemoryStore::new());
        let (engine, mut rx) = engine_with(store.clone(), ViolationThresholds::default());
        let insights = insights(&store);
        let id = "ip=1.2.3.4,user=anonymous";

        for _ in 0..9 {
            engine.record_violation(Category::Login, id).await.unwrap();
        }
        assert!(drain(&mut rx).is_empty());
        assert_eq!(insights.identity_stats(id).await.unwrap().total_violations, 9);

        let outcome = engine.record_violation(Category::Login, id).await.unwrap();
        assert_eq!(outcome.counts.hourly, 10);
        let alerts = drain(&mut rx);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::ViolationThreshold);
        assert_eq!(alerts[0].field_value("count"), Some("10"));
    }

    #[tokio::test]
    async fn blocked_identities_carry_expiry_and_reason() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _rx) = engine_with(store.clone(), ViolationThresholds::default());
        engine
            .block_identity("ip=10.6.0.1,user=anonymous", Some("spam"), Duration::from_secs(3_600))
            .await
            .unwrap();
        engine
            .block_identity("ip=10.6.0.2,user=anonymous", None, Duration::from_secs(60))
            .await
            .unwrap();

        let blocked = insights(&store).blocked_identities().await.unwrap();
        assert_eq!(blocked.len(), 2);
        assert_eq!(blocked[0].identity, "ip=10.6.0.2,user=anonymous");
        assert_eq!(blocked[0].reason, None);
        assert_eq!(blocked[1].reason.as_deref(), Some("spam"));
        assert!(blocked[1].blocked_until > Utc::now() + chrono::Duration::minutes(59));

        let stats = insights(&store)
            .identity_stats("ip=10.6.0.1,user=anonymous")
            .await
            .unwrap();
        assert!(stats.is_blocked);
        assert!(stats.blocked_until.is_some());
    }

    #[tokio::test]
    async fn store_outage_is_reported_not_hidden() {
        let insights = AbuseInsights::new(Arc::new(UnavailableStore));
        assert!(insights
            .violation_stats(Category::Login, Period::Hourly)
            .await
            .is_err());
        assert!(insights.blocked_identities().await.is_err());
    }
}
