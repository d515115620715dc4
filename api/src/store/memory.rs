use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{CounterStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Text(String),
    /// Ordered by (score, insertion sequence) so equal scores keep every member.
    Ordered(BTreeMap<(i64, u64), String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process counter store on a sharded concurrent map.
///
/// Expiry uses tokio's clock so paused-time tests can drive it. Expired
/// entries are invisible to every read and are purged lazily on access and
/// periodically by [`MemoryStore::spawn_janitor`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    /// Live entries only.
    pub(crate) fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|slot| slot.is_live(now)).count()
    }

    /// Periodically purge expired entries until the store is dropped.
    pub fn spawn_janitor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = store.len(), "counter store purge");
                }
            }
        })
    }

    /// Remove `key` if it has expired so callers see a clean vacancy.
    fn evict_if_expired(&self, key: &str, now: Instant) {
        self.slots.remove_if(key, |_, slot| !slot.is_live(now));
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

/// Translate a `*`/`?` glob into an anchored regex.
fn glob_regex(pattern: &str) -> StoreResult<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|_| StoreError::InvalidPattern(pattern.to_string()))
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, expiry: Duration) -> StoreResult<i64> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if !slot.is_live(now) {
                    *slot = Slot {
                        value: Value::Counter(1),
                        expires_at: Some(now + expiry),
                    };
                    return Ok(1);
                }
                match &mut slot.value {
                    Value::Counter(count) => {
                        *count += 1;
                        Ok(*count)
                    }
                    _ => Err(wrong_type(key)),
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Counter(1),
                    expires_at: Some(now + expiry),
                });
                Ok(1)
            }
        }
    }

    async fn set_expiry(&self, key: &str, expiry: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        self.evict_if_expired(key, now);
        match self.slots.get_mut(key) {
            Some(mut slot) => {
                slot.expires_at = Some(now + expiry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_timestamped(&self, key: &str, score: i64, value: &str) -> StoreResult<()> {
        let now = Instant::now();
        let seq = self.next_seq();
        self.evict_if_expired(key, now);
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Ordered(BTreeMap::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Ordered(entries) => {
                entries.insert((score, seq), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn prune_range(&self, key: &str, min_score: i64, max_score: i64) -> StoreResult<u64> {
        let now = Instant::now();
        self.evict_if_expired(key, now);
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(0);
        };
        let Value::Ordered(entries) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        if min_score > max_score {
            return Ok(0);
        }
        let doomed: Vec<(i64, u64)> = entries
            .range((min_score, 0)..=(max_score, u64::MAX))
            .map(|(position, _)| *position)
            .collect();
        for position in &doomed {
            entries.remove(position);
        }
        let emptied = entries.is_empty();
        drop(slot);
        if emptied {
            self.slots.remove_if(key, |_, slot| {
                matches!(&slot.value, Value::Ordered(entries) if entries.is_empty())
            });
        }
        Ok(doomed.len() as u64)
    }

    async fn range_by_score(
        &self,
        key: &str,
        min_score: i64,
        max_score: i64,
    ) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let Some(slot) = self.slots.get(key) else {
            return Ok(Vec::new());
        };
        if !slot.is_live(now) {
            return Ok(Vec::new());
        }
        let Value::Ordered(entries) = &slot.value else {
            return Err(wrong_type(key));
        };
        if min_score > max_score {
            return Ok(Vec::new());
        }
        Ok(entries
            .range((min_score, 0)..=(max_score, u64::MAX))
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let Some(slot) = self.slots.get(key) else {
            return Ok(None);
        };
        if !slot.is_live(now) {
            return Ok(None);
        }
        match &slot.value {
            Value::Counter(count) => Ok(Some(count.to_string())),
            Value::Text(text) => Ok(Some(text.clone())),
            Value::Ordered(_) => Err(wrong_type(key)),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .slots
            .remove(key)
            .is_some_and(|(_, slot)| slot.is_live(now)))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self.slots.get(key).is_some_and(|slot| slot.is_live(now)))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        Ok(self.slots.get(key).and_then(|slot| match slot.expires_at {
            Some(at) if at > now => Some(at - now),
            _ => None,
        }))
    }

    async fn keys_matching(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = glob_regex(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| slot.is_live(now) && matcher.is_match(slot.key()))
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn increment_arms_expiry_only_on_creation() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("c", HOUR).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(1800)).await;
        assert_eq!(store.increment("c", HOUR).await.unwrap(), 2);

        // second increment must not have pushed the expiry out
        let remaining = store.ttl("c").await.unwrap().unwrap();
        assert_eq!(remaining, Duration::from_secs(1800));

        tokio::time::advance(Duration::from_secs(1801)).await;
        assert_eq!(store.get("c").await.unwrap(), None);
        assert_eq!(store.increment("c", HOUR).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    store.increment("shared", HOUR).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get("shared").await.unwrap().as_deref(), Some("2000"));
    }

    #[tokio::test]
    async fn ordered_entries_keep_duplicate_scores() {
        let store = MemoryStore::new();
        store.append_timestamped("z", 100, "a").await.unwrap();
        store.append_timestamped("z", 100, "a").await.unwrap();
        store.append_timestamped("z", 50, "b").await.unwrap();
        store.append_timestamped("z", 200, "c").await.unwrap();

        let all = store.range_by_score("z", i64::MIN, i64::MAX).await.unwrap();
        assert_eq!(all, vec!["b", "a", "a", "c"]);

        let middle = store.range_by_score("z", 60, 150).await.unwrap();
        assert_eq!(middle, vec!["a", "a"]);
    }

    #[tokio::test]
    async fn prune_range_removes_inclusive_bounds() {
        let store = MemoryStore::new();
        for score in [10, 20, 30, 40] {
            store
                .append_timestamped("z", score, &score.to_string())
                .await
                .unwrap();
        }
        assert_eq!(store.prune_range("z", 0, 20).await.unwrap(), 2);
        assert_eq!(
            store.range_by_score("z", i64::MIN, i64::MAX).await.unwrap(),
            vec!["30", "40"]
        );
        assert_eq!(store.prune_range("z", 0, 100).await.unwrap(), 2);
        assert!(!store.exists("z").await.unwrap());
        assert_eq!(store.prune_range("missing", 0, 100).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_with_ttl_overwrites_and_expires() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("block", "first", Duration::from_secs(10))
            .await
            .unwrap();
        store
            .set_with_ttl("block", "second", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("block").await.unwrap().as_deref(), Some("second"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(store.exists("block").await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists("block").await.unwrap());
        assert_eq!(store.ttl("block").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_expiry_on_missing_key_reports_false() {
        let store = MemoryStore::new();
        assert!(!store.set_expiry("nope", HOUR).await.unwrap());

        store.increment("c", Duration::from_secs(5)).await.unwrap();
        assert!(store.set_expiry("c", HOUR).await.unwrap());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let store = MemoryStore::new();
        store.set_with_ttl("k", "v", HOUR).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn mixing_value_kinds_is_rejected() {
        let store = MemoryStore::new();
        store.append_timestamped("z", 1, "a").await.unwrap();
        assert!(matches!(
            store.increment("z", HOUR).await,
            Err(StoreError::WrongType { .. })
        ));
        assert!(matches!(store.get("z").await, Err(StoreError::WrongType { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_matching_skips_expired_and_escapes_literals() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("ratelimit:blocked:ip=1.2.3.4,user=a", "x", HOUR)
            .await
            .unwrap();
        store
            .set_with_ttl("ratelimit:blocked:ip=5.6.7.8,user=b", "x", Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set_with_ttl("ratelimit:blockedXip", "x", HOUR)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let keys = store.keys_matching("ratelimit:blocked:*").await.unwrap();
        assert_eq!(keys, vec!["ratelimit:blocked:ip=1.2.3.4,user=a"]);

        let dotted = store.keys_matching("ratelimit:blocked:ip=1.2.3.?,*").await.unwrap();
        assert_eq!(dotted.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_drops_dead_slots() {
        let store = MemoryStore::new();
        store.increment("short", Duration::from_secs(1)).await.unwrap();
        store.increment("long", HOUR).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_stops_when_store_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        store.increment("short", Duration::from_secs(1)).await.unwrap();
        let handle = store.spawn_janitor(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.slots.len(), 0);

        drop(store);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_finished());
    }
}
