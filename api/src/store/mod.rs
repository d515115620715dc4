//! Counter Store: the keyed cache every piece of shared abuse state lives in.
//!
//! The engine holds no locks of its own. Atomicity of increment-and-arm-expiry
//! and of ordered-list appends is the store's job; absence of a key is the
//! only "expired" signal anyone reads.

use std::time::Duration;

use async_trait::async_trait;

pub mod keys;
pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("key '{key}' holds a different kind of value")]
    WrongType { key: String },
    #[error("invalid key pattern '{0}'")]
    InvalidPattern(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one and return the new value. A key created by this
    /// call gets `expiry` armed in the same step; an existing key keeps the
    /// expiry it already has.
    async fn increment(&self, key: &str, expiry: Duration) -> StoreResult<i64>;

    /// Set the expiry of an existing key. Returns false when the key is absent.
    async fn set_expiry(&self, key: &str, expiry: Duration) -> StoreResult<bool>;

    /// Append `value` at `score` to an ordered collection, creating it if needed.
    async fn append_timestamped(&self, key: &str, score: i64, value: &str) -> StoreResult<()>;

    /// Remove all entries with `min_score <= score <= max_score`; returns how many.
    async fn prune_range(&self, key: &str, min_score: i64, max_score: i64) -> StoreResult<u64>;

    /// Entries with `min_score <= score <= max_score`, ascending by score.
    async fn range_by_score(
        &self,
        key: &str,
        min_score: i64,
        max_score: i64,
    ) -> StoreResult<Vec<String>>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Insert or overwrite `key` with a fresh TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Remaining lifetime; `None` when the key is absent or never expires.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Live keys matching a glob pattern (`*` and `?` wildcards).
    async fn keys_matching(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Cheap reachability probe for health checks.
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Round a remaining TTL up to whole seconds for retry hints.
pub fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
