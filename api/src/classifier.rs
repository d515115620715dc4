//! Request-cadence classification.
//!
//! Each (identity, category) pair keeps a one-hour ordered log of request
//! timestamps. Evenly spaced or very fast traffic reads as scripted.

use std::sync::Arc;
use std::time::Duration;

use tripwire_core::identity::Category;
use tripwire_core::thresholds::Pattern;

use crate::store::{CounterStore, StoreResult, keys};

pub const SAMPLE_WINDOW: Duration = Duration::from_secs(3600);
/// Below this many samples there is not enough signal to call anything suspicious.
pub const MIN_SAMPLES: usize = 10;
pub const MIN_MEAN_INTERVAL_MS: f64 = 1000.0;
pub const MIN_INTERVAL_VARIANCE: f64 = 1000.0;

#[derive(Clone)]
pub struct PatternClassifier {
    store: Arc<dyn CounterStore>,
}

impl PatternClassifier {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Append a sample at `now_ms` and drop everything older than the window.
    pub async fn record_sample(
        &self,
        identity: &str,
        category: Category,
        now_ms: i64,
    ) -> StoreResult<()> {
        let key = keys::pattern(identity, category);
        self.store
            .append_timestamped(&key, now_ms, &now_ms.to_string())
            .await?;
        let cutoff = now_ms - window_millis();
        self.store.prune_range(&key, i64::MIN, cutoff - 1).await?;
        self.store.set_expiry(&key, SAMPLE_WINDOW).await?;
        Ok(())
    }

    pub async fn classify(
        &self,
        identity: &str,
        category: Category,
        now_ms: i64,
    ) -> StoreResult<Pattern> {
        let key = keys::pattern(identity, category);
        let samples = self
            .store
            .range_by_score(&key, now_ms - window_millis(), i64::MAX)
            .await?;
        let timestamps: Vec<i64> = samples
            .iter()
            .filter_map(|sample| sample.parse().ok())
            .collect();
        let pattern = classify_timestamps(&timestamps);
        tracing::debug!(
            identity,
            category = %category,
            samples = timestamps.len(),
            pattern = %pattern,
            "pattern classified"
        );
        Ok(pattern)
    }
}

fn window_millis() -> i64 {
    SAMPLE_WINDOW.as_millis() as i64
}

/// Classify an ascending list of request timestamps (epoch millis).
pub fn classify_timestamps(timestamps: &[i64]) -> Pattern {
    if timestamps.len() < MIN_SAMPLES {
        return Pattern::Normal;
    }
    let intervals: Vec<f64> = timestamps
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) as f64)
        .collect();
    let count = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / count;
    let variance = intervals
        .iter()
        .map(|interval| (interval - mean).powi(2))
        .sum::<f64>()
        / count;

    if mean < MIN_MEAN_INTERVAL_MS || variance < MIN_INTERVAL_VARIANCE {
        Pattern::Suspicious
    } else {
        Pattern::Normal
    }
}
