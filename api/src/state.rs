use std::sync::Arc;

use tokio::sync::broadcast;
use tripwire_core::alerts::Alert;

use crate::alerting::AlertSender;
use crate::config::AppConfig;
use crate::engine::AbuseEngine;
use crate::insights::AbuseInsights;
use crate::store::CounterStore;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AbuseEngine>,
    pub insights: AbuseInsights,
    pub admin_key_hashes: Arc<[String]>,
    /// Live alert feed for dashboard subscribers
    pub alert_feed: broadcast::Sender<Alert>,
    pub trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CounterStore>,
        config: &AppConfig,
        alerts: AlertSender,
        alert_feed: broadcast::Sender<Alert>,
    ) -> Self {
        Self {
            engine: Arc::new(AbuseEngine::new(
                Arc::clone(&store),
                alerts,
                config.violation_thresholds,
            )),
            insights: AbuseInsights::new(store),
            admin_key_hashes: config.admin_key_hashes.clone().into(),
            alert_feed,
            trust_forwarded_for: config.trust_forwarded_for,
        }
    }
}
