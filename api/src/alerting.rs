//! Alerting Sink.
//!
//! The engine pushes alerts into a bounded queue without waiting. A single
//! dispatcher task drains it, feeds live dashboard subscribers and hands each
//! alert to every configured notifier. Delivery is best-effort throughout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tripwire_core::alerts::{Alert, Severity};

/// Buffered alerts per dashboard subscriber before it starts lagging.
pub const FEED_CAPACITY: usize = 256;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("receiver rejected alert with status {status}")]
    Rejected { status: u16 },
}

/// Producer half handed to the engine. Cloning is cheap.
#[derive(Clone, Debug)]
pub struct AlertSender {
    tx: mpsc::Sender<Alert>,
}

impl AlertSender {
    /// Enqueue without blocking. A full or closed queue drops the alert.
    pub fn emit(&self, alert: Alert) {
        match self.tx.try_send(alert) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(alert)) => {
                tracing::warn!(kind = ?alert.kind, title = %alert.title, "alert queue full, dropping alert");
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                tracing::warn!(kind = ?alert.kind, title = %alert.title, "alert dispatcher gone, dropping alert");
            }
        }
    }
}

pub fn alert_channel(capacity: usize) -> (AlertSender, mpsc::Receiver<Alert>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (AlertSender { tx }, rx)
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Writes every alert to the structured log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        let fields = alert
            .fields
            .iter()
            .map(|field| format!("{}={}", field.name, field.value))
            .collect::<Vec<_>>()
            .join(" ");
        match alert.severity {
            Severity::Critical | Severity::Warning => tracing::warn!(
                kind = ?alert.kind,
                severity = ?alert.severity,
                title = %alert.title,
                description = %alert.description,
                fields = %fields,
                "abuse alert"
            ),
            Severity::Info => tracing::info!(
                kind = ?alert.kind,
                title = %alert.title,
                description = %alert.description,
                fields = %fields,
                "abuse alert"
            ),
        }
        Ok(())
    }
}

/// Posts alerts as chat-style embeds to an HTTP endpoint.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

pub fn embed_body(alert: &Alert) -> serde_json::Value {
    let fields: Vec<serde_json::Value> = alert
        .fields
        .iter()
        .map(|field| json!({ "name": field.name, "value": field.value, "inline": true }))
        .collect();
    json!({
        "embeds": [{
            "title": alert.title,
            "description": alert.description,
            "fields": fields,
            "color": alert.severity.color(),
            "timestamp": alert.timestamp.to_rfc3339(),
        }]
    })
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&embed_body(alert))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    NotifyError::Transport("request timeout (10s)".to_string())
                } else {
                    NotifyError::Transport(err.to_string())
                }
            })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

/// Consumer task behind [`AlertSender`].
pub struct AlertDispatcher {
    rx: mpsc::Receiver<Alert>,
    feed: broadcast::Sender<Alert>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl AlertDispatcher {
    pub fn new(rx: mpsc::Receiver<Alert>, feed: broadcast::Sender<Alert>) -> Self {
        Self {
            rx,
            feed,
            notifiers: Vec::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Drain the queue until every [`AlertSender`] is dropped.
    pub async fn run(mut self) {
        while let Some(alert) = self.rx.recv().await {
            // no live subscribers is fine
            let _ = self.feed.send(alert.clone());
            for notifier in &self.notifiers {
                if let Err(err) = notifier.send(&alert).await {
                    tracing::error!(
                        notifier = notifier.name(),
                        kind = ?alert.kind,
                        error = %err,
                        "alert delivery failed"
                    );
                }
            }
        }
        tracing::debug!("alert dispatcher stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Collects delivered alerts for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub delivered: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
            self.delivered.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;
    use tripwire_core::alerts::AlertKind;

    struct BrokenNotifier;

    #[async_trait]
    impl Notifier for BrokenNotifier {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn send(&self, _alert: &Alert) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected { status: 502 })
        }
    }

    fn sample(title: &str) -> Alert {
        Alert::new(AlertKind::GeoBlocked, Severity::Warning, title, "test")
            .field("remote_address", "203.0.113.9")
    }

    #[test]
    fn emit_drops_when_queue_is_full() {
        let (sender, mut rx) = alert_channel(1);
        sender.emit(sample("first"));
        sender.emit(sample("second"));

        assert_eq!(rx.try_recv().unwrap().title, "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn emit_after_dispatcher_shutdown_does_not_panic() {
        let (sender, rx) = alert_channel(4);
        drop(rx);
        sender.emit(sample("late"));
    }

    #[tokio::test]
    async fn dispatcher_fans_out_past_failing_notifiers() {
        let (sender, rx) = alert_channel(8);
        let (feed, mut subscriber) = broadcast::channel(FEED_CAPACITY);
        let recorder = Arc::new(RecordingNotifier::default());
        let handle = AlertDispatcher::new(rx, feed)
            .with_notifier(Arc::new(BrokenNotifier))
            .with_notifier(recorder.clone())
            .spawn();

        sender.emit(sample("one"));
        sender.emit(sample("two"));
        drop(sender);
        handle.await.unwrap();

        let delivered = recorder.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].title, "two");
        assert_eq!(subscriber.recv().await.unwrap().title, "one");
    }

    #[test]
    fn embed_body_carries_fields_and_colour() {
        let body = embed_body(&sample("Geo block installed"));
        let embed = &body["embeds"][0];
        assert_eq!(embed["title"], "Geo block installed");
        assert_eq!(embed["color"], Severity::Warning.color());
        assert_eq!(embed["fields"][0]["name"], "remote_address");
        assert_eq!(embed["fields"][0]["inline"], true);
    }
}
