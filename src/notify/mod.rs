// Operator notifications: fire-and-forget queue with per-key throttling
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::config::NotifyConfig;
use crate::Result;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub severity: Severity,
    /// Identical keys are throttled together
    pub key: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(severity: Severity, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            key: key.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, key, message)
    }

    pub fn warning(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, key, message)
    }

    pub fn critical(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, key, message)
    }
}

/// One-way delivery channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        match notification.severity {
            Severity::Info => tracing::info!(key = %notification.key, "🔔 {}", notification.message),
            Severity::Warning => tracing::warn!(key = %notification.key, "⚠️  {}", notification.message),
            Severity::Critical => tracing::error!(key = %notification.key, "🚨 {}", notification.message),
        }
        Ok(())
    }
}

/// POSTs each notification as JSON to a webhook
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let response = self.client.post(&self.url).json(notification).send().await?;
        if !response.status().is_success() {
            return Err(format!("webhook returned {}", response.status()).into());
        }
        Ok(())
    }
}

/// Queue in front of a `Notifier`.
///
/// `send` never blocks: a full queue drops the message with a warning, and
/// repeats of the same key inside the throttle window are dropped silently.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::Sender<Notification>,
    limiter: Option<Arc<DefaultKeyedRateLimiter<String>>>,
}

impl NotificationDispatcher {
    /// Dispatcher plus the raw receiving end; the caller owns delivery
    pub fn channel(config: &NotifyConfig) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let limiter = Quota::with_period(Duration::from_secs(config.throttle_secs))
            .map(|quota| Arc::new(RateLimiter::keyed(quota)));
        (Self { tx, limiter }, rx)
    }

    /// Dispatcher with a background task delivering to `notifier`
    pub fn spawn(notifier: Arc<dyn Notifier>, config: &NotifyConfig) -> (Self, JoinHandle<()>) {
        let (dispatcher, rx) = Self::channel(config);
        let delivery_timeout = Duration::from_millis(config.delivery_timeout_ms);
        let handle = tokio::spawn(deliver(notifier, rx, delivery_timeout));
        (dispatcher, handle)
    }

    /// Queue a notification; returns false if it was throttled or dropped
    pub fn send(&self, notification: Notification) -> bool {
        if let Some(limiter) = &self.limiter {
            if limiter.check_key(&notification.key).is_err() {
                tracing::debug!(key = %notification.key, "Notification throttled");
                return false;
            }
            if limiter.len() > 1024 {
                limiter.retain_recent();
            }
        }

        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                tracing::warn!(key = %n.key, "Notification queue full, dropping: {}", n.message);
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                tracing::debug!(key = %n.key, "Notification channel closed");
                false
            }
        }
    }
}

async fn deliver(
    notifier: Arc<dyn Notifier>,
    mut rx: mpsc::Receiver<Notification>,
    delivery_timeout: Duration,
) {
    while let Some(notification) = rx.recv().await {
        match timeout(delivery_timeout, notifier.notify(&notification)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(key = %notification.key, "Notification delivery failed: {}", e)
            }
            Err(_) => tracing::warn!(key = %notification.key, "Notification delivery timed out"),
        }
    }
}

/// Webhook notifier when a URL is configured, log notifier otherwise
pub fn notifier_from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingNotifier {
        seen: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<()> {
            self.seen.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    #[test]
    fn test_identical_keys_are_throttled() {
        let (dispatcher, mut rx) = NotificationDispatcher::channel(&NotifyConfig::default());

        assert!(dispatcher.send(Notification::critical("ticket:1:failures", "first")));
        assert!(!dispatcher.send(Notification::critical("ticket:1:failures", "second")));
        assert!(dispatcher.send(Notification::critical("ticket:2:failures", "other")));

        assert_eq!(rx.try_recv().unwrap().message, "first");
        assert_eq!(rx.try_recv().unwrap().message, "other");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_zero_throttle_disables_limiter() {
        let config = NotifyConfig {
            throttle_secs: 0,
            ..NotifyConfig::default()
        };
        let (dispatcher, _rx) = NotificationDispatcher::channel(&config);

        assert!(dispatcher.send(Notification::info("k", "a")));
        assert!(dispatcher.send(Notification::info("k", "b")));
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let config = NotifyConfig {
            queue_size: 1,
            throttle_secs: 0,
            ..NotifyConfig::default()
        };
        let (dispatcher, _rx) = NotificationDispatcher::channel(&config);

        assert!(dispatcher.send(Notification::info("a", "one")));
        assert!(!dispatcher.send(Notification::info("b", "two")));
    }

    #[tokio::test]
    async fn test_background_delivery() {
        let recorder = Arc::new(RecordingNotifier {
            seen: Mutex::new(Vec::new()),
        });
        let (dispatcher, handle) =
            NotificationDispatcher::spawn(recorder.clone(), &NotifyConfig::default());

        dispatcher.send(Notification::warning("oco", "pair cancelled"));
        drop(dispatcher);
        handle.await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "severity": "critical",
                "key": "oco:race",
            })))
            .with_status(200)
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.url()));
        notifier
            .notify(&Notification::critical("oco:race", "both legs filled"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/hook").with_status(500).create_async().await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.url()));
        assert!(notifier.notify(&Notification::info("k", "m")).await.is_err());
    }
}
