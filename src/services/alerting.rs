//! Alert fan-out to notification channels, decoupled from the request path.
//!
//! [`QueuedDispatcher::dispatch`] never blocks: alerts go onto a bounded queue
//! and a worker task delivers them to every channel that accepts the alert's
//! severity, retrying with linear backoff. Delivery is at-least-once per
//! channel; a full queue drops the alert with a warning.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::config::AlertingConfig;
use crate::errors::DispatchError;
use crate::models::alert::Alert;
use crate::models::severity::Severity;
use crate::store::AlertStore;

/// SMS bodies are cut to one segment.
const SMS_MAX_CHARS: usize = 160;

/// Accepts alerts for delivery. Must return immediately.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, alert: Alert);
}

/// One delivery target.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, _severity: Severity) -> bool {
        true
    }

    async fn send(&self, alert: &Alert) -> Result<(), DispatchError>;
}

/// Gateway for message-style transports (email, SMS).
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn deliver(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), DispatchError>;
}

/// Writes alerts to the `security` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), DispatchError> {
        tracing::warn!(
            target: "security",
            alert_id = %alert.id,
            event_type = %alert.event_type,
            severity = %alert.severity,
            priority = %alert.priority,
            event_count = alert.event_count,
            "{}",
            alert.title
        );
        Ok(())
    }
}

/// Persists alerts through an [`AlertStore`].
pub struct DatabaseChannel {
    store: Arc<dyn AlertStore>,
}

impl DatabaseChannel {
    pub fn new(store: Arc<dyn AlertStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationChannel for DatabaseChannel {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn send(&self, alert: &Alert) -> Result<(), DispatchError> {
        self.store.record_alert(alert).await?;
        Ok(())
    }
}

/// Posts to a Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct SlackChannel {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackChannel {
    pub fn new(client: reqwest::Client, webhook_url: impl Into<String>) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> Result<(), DispatchError> {
        let actions = alert
            .recommended_actions
            .iter()
            .map(|a| format!("• {a}"))
            .collect::<Vec<_>>()
            .join("\n");
        let payload = json!({
            "text": format!("*{}* ({})\n{}\n{}", alert.title, alert.priority, alert.description, actions),
        });

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error("slack", e))?;

        if !response.status().is_success() {
            return Err(DispatchError::Transport {
                channel: "slack".to_string(),
                message: format!("webhook returned {}", response.status()),
            });
        }
        Ok(())
    }
}

/// JSON-over-HTTP message gateway: `POST {to, subject, body}`.
#[derive(Debug, Clone)]
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
    channel: &'static str,
}

impl WebhookTransport {
    pub fn new(client: reqwest::Client, url: impl Into<String>, channel: &'static str) -> Self {
        Self {
            client,
            url: url.into(),
            channel,
        }
    }
}

#[async_trait]
impl MessageTransport for WebhookTransport {
    async fn deliver(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "to": recipients, "subject": subject, "body": body }))
            .send()
            .await
            .map_err(|e| transport_error(self.channel, e))?;

        if !response.status().is_success() {
            return Err(DispatchError::Transport {
                channel: self.channel.to_string(),
                message: format!("gateway returned {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Email to the alert's recipients, only at or above `min_severity`.
pub struct EmailChannel {
    transport: Arc<dyn MessageTransport>,
    min_severity: Severity,
}

impl EmailChannel {
    pub fn new(transport: Arc<dyn MessageTransport>, min_severity: Severity) -> Self {
        Self {
            transport,
            min_severity,
        }
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn accepts(&self, severity: Severity) -> bool {
        severity >= self.min_severity
    }

    async fn send(&self, alert: &Alert) -> Result<(), DispatchError> {
        if alert.recipients.is_empty() {
            return Err(DispatchError::NotConfigured {
                channel: "email".to_string(),
                message: format!("no recipients for {} alerts", alert.severity),
            });
        }

        let mut body = format!(
            "{}\n\nPriority: {}\nEvent type: {}\nEvents: {} within {} minute(s)\n\nRecommended actions:\n",
            alert.description, alert.priority, alert.event_type, alert.event_count, alert.window_minutes
        );
        for action in &alert.recommended_actions {
            body.push_str(&format!("- {action}\n"));
        }
        body.push_str(&format!("\nEvidence:\n{}\n", alert.evidence));

        self.transport
            .deliver(&alert.recipients, &alert.title, &body)
            .await
    }
}

/// One-segment SMS, only at or above `min_severity`.
pub struct SmsChannel {
    transport: Arc<dyn MessageTransport>,
    min_severity: Severity,
}

impl SmsChannel {
    pub fn new(transport: Arc<dyn MessageTransport>, min_severity: Severity) -> Self {
        Self {
            transport,
            min_severity,
        }
    }
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn name(&self) -> &'static str {
        "sms"
    }

    fn accepts(&self, severity: Severity) -> bool {
        severity >= self.min_severity
    }

    async fn send(&self, alert: &Alert) -> Result<(), DispatchError> {
        if alert.recipients.is_empty() {
            return Err(DispatchError::NotConfigured {
                channel: "sms".to_string(),
                message: format!("no recipients for {} alerts", alert.severity),
            });
        }
        let text: String = format!("{} ({} events)", alert.title, alert.event_count)
            .chars()
            .take(SMS_MAX_CHARS)
            .collect();
        self.transport.deliver(&alert.recipients, "", &text).await
    }
}

fn transport_error(channel: &str, error: reqwest::Error) -> DispatchError {
    DispatchError::Transport {
        channel: channel.to_string(),
        message: error.to_string(),
    }
}

/// Retry policy for one channel delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub timeout_ms: u64,
}

impl From<&AlertingConfig> for DeliveryPolicy {
    fn from(config: &AlertingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_ms: config.retry_backoff_ms,
            timeout_ms: config.send_timeout_ms,
        }
    }
}

/// Build the channels enabled in `config`. Channels switched on without a
/// gateway URL are skipped with a warning.
pub fn build_channels(
    config: &AlertingConfig,
    alert_store: Arc<dyn AlertStore>,
    client: reqwest::Client,
) -> Vec<Arc<dyn NotificationChannel>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    let toggles = &config.channels;

    if toggles.log {
        channels.push(Arc::new(LogChannel));
    }
    if toggles.database {
        channels.push(Arc::new(DatabaseChannel::new(alert_store)));
    }
    if toggles.slack {
        match &config.slack_webhook_url {
            Some(url) => channels.push(Arc::new(SlackChannel::new(client.clone(), url.as_str()))),
            None => tracing::warn!("Slack alerts enabled without slack_webhook_url, skipping"),
        }
    }
    if toggles.email {
        match &config.email_gateway_url {
            Some(url) => {
                let transport = Arc::new(WebhookTransport::new(client.clone(), url.as_str(), "email"));
                channels.push(Arc::new(EmailChannel::new(transport, config.page_min_severity)));
            }
            None => tracing::warn!("Email alerts enabled without email_gateway_url, skipping"),
        }
    }
    if toggles.sms {
        match &config.sms_gateway_url {
            Some(url) => {
                let transport = Arc::new(WebhookTransport::new(client, url.as_str(), "sms"));
                channels.push(Arc::new(SmsChannel::new(transport, config.page_min_severity)));
            }
            None => tracing::warn!("SMS alerts enabled without sms_gateway_url, skipping"),
        }
    }

    channels
}

/// Bounded queue in front of a delivery worker.
#[derive(Debug, Clone)]
pub struct QueuedDispatcher {
    sender: mpsc::Sender<Alert>,
}

impl QueuedDispatcher {
    /// Start the worker. It exits once every dispatcher clone is dropped and
    /// the queue is drained.
    pub fn spawn(
        channels: Vec<Arc<dyn NotificationChannel>>,
        policy: DeliveryPolicy,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<Alert>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(alert) = receiver.recv().await {
                for channel in &channels {
                    if !channel.accepts(alert.severity) {
                        continue;
                    }
                    if let Err(e) = deliver(channel.as_ref(), &alert, policy).await {
                        tracing::error!(
                            channel = channel.name(),
                            alert_id = %alert.id,
                            error = %e,
                            "Alert delivery failed"
                        );
                    }
                }
            }
            tracing::debug!("Alert dispatcher worker stopped");
        });

        (Self { sender }, worker)
    }
}

impl NotificationDispatcher for QueuedDispatcher {
    fn dispatch(&self, alert: Alert) {
        match self.sender.try_send(alert) {
            Ok(()) => {}
            Err(TrySendError::Full(alert)) => {
                tracing::warn!(alert_id = %alert.id, title = %alert.title, "Alert queue full, dropping alert");
            }
            Err(TrySendError::Closed(alert)) => {
                tracing::error!(alert_id = %alert.id, "Alert dispatcher stopped, dropping alert");
            }
        }
    }
}

/// Deliver with per-attempt timeout and linear backoff.
async fn deliver(
    channel: &dyn NotificationChannel,
    alert: &Alert,
    policy: DeliveryPolicy,
) -> Result<(), DispatchError> {
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(
            Duration::from_millis(policy.timeout_ms),
            channel.send(alert),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Transport {
                channel: channel.name().to_string(),
                message: format!("timed out after {} ms", policy.timeout_ms),
            }),
        };

        match outcome {
            Ok(()) => return Ok(()),
            // Missing configuration will not fix itself on retry.
            Err(e @ DispatchError::NotConfigured { .. }) => return Err(e),
            Err(e) if attempt >= policy.max_attempts => return Err(e),
            Err(e) => {
                tracing::warn!(
                    channel = channel.name(),
                    attempt,
                    error = %e,
                    "Alert delivery attempt failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(policy.backoff_ms * attempt as u64)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryAlertStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    fn alert(severity: Severity) -> Alert {
        Alert::threshold_breach(
            "sql_injection_attempt",
            severity,
            1,
            1,
            json!({ "ip": "203.0.113.1" }),
            vec!["soc@example.com".to_string()],
        )
    }

    const FAST: DeliveryPolicy = DeliveryPolicy {
        max_attempts: 3,
        backoff_ms: 1,
        timeout_ms: 200,
    };

    /// Fails the first `failures` sends, then succeeds.
    struct FlakyChannel {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotificationChannel for FlakyChannel {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn send(&self, _alert: &Alert) -> Result<(), DispatchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(DispatchError::Transport {
                    channel: "flaky".to_string(),
                    message: "connection refused".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Vec<String>, String, String)>>,
    }

    #[async_trait]
    impl MessageTransport for RecordingTransport {
        async fn deliver(
            &self,
            recipients: &[String],
            subject: &str,
            body: &str,
        ) -> Result<(), DispatchError> {
            self.sent
                .lock()
                .await
                .push((recipients.to_vec(), subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let channel = FlakyChannel {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        deliver(&channel, &alert(Severity::Critical), FAST).await.unwrap();
        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let channel = FlakyChannel {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let err = deliver(&channel, &alert(Severity::Critical), FAST).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport { .. }));
        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn queued_dispatch_reaches_database_channel() {
        let store = Arc::new(MemoryAlertStore::new());
        let channels: Vec<Arc<dyn NotificationChannel>> =
            vec![Arc::new(LogChannel), Arc::new(DatabaseChannel::new(store.clone()))];
        let (dispatcher, worker) = QueuedDispatcher::spawn(channels, FAST, 8);

        let a = alert(Severity::Critical);
        dispatcher.dispatch(a.clone());
        drop(dispatcher);
        worker.await.unwrap();

        assert_eq!(store.all().await, vec![a]);
    }

    #[tokio::test]
    async fn paging_channels_respect_min_severity() {
        let transport = Arc::new(RecordingTransport::default());
        let email = EmailChannel::new(transport.clone(), Severity::High);
        let sms = SmsChannel::new(transport.clone(), Severity::High);
        assert!(email.accepts(Severity::Critical));
        assert!(!email.accepts(Severity::Medium));
        assert!(!sms.accepts(Severity::Low));

        email.send(&alert(Severity::Critical)).await.unwrap();
        sms.send(&alert(Severity::Critical)).await.unwrap();

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, "[CRITICAL] sql_injection_attempt threshold exceeded");
        assert!(sent[0].2.contains("Recommended actions"));
        assert!(sent[1].2.chars().count() <= SMS_MAX_CHARS);
    }

    #[tokio::test]
    async fn email_without_recipients_is_not_retried() {
        let transport = Arc::new(RecordingTransport::default());
        let email = EmailChannel::new(transport.clone(), Severity::Low);
        let mut a = alert(Severity::High);
        a.recipients.clear();

        let err = deliver(&email, &a, FAST).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotConfigured { .. }));
        assert!(transport.sent.lock().await.is_empty());
    }

    #[test]
    fn channels_follow_toggles() {
        let mut config = AlertingConfig::default();
        let store: Arc<dyn AlertStore> = Arc::new(MemoryAlertStore::new());

        let names = |channels: Vec<Arc<dyn NotificationChannel>>| {
            channels.iter().map(|c| c.name()).collect::<Vec<_>>()
        };

        assert_eq!(
            names(build_channels(&config, store.clone(), reqwest::Client::new())),
            vec!["log", "database"]
        );

        config.channels.slack = true;
        config.channels.email = true;
        config.email_gateway_url = Some("http://mail.internal/send".to_string());
        assert_eq!(
            names(build_channels(&config, store, reqwest::Client::new())),
            vec!["log", "database", "email"]
        );
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (sender, _receiver) = mpsc::channel::<Alert>(1);
        let dispatcher = QueuedDispatcher { sender };
        dispatcher.dispatch(alert(Severity::Low));
        dispatcher.dispatch(alert(Severity::Low));
    }
}
