//! Built-in notification channels.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{ChannelError, NotificationChannel};
use crate::alarm::{AlarmEvent, AlarmNotification, AlarmStateValue};
use crate::db::{AlarmStore, NotificationBatch};

/// Human-readable channel: renders the event as a sentence in the log.
pub struct LogChannel;

impl LogChannel {
    pub fn render(event: &AlarmEvent) -> String {
        format!(
            "{}: \"{}\" changed from {} to {} at {}. Reason: {}",
            event.new_state,
            event.alarm_name,
            event.old_state,
            event.new_state,
            event.state_change_time.format("%Y-%m-%d %H:%M:%S UTC"),
            event.reason
        )
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, event: &AlarmEvent) -> Result<(), ChannelError> {
        let text = Self::render(event);
        match event.new_state {
            AlarmStateValue::Alarm => tracing::warn!("{}", text),
            _ => tracing::info!("{}", text),
        }
        Ok(())
    }
}

/// Posts the wire payload as JSON to an HTTP endpoint.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("canarywatch/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, event: &AlarmEvent) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(&self.url)
            .json(&AlarmNotification::from(event))
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ChannelError::Rejected(format!("HTTP {}: {}", status, body)))
        }
    }
}

/// Processing channel: serializes the event and hands it to the alarm store.
pub struct StoreChannel {
    alarms: Arc<AlarmStore>,
}

impl StoreChannel {
    pub fn new(alarms: Arc<AlarmStore>) -> Self {
        Self { alarms }
    }
}

#[async_trait]
impl NotificationChannel for StoreChannel {
    fn name(&self) -> &str {
        "store"
    }

    async fn send(&self, event: &AlarmEvent) -> Result<(), ChannelError> {
        let message = serde_json::to_string(&AlarmNotification::from(event))
            .map_err(|e| ChannelError::Rejected(e.to_string()))?;
        let batch = NotificationBatch::single(message);

        let alarms = self.alarms.clone();
        let response = tokio::task::spawn_blocking(move || alarms.process(&batch))
            .await
            .map_err(|e| ChannelError::Transport(format!("store task failed: {}", e)))?;

        if response.is_success() {
            Ok(())
        } else {
            Err(ChannelError::Rejected(match response.error {
                Some(detail) => format!("{}: {}", response.message, detail),
                None => response.message,
            }))
        }
    }
}
