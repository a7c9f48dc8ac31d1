//! Fan-out of alarm state changes to independent notification channels.

mod channels;

pub use channels::*;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};

use crate::alarm::AlarmEvent;

/// Longest wait between two delivery attempts.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Channel delivery error types.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// A destination for alarm events.
///
/// Delivery is at-least-once, so implementations must tolerate receiving
/// the same event more than once.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, event: &AlarmEvent) -> Result<(), ChannelError>;
}

/// Outcome of delivering one event to one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub channel: String,
    pub delivered: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Delivers each event to every channel concurrently.
pub struct Notifier {
    channels: Vec<Arc<dyn NotificationChannel>>,
    timeout: Duration,
    retries: u32,
    retry_backoff: Duration,
}

impl Notifier {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            channels: Vec::new(),
            timeout,
            retries,
            retry_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Deliver `event` to every channel. One report per channel, in channel order.
    pub async fn notify(&self, event: &AlarmEvent) -> Vec<DeliveryReport> {
        let deliveries = self
            .channels
            .iter()
            .map(|channel| self.deliver(channel.as_ref(), event));
        let reports = join_all(deliveries).await;

        let failed = reports.iter().filter(|r| !r.delivered).count();
        if failed > 0 {
            tracing::warn!(
                "Notifier: {} of {} channels failed for {}",
                failed,
                reports.len(),
                event.alarm_name
            );
        } else {
            tracing::debug!(
                "Notifier: {} delivered to {} channels",
                event.alarm_name,
                reports.len()
            );
        }

        reports
    }

    /// Delay before the retry following `attempt`, doubling up to [`MAX_RETRY_BACKOFF`].
    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff
            .checked_mul(factor)
            .unwrap_or(MAX_RETRY_BACKOFF)
            .min(MAX_RETRY_BACKOFF)
    }

    async fn deliver(&self, channel: &dyn NotificationChannel, event: &AlarmEvent) -> DeliveryReport {
        let mut attempt = 0;
        let mut last_error = None;

        while attempt <= self.retries {
            let result = match timeout(self.timeout, channel.send(event)).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Timeout(self.timeout)),
            };
            attempt += 1;

            match result {
                Ok(()) => {
                    return DeliveryReport {
                        channel: channel.name().to_string(),
                        delivered: true,
                        attempts: attempt,
                        error: None,
                    };
                }
                Err(e) => {
                    if attempt <= self.retries {
                        let backoff = self.backoff_for(attempt);
                        tracing::warn!(
                            "Notifier: {} failed for {} (attempt {}), retrying in {:?}: {}",
                            channel.name(),
                            event.alarm_name,
                            attempt,
                            backoff,
                            e
                        );
                        sleep(backoff).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.map(|e| e.to_string());
        tracing::error!(
            "Notifier: giving up on {} for {} after {} attempts: {}",
            channel.name(),
            event.alarm_name,
            attempt,
            error.as_deref().unwrap_or("unknown error")
        );

        DeliveryReport {
            channel: channel.name().to_string(),
            delivered: false,
            attempts: attempt,
            error,
        }
    }
}
