//! Retention manager for cleaning up old metric history.

use crate::db::Store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Manager for deleting metric rows past the retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    retention: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let retention = self.retention;
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, retention, Utc::now());
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Delete everything older than `retention` relative to `now`. Returns rows removed.
pub fn process_retention(store: &Store, retention: Duration, now: DateTime<Utc>) -> usize {
    let cutoff = now - ChronoDuration::seconds(retention.as_secs() as i64);

    match store.delete_metric_rows_before(cutoff) {
        Ok(deleted) => {
            if deleted > 0 {
                tracing::info!("RetentionManager: deleted {} metric rows before {}", deleted, cutoff);
            }
            deleted
        }
        Err(e) => {
            tracing::error!("RetentionManager: Failed to delete metric rows: {}", e);
            0
        }
    }
}
