//! CanaryWatch - Synthetic Availability and Latency Monitoring
//!
//! Probes a fixed set of URLs, rolls the results into windowed metrics,
//! evaluates threshold alarms and records every state change.

mod alarm;
mod config;
mod db;
mod metrics;
mod notify;
mod probe;
mod scheduler;
mod web;

use config::{MonitorConfig, ServerConfig};
use db::{AlarmStore, Store};
use notify::{LogChannel, Notifier, StoreChannel, WebhookChannel};
use probe::Prober;
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("canarywatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    cfg.validate()?;
    tracing::info!("Starting CanaryWatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let monitor = match MonitorConfig::load(&cfg.urls_path, &cfg) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            tracing::error!("Failed to load URL map from {}: {}", cfg.urls_path, e);
            return Err(e.into());
        }
    };
    for target in &monitor.targets {
        tracing::info!("Monitoring {} at {}", target.name, target.url);
    }
    tracing::info!("Canary-level metrics published as {}", monitor.canary_name);

    if cfg.table_name.is_none() {
        tracing::warn!("CANARYWATCH_TABLE_NAME is empty, alarm records will not be saved");
    }

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let alarms = Arc::new(AlarmStore::new(store.clone(), cfg.table_name.clone()));

    // Notification channels
    let mut notifier = Notifier::new(cfg.notify_timeout, cfg.notify_retries)
        .with_channel(Arc::new(LogChannel))
        .with_channel(Arc::new(StoreChannel::new(alarms.clone())));
    if let Some(url) = &cfg.webhook_url {
        notifier = notifier.with_channel(Arc::new(WebhookChannel::new(url, cfg.notify_timeout)?));
    }
    tracing::info!("Notification channels: {}", notifier.channel_names().join(", "));

    let prober = Prober::new(cfg.probe_timeout, cfg.max_concurrent_probes)?
        .with_cycle_deadline(cfg.probe_interval);
    tracing::info!(
        "Probing every {}s with a {}s timeout",
        cfg.probe_interval.as_secs(),
        prober.timeout().as_secs()
    );

    // Start scheduler
    let scheduler = Scheduler::new(
        monitor.clone(),
        cfg.clone(),
        prober,
        store.clone(),
        Arc::new(notifier),
    );
    scheduler.start();

    // Start web server
    let server = Server::new(cfg, monitor, store, alarms);
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down...");
        })
        .await?;

    scheduler.stop().await;

    Ok(())
}
