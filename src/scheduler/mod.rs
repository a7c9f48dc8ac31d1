//! Scheduler module wiring probes, aggregation, alarms and notifications.

mod retention;

pub use retention::*;

use crate::alarm::{AlarmEvaluator, AlarmEvent};
use crate::config::{MonitorConfig, ServerConfig};
use crate::db::Store;
use crate::metrics::{Aggregator, CyclePoint, MetricPoint};
use crate::notify::Notifier;
use crate::probe::{ProbeCycle, ProbeSample, Prober};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// How often open windows are checked for closing.
const CLOSE_INTERVAL: Duration = Duration::from_secs(10);

/// Extra delay past the probe timeout before a window is considered complete.
const COMMIT_DELAY_SECS: i64 = 3;

/// Single owner of the aggregator and evaluator state.
///
/// Points and events pass through it strictly in order, so no locking is needed.
pub struct Pipeline {
    aggregator: Aggregator,
    evaluator: AlarmEvaluator,
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    settle: ChronoDuration,
    canary_name: String,
}

impl Pipeline {
    pub fn new(
        monitor: &MonitorConfig,
        server: &ServerConfig,
        store: Arc<Store>,
        notifier: Arc<Notifier>,
        now: DateTime<Utc>,
    ) -> Self {
        let settle = ChronoDuration::milliseconds(server.probe_timeout.as_millis() as i64)
            + ChronoDuration::seconds(COMMIT_DELAY_SECS);

        let evaluator =
            AlarmEvaluator::new(&monitor.alarms, server.grace_period(), now).with_settle(settle);
        tracing::debug!(
            "Pipeline: evaluating {} alarms over {}s windows",
            evaluator.definitions().len(),
            server.window.as_secs()
        );

        Self {
            aggregator: Aggregator::new(server.window),
            evaluator,
            store,
            notifier,
            settle,
            canary_name: monitor.canary_name.clone(),
        }
    }

    pub fn ingest(&mut self, sample: &ProbeSample) {
        self.aggregator.ingest(sample);
    }

    /// Ingest every sample of a cycle plus the cycle's own duration.
    pub fn ingest_cycle(&mut self, cycle: &ProbeCycle) {
        for sample in &cycle.samples {
            self.aggregator.ingest(sample);
        }
        self.aggregator.ingest_cycle(cycle.started_at, cycle.duration_ms);
    }

    pub fn evaluator(&self) -> &AlarmEvaluator {
        &self.evaluator
    }

    /// Close finished windows, persist them, evaluate alarms and notify.
    ///
    /// Returns the events emitted, in the order they were dispatched.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<AlarmEvent> {
        // Don't close windows whose probes may still be in flight
        let cutoff = now - self.settle;
        let points = self.aggregator.close_windows(cutoff);
        let cycles = self.aggregator.close_cycle_windows(cutoff);
        self.persist(&points, &cycles);
        tracing::debug!(
            "Pipeline: closed {} windows, {} open, {} late samples dropped",
            points.len() + cycles.len(),
            self.aggregator.open_windows(),
            self.aggregator.late_samples()
        );

        let mut events = Vec::new();
        for point in &points {
            events.extend(self.evaluator.evaluate(point, now));
        }
        for cycle in &cycles {
            events.extend(self.evaluator.evaluate_cycle(cycle, now));
        }
        events.extend(self.evaluator.check_missing(now));

        for event in &events {
            self.notifier.notify(event).await;
        }

        events
    }

    fn persist(&self, points: &[MetricPoint], cycles: &[CyclePoint]) {
        if !points.is_empty() {
            match self.store.add_metric_points(points) {
                Ok(()) => tracing::debug!("Pipeline: saved {} metric points", points.len()),
                Err(e) => tracing::error!("Pipeline: failed to save metric points: {}", e),
            }
        }
        if !cycles.is_empty() {
            if let Err(e) = self.store.add_cycle_points(&self.canary_name, cycles) {
                tracing::error!("Pipeline: failed to save cycle durations: {}", e);
            }
        }
    }
}

/// Runs the probe loop and the processing loop as background tasks.
pub struct Scheduler {
    monitor: Arc<MonitorConfig>,
    server: ServerConfig,
    prober: Prober,
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    retention_manager: Arc<RetentionManager>,
    stop_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(
        monitor: Arc<MonitorConfig>,
        server: ServerConfig,
        prober: Prober,
        store: Arc<Store>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let retention_manager = Arc::new(RetentionManager::new(store.clone(), server.retention));
        let (stop_tx, _) = broadcast::channel(1);

        Self {
            monitor,
            server,
            prober,
            store,
            notifier,
            retention_manager,
            stop_tx,
        }
    }

    /// Start probing all targets and processing their samples.
    pub fn start(&self) {
        tracing::info!(
            "Starting scheduler with {} targets and {} alarms",
            self.monitor.targets.len(),
            self.monitor.alarms.len()
        );

        let (tx, rx) = mpsc::channel(100);

        let pipeline = Pipeline::new(
            &self.monitor,
            &self.server,
            self.store.clone(),
            self.notifier.clone(),
            Utc::now(),
        );
        tokio::spawn(run_pipeline(pipeline, rx));

        tokio::spawn(run_probe_loop(
            self.monitor.clone(),
            self.prober.clone(),
            self.server.probe_interval,
            tx,
            self.stop_tx.subscribe(),
        ));

        self.retention_manager.start();
    }

    /// Stop probing. The pipeline flushes closable windows once in-flight cycles finish.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(());
        self.retention_manager.stop().await;
        tracing::info!("Scheduler stopped");
    }
}

/// Fire one probe cycle per interval. Each cycle runs in its own task, so a
/// cycle overrunning the interval never delays the next one.
async fn run_probe_loop(
    monitor: Arc<MonitorConfig>,
    prober: Prober,
    period: Duration,
    tx: mpsc::Sender<ProbeCycle>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {}
        }

        let monitor = monitor.clone();
        let prober = prober.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let cycle = prober.run_cycle(&monitor.targets).await;
            if tx.send(cycle).await.is_err() {
                tracing::error!("Pipeline stopped, dropping probe samples");
            }
        });
    }
}

/// Feed samples into the pipeline and close windows on a fixed tick.
async fn run_pipeline(mut pipeline: Pipeline, mut rx: mpsc::Receiver<ProbeCycle>) {
    let mut interval = tokio::time::interval(CLOSE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cycle = rx.recv() => {
                match cycle {
                    Some(c) => pipeline.ingest_cycle(&c),
                    None => {
                        pipeline.tick(Utc::now()).await;
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                pipeline.tick(Utc::now()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmStateValue;
    use crate::db::AlarmStore;
    use crate::notify::StoreChannel;
    use crate::probe::ProbeErrorKind;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn setup(
        tmp: &NamedTempFile,
        urls: &str,
    ) -> (MonitorConfig, ServerConfig, Arc<Store>, Arc<AlarmStore>, Arc<Notifier>) {
        let server = ServerConfig {
            probe_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let monitor = MonitorConfig::from_json(urls, &server).unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let alarms = Arc::new(AlarmStore::new(store.clone(), server.table_name.clone()));
        let notifier = Arc::new(
            Notifier::new(Duration::from_secs(2), 0)
                .with_channel(Arc::new(StoreChannel::new(alarms.clone()))),
        );
        (monitor, server, store, alarms, notifier)
    }

    #[tokio::test]
    async fn test_failing_url_raises_availability_alarm() {
        let server_mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server_mock)
            .await;

        let tmp = NamedTempFile::new().unwrap();
        let urls = format!(r#"{{"site": "{}"}}"#, server_mock.uri());
        let (monitor, server, store, alarms, notifier) = setup(&tmp, &urls);

        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut pipeline = Pipeline::new(&monitor, &server, store.clone(), notifier, t0);
        let prober = Prober::new(server.probe_timeout, 5).unwrap().without_jitter();

        // Three consecutive failing probes inside one window
        for cycle in 0..3 {
            let mut samples = prober.run_cycle(&monitor.targets).await.samples;
            assert_eq!(samples.len(), 1);
            assert!(!samples[0].success);
            samples[0].timestamp = t0 + ChronoDuration::seconds(60 * cycle);
            pipeline.ingest(&samples[0]);
        }

        // Window [12:00, 12:05) is closed once the settle delay has passed
        assert!(pipeline.tick(t0 + ChronoDuration::minutes(5)).await.is_empty());
        let events = pipeline
            .tick(t0 + ChronoDuration::minutes(5) + ChronoDuration::seconds(5))
            .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].alarm_name, "siteAvailabilityAlarm");
        assert_eq!(events[0].new_state, AlarmStateValue::Alarm);
        assert!(events[0].reason.contains("LESS_THAN"));
        assert!(events[0].reason.contains("90"));

        let rows = store
            .get_metric_rows("site", t0, t0 + ChronoDuration::hours(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metric_name, "site_Availability");
        assert_eq!(rows[0].value, 0.0);

        // The store channel persisted the event
        let record = alarms.get("siteAvailabilityAlarm").unwrap().unwrap();
        assert_eq!(record.state_change.as_deref(), Some("ALARM"));

        // No data for the latency alarm: all probes failed
        let latency = pipeline.evaluator().state("siteLatencyAlarm").unwrap();
        assert_eq!(latency.current_state, AlarmStateValue::InsufficientData);
    }

    #[tokio::test]
    async fn test_recovery_and_missing_data() {
        let tmp = NamedTempFile::new().unwrap();
        let (monitor, server, store, alarms, notifier) =
            setup(&tmp, r#"{"site": "https://site.example.com"}"#);

        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut pipeline = Pipeline::new(&monitor, &server, store, notifier, t0);
        let target = &monitor.targets[0];

        pipeline.ingest(&ProbeSample::succeeded(target, t0 + ChronoDuration::seconds(30), 120.0));
        let events = pipeline.tick(t0 + ChronoDuration::minutes(6)).await;
        let states: Vec<_> = events.iter().map(|e| (e.alarm_name.as_str(), e.new_state)).collect();
        assert_eq!(
            states,
            vec![
                ("siteAvailabilityAlarm", AlarmStateValue::Ok),
                ("siteLatencyAlarm", AlarmStateValue::Ok),
            ]
        );

        // Silence well past the grace period
        let events = pipeline.tick(t0 + ChronoDuration::minutes(30)).await;
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.new_state == AlarmStateValue::InsufficientData));

        let record = alarms.get("siteLatencyAlarm").unwrap().unwrap();
        assert_eq!(record.state_change.as_deref(), Some("INSUFFICIENT_DATA"));
    }

    #[tokio::test]
    async fn test_debounce_survives_close_delay_with_one_grace_window() {
        let tmp = NamedTempFile::new().unwrap();
        let server = ServerConfig {
            grace_windows: 1,
            evaluation_periods: 2,
            ..Default::default()
        };
        let monitor =
            MonitorConfig::from_json(r#"{"site": "https://site.example.com"}"#, &server).unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let notifier = Arc::new(Notifier::new(Duration::from_secs(1), 0));

        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut pipeline = Pipeline::new(&monitor, &server, store, notifier, t0);
        let target = monitor.targets[0].clone();

        // A failing probe every 120 s, close ticks every 10 s, for 30 minutes
        let mut events = Vec::new();
        for step in 0..180 {
            let now = t0 + ChronoDuration::seconds(10 * step);
            if step % 12 == 0 {
                pipeline.ingest(&ProbeSample::failed(&target, now, ProbeErrorKind::HttpStatus(500)));
            }
            events.extend(pipeline.tick(now).await);
        }

        let availability: Vec<_> = events
            .iter()
            .filter(|e| e.alarm_name == "siteAvailabilityAlarm")
            .map(|e| e.new_state)
            .collect();
        assert_eq!(availability, vec![AlarmStateValue::Alarm]);
    }
}
