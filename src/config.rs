//! Configuration module for CanaryWatch.
//!
//! Server settings come from environment variables with sensible defaults.
//! The monitored URL map is read from a JSON file once at startup and turned
//! into an immutable [`MonitorConfig`] shared by every component.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::alarm::{AlarmDefinition, Comparison, MetricSelector};
use crate::metrics::MetricKind;

/// Configuration error types. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read URL file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("URL file must be a JSON object of name to URL strings: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("URL file contains no targets")]
    NoTargets,
    #[error("invalid name {0:?}: only letters, digits, '_', '-' and '.' are allowed")]
    InvalidName(String),
    #[error("invalid URL for {name}: {reason}")]
    InvalidUrl { name: String, reason: String },
    #[error("duplicate alarm name: {0}")]
    DuplicateAlarm(String),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Upper bound on extra delivery attempts per channel.
pub const MAX_NOTIFY_RETRIES: u32 = 10;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "canarywatch.db")
    pub db_path: String,
    /// Path to the URL map file (default: "urls.json")
    pub urls_path: String,
    /// Alarm record table. `None` when explicitly set to an empty string.
    pub table_name: Option<String>,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent_probes: usize,
    pub window: Duration,
    /// Number of windows without data before an alarm drops to INSUFFICIENT_DATA.
    pub grace_windows: u32,
    pub availability_threshold: f64,
    pub latency_threshold_ms: f64,
    /// Name the canary-level metrics and alarm are published under.
    pub canary_name: String,
    pub time_to_process_threshold_ms: f64,
    pub evaluation_periods: u32,
    pub notify_timeout: Duration,
    pub notify_retries: u32,
    pub webhook_url: Option<String>,
    pub retention: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "canarywatch.db".to_string(),
            urls_path: "urls.json".to_string(),
            table_name: Some("AlarmData".to_string()),
            probe_interval: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(10),
            max_concurrent_probes: 5,
            window: Duration::from_secs(300),
            grace_windows: 2,
            availability_threshold: 90.0,
            latency_threshold_ms: 3000.0,
            canary_name: "CanaryWatch".to_string(),
            time_to_process_threshold_ms: 10000.0,
            evaluation_periods: 1,
            notify_timeout: Duration::from_secs(10),
            notify_retries: 2,
            webhook_url: None,
            retention: Duration::from_secs(604_800),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `CANARYWATCH_*` environment variables.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("CANARYWATCH_HTTP_PORT") {
            cfg.http_port = port;
        }
        if let Ok(db_path) = env::var("CANARYWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(urls_path) = env::var("CANARYWATCH_URLS_FILE") {
            cfg.urls_path = urls_path;
        }
        if let Ok(table) = env::var("CANARYWATCH_TABLE_NAME") {
            cfg.table_name = Some(table).filter(|t| !t.trim().is_empty());
        }
        if let Some(secs) = parse_var("CANARYWATCH_PROBE_INTERVAL_SECS") {
            cfg.probe_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var("CANARYWATCH_PROBE_TIMEOUT_SECS") {
            cfg.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var("CANARYWATCH_MAX_CONCURRENT_PROBES") {
            cfg.max_concurrent_probes = n;
        }
        if let Some(secs) = parse_var("CANARYWATCH_WINDOW_SECS") {
            cfg.window = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var("CANARYWATCH_GRACE_WINDOWS") {
            cfg.grace_windows = n;
        }
        if let Some(v) = parse_var("CANARYWATCH_AVAILABILITY_THRESHOLD") {
            cfg.availability_threshold = v;
        }
        if let Some(v) = parse_var("CANARYWATCH_LATENCY_THRESHOLD_MS") {
            cfg.latency_threshold_ms = v;
        }
        if let Ok(name) = env::var("CANARYWATCH_CANARY_NAME") {
            cfg.canary_name = name.trim().to_string();
        }
        if let Some(v) = parse_var("CANARYWATCH_TIME_TO_PROCESS_THRESHOLD_MS") {
            cfg.time_to_process_threshold_ms = v;
        }
        if let Some(n) = parse_var("CANARYWATCH_EVALUATION_PERIODS") {
            cfg.evaluation_periods = n;
        }
        if let Some(secs) = parse_var("CANARYWATCH_NOTIFY_TIMEOUT_SECS") {
            cfg.notify_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var("CANARYWATCH_NOTIFY_RETRIES") {
            cfg.notify_retries = n;
        }
        if let Ok(url) = env::var("CANARYWATCH_WEBHOOK_URL") {
            cfg.webhook_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(secs) = parse_var("CANARYWATCH_RETENTION_SECS") {
            cfg.retention = Duration::from_secs(secs);
        }

        cfg
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_interval.is_zero() {
            return Err(ConfigError::Invalid("probe interval must be positive".into()));
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::Invalid("probe timeout must be positive".into()));
        }
        if self.window.as_secs() == 0 {
            return Err(ConfigError::Invalid("window must be at least one second".into()));
        }
        if self.max_concurrent_probes == 0 {
            return Err(ConfigError::Invalid("max concurrent probes must be positive".into()));
        }
        if self.evaluation_periods == 0 {
            return Err(ConfigError::Invalid("evaluation periods must be positive".into()));
        }
        if self.notify_retries > MAX_NOTIFY_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "notify retries must be at most {}",
                MAX_NOTIFY_RETRIES
            )));
        }
        if !url_name_pattern().is_match(&self.canary_name) {
            return Err(ConfigError::InvalidName(self.canary_name.clone()));
        }
        Ok(())
    }

    /// Time without data after which alarms report INSUFFICIENT_DATA.
    pub fn grace_period(&self) -> Duration {
        self.window * self.grace_windows.max(1)
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}, using default", name, raw);
            None
        }
    }
}

/// A monitored URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub name: String,
    pub url: String,
}

/// Immutable monitoring configuration built once at startup.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorConfig {
    pub canary_name: String,
    pub targets: Vec<Target>,
    pub alarms: Vec<AlarmDefinition>,
}

impl MonitorConfig {
    /// Read the URL map file and build the monitor configuration.
    pub fn load(path: impl AsRef<Path>, server: &ServerConfig) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw, server)
    }

    /// Build from the JSON text of a `{ "<urlName>": "<url>" }` map.
    pub fn from_json(raw: &str, server: &ServerConfig) -> Result<Self, ConfigError> {
        let urls: BTreeMap<String, String> = serde_json::from_str(raw)?;
        let targets = parse_targets(urls)?;

        let mut alarms = Vec::with_capacity(targets.len() * 2 + 1);
        for target in &targets {
            alarms.push(AlarmDefinition {
                name: format!("{}AvailabilityAlarm", target.name),
                description: format!("Availability Alarm for {}", target.name),
                selector: MetricSelector {
                    url_name: target.name.clone(),
                    kind: MetricKind::Availability,
                },
                threshold: server.availability_threshold,
                comparison: Comparison::LessThan,
                evaluation_periods: server.evaluation_periods,
            });
            alarms.push(AlarmDefinition {
                name: format!("{}LatencyAlarm", target.name),
                description: format!("Latency Alarm for {}", target.name),
                selector: MetricSelector {
                    url_name: target.name.clone(),
                    kind: MetricKind::Latency,
                },
                threshold: server.latency_threshold_ms,
                comparison: Comparison::GreaterThan,
                evaluation_periods: server.evaluation_periods,
            });
        }

        alarms.push(AlarmDefinition {
            name: "TimeToProcessAlarm".to_string(),
            description: format!("TimeToProcess Alarm for {}", server.canary_name),
            selector: MetricSelector {
                url_name: server.canary_name.clone(),
                kind: MetricKind::TimeToProcess,
            },
            threshold: server.time_to_process_threshold_ms,
            comparison: Comparison::GreaterThan,
            evaluation_periods: server.evaluation_periods,
        });

        Self::new(server.canary_name.clone(), targets, alarms)
    }

    /// Assemble a configuration, checking alarm names are unique.
    pub fn new(
        canary_name: String,
        targets: Vec<Target>,
        alarms: Vec<AlarmDefinition>,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for alarm in &alarms {
            if alarm.evaluation_periods == 0 {
                return Err(ConfigError::Invalid(format!(
                    "alarm {} needs at least one evaluation period",
                    alarm.name
                )));
            }
            if !seen.insert(alarm.name.as_str()) {
                return Err(ConfigError::DuplicateAlarm(alarm.name.clone()));
            }
        }
        Ok(Self {
            canary_name,
            targets,
            alarms,
        })
    }
}

fn url_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap())
}

fn parse_targets(urls: BTreeMap<String, String>) -> Result<Vec<Target>, ConfigError> {
    if urls.is_empty() {
        return Err(ConfigError::NoTargets);
    }

    urls.into_iter()
        .map(|(name, url)| {
            if !url_name_pattern().is_match(&name) {
                return Err(ConfigError::InvalidName(name));
            }
            let parsed = reqwest::Url::parse(&url).map_err(|e| ConfigError::InvalidUrl {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidUrl {
                    name,
                    reason: format!("unsupported scheme {}", parsed.scheme()),
                });
            }
            Ok(Target { name, url })
        })
        .collect()
}
