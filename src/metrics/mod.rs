//! Windowed availability and latency metrics.

mod aggregator;

pub use aggregator::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace every metric is published under.
pub const METRIC_NAMESPACE: &str = "CloudWatchSynthetics";

/// Dimension key carrying the URL name.
pub const URL_DIMENSION: &str = "URL";

/// Dimension key carrying the canary name on canary-level metrics.
pub const CANARY_DIMENSION: &str = "CanaryName";

/// Which value of a [`MetricPoint`] a selector reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    Availability,
    Latency,
    /// Wall-clock duration of a whole probe cycle. Canary-level, not per URL.
    TimeToProcess,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Availability => "Availability",
            MetricKind::Latency => "Latency",
            MetricKind::TimeToProcess => "TimeToProcess",
        }
    }
}

/// `<urlName>_Availability` / `<urlName>_Latency`.
pub fn metric_name(url_name: &str, kind: MetricKind) -> String {
    format!("{}_{}", url_name, kind.as_str())
}

/// Aggregated signal for one URL over one window `[window_start, window_end)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub url_name: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// 0-100
    pub availability_pct: f64,
    /// Mean latency of the successful samples; `None` when nothing succeeded.
    pub avg_latency_ms: Option<f64>,
    pub sample_count: u32,
}

impl MetricPoint {
    /// The value an alarm on `kind` compares, if the window has one.
    pub fn value(&self, kind: MetricKind) -> Option<f64> {
        match kind {
            MetricKind::Availability => Some(self.availability_pct),
            MetricKind::Latency => self.avg_latency_ms,
            MetricKind::TimeToProcess => None,
        }
    }
}

/// Mean probe cycle duration over one window `[window_start, window_end)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CyclePoint {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub avg_duration_ms: f64,
    pub cycle_count: u32,
}

impl CyclePoint {
    pub fn value(&self, kind: MetricKind) -> Option<f64> {
        match kind {
            MetricKind::TimeToProcess => Some(self.avg_duration_ms),
            _ => None,
        }
    }
}
