//! Alarm definitions, state and state-change events.

mod evaluator;

pub use evaluator::*;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::metrics::MetricKind;

/// Threshold comparison. The metric is on the left: `metric < threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Comparison {
    LessThan,
    GreaterThan,
}

impl Comparison {
    pub fn breaches(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::LessThan => value < threshold,
            Comparison::GreaterThan => value > threshold,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::LessThan => "LESS_THAN",
            Comparison::GreaterThan => "GREATER_THAN",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which URL and which metric of it an alarm watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSelector {
    pub url_name: String,
    pub kind: MetricKind,
}

/// Static alarm configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmDefinition {
    pub name: String,
    pub description: String,
    pub selector: MetricSelector,
    pub threshold: f64,
    pub comparison: Comparison,
    /// Consecutive breaching windows required before ALARM.
    pub evaluation_periods: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmStateValue {
    Ok,
    Alarm,
    InsufficientData,
}

impl AlarmStateValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmStateValue::Ok => "OK",
            AlarmStateValue::Alarm => "ALARM",
            AlarmStateValue::InsufficientData => "INSUFFICIENT_DATA",
        }
    }
}

impl fmt::Display for AlarmStateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted on every alarm state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmEvent {
    pub alarm_name: String,
    pub old_state: AlarmStateValue,
    pub new_state: AlarmStateValue,
    pub reason: String,
    pub state_change_time: DateTime<Utc>,
}

/// Wire payload handed to notification channels and the alarm store.
///
/// Field names follow the managed alarm-change message so existing
/// consumers can read it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AlarmNotification {
    pub alarm_name: String,
    pub new_state_value: String,
    pub new_state_reason: String,
    pub state_change_time: String,
    pub old_state_value: String,
}

impl From<&AlarmEvent> for AlarmNotification {
    fn from(event: &AlarmEvent) -> Self {
        Self {
            alarm_name: event.alarm_name.clone(),
            new_state_value: event.new_state.to_string(),
            new_state_reason: event.reason.clone(),
            state_change_time: event
                .state_change_time
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            old_state_value: event.old_state.to_string(),
        }
    }
}
