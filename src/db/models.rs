//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Latest state change persisted for one alarm name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AlarmRecord {
    pub alarm_name: String,
    pub state_change: Option<String>,
    pub reason: Option<String>,
    pub timestamp: Option<String>,
}

/// One persisted metric value for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub namespace: String,
    pub metric_name: String,
    pub url_name: String,
    /// Always `{"URL": url_name}`.
    pub dimensions: BTreeMap<String, String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub value: f64,
    pub sample_count: u32,
}

/// Input envelope for the alarm store: `{"Records": [{"Message": "..."}]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationBatch {
    #[serde(rename = "Records", default)]
    pub records: Vec<NotificationRecord>,
}

/// One record of the batch. Accepts `{"Message": ...}` or the SNS-delivered
/// `{"Sns": {"Message": ...}}` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawNotificationRecord")]
pub struct NotificationRecord {
    /// Serialized alarm notification, normally JSON.
    #[serde(rename = "Message")]
    pub message: String,
}

#[derive(Deserialize)]
struct RawNotificationRecord {
    #[serde(rename = "Message")]
    message: Option<String>,
    #[serde(rename = "Sns")]
    sns: Option<SnsEnvelope>,
}

#[derive(Deserialize)]
struct SnsEnvelope {
    #[serde(rename = "Message")]
    message: String,
}

impl TryFrom<RawNotificationRecord> for NotificationRecord {
    type Error = String;

    fn try_from(raw: RawNotificationRecord) -> Result<Self, Self::Error> {
        raw.message
            .or(raw.sns.map(|sns| sns.message))
            .map(|message| Self { message })
            .ok_or_else(|| "record has neither Message nor Sns.Message".to_string())
    }
}

impl NotificationBatch {
    pub fn single(message: impl Into<String>) -> Self {
        Self {
            records: vec![NotificationRecord {
                message: message.into(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_shapes() {
        let direct: NotificationBatch =
            serde_json::from_str(r#"{"Records":[{"Message":"{\"AlarmName\":\"X\"}"}]}"#).unwrap();
        assert_eq!(direct.records[0].message, r#"{"AlarmName":"X"}"#);

        let sns: NotificationBatch =
            serde_json::from_str(r#"{"Records":[{"Sns":{"Message":"{\"AlarmName\":\"Y\"}"}}]}"#)
                .unwrap();
        assert_eq!(sns.records[0].message, r#"{"AlarmName":"Y"}"#);

        assert!(serde_json::from_str::<NotificationBatch>(r#"{"Records":[{}]}"#).is_err());
    }
}
