//! Alarm store: persists alarm notifications as one record per alarm name.
//!
//! This sits at the edge of the pipeline. Every failure is reported through
//! a [`ProcessorResponse`] instead of being returned as an error.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;

use super::models::{AlarmRecord, NotificationBatch};
use super::store::{checked_table, DbError, Store};

/// Reasons a batch could not be stored.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("TABLE_NAME is not set")]
    MissingTable,
    #[error("invalid table configuration: {0}")]
    InvalidTable(String),
    #[error("No input records found")]
    NoInput,
    #[error("Message is not in JSON format")]
    Unparseable {
        original_message: String,
        error: String,
    },
    #[error("Message is missing required field AlarmName")]
    MissingAlarmName { original_message: String },
    #[error("Error saving alarm data")]
    Write(#[source] DbError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Success,
    Error,
}

/// Discriminated result returned to whoever invoked the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorResponse {
    pub status: Status,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message: Option<String>,
}

impl ProcessorResponse {
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

impl From<ProcessorError> for ProcessorResponse {
    fn from(err: ProcessorError) -> Self {
        let message = err.to_string();
        let (error, original_message) = match err {
            ProcessorError::Unparseable {
                original_message,
                error,
            } => (Some(error), Some(original_message)),
            ProcessorError::MissingAlarmName { original_message } => (None, Some(original_message)),
            ProcessorError::InvalidTable(detail) => (Some(detail), None),
            ProcessorError::Write(e) => (Some(e.to_string()), None),
            ProcessorError::MissingTable | ProcessorError::NoInput => (None, None),
        };

        Self {
            status: Status::Error,
            message,
            result: None,
            error,
            original_message,
        }
    }
}

/// Upserts the latest alarm notification per alarm name.
pub struct AlarmStore {
    store: Arc<Store>,
    table: Option<String>,
}

impl AlarmStore {
    pub fn new(store: Arc<Store>, table: Option<String>) -> Self {
        Self { store, table }
    }

    /// Store every record of the batch in order.
    ///
    /// Processing stops at the first failing record. Records before it stay
    /// written; replaying the batch is safe because writes are upserts.
    pub fn process(&self, batch: &NotificationBatch) -> ProcessorResponse {
        tracing::debug!("AlarmStore: received batch with {} records", batch.records.len());

        match self.try_process(batch) {
            Ok(names) => {
                tracing::info!("AlarmStore: saved {} alarm records", names.len());
                ProcessorResponse {
                    status: Status::Success,
                    message: "Alarm data saved successfully".to_string(),
                    result: Some(json!({ "records": names.len(), "alarmNames": names })),
                    error: None,
                    original_message: None,
                }
            }
            Err(e) => {
                tracing::error!("AlarmStore: {}", error_detail(&e));
                e.into()
            }
        }
    }

    /// Parse a raw request body as a batch envelope and store it.
    ///
    /// A body that is not a valid envelope is reported as an Error response
    /// carrying the raw payload.
    pub fn process_payload(&self, payload: &str) -> ProcessorResponse {
        match serde_json::from_str::<NotificationBatch>(payload) {
            Ok(batch) => self.process(&batch),
            Err(e) => {
                let err = ProcessorError::Unparseable {
                    original_message: payload.to_string(),
                    error: e.to_string(),
                };
                tracing::error!("AlarmStore: {}", error_detail(&err));
                err.into()
            }
        }
    }

    fn try_process(&self, batch: &NotificationBatch) -> Result<Vec<String>, ProcessorError> {
        let table = self.table()?;

        if batch.records.is_empty() {
            return Err(ProcessorError::NoInput);
        }

        self.store
            .ensure_alarm_table(table)
            .map_err(ProcessorError::Write)?;

        let mut names = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            let alarm = parse_record(&record.message)?;
            self.store
                .upsert_alarm_record(table, &alarm)
                .map_err(ProcessorError::Write)?;
            names.push(alarm.alarm_name);
        }

        Ok(names)
    }

    fn table(&self) -> Result<&str, ProcessorError> {
        let table = self
            .table
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ProcessorError::MissingTable)?;
        checked_table(table).map_err(|e| ProcessorError::InvalidTable(e.to_string()))
    }

    /// Look up the record for one alarm. `Ok(None)` if it was never stored.
    pub fn get(&self, alarm_name: &str) -> Result<Option<AlarmRecord>, ProcessorError> {
        let table = self.table()?;
        self.store
            .ensure_alarm_table(table)
            .map_err(ProcessorError::Write)?;
        self.store
            .get_alarm_record(table, alarm_name)
            .map_err(ProcessorError::Write)
    }

    pub fn list(&self) -> Result<Vec<AlarmRecord>, ProcessorError> {
        let table = self.table()?;
        self.store
            .ensure_alarm_table(table)
            .map_err(ProcessorError::Write)?;
        self.store
            .list_alarm_records(table)
            .map_err(ProcessorError::Write)
    }
}

fn error_detail(err: &ProcessorError) -> String {
    match err {
        ProcessorError::Unparseable {
            original_message,
            error,
        } => format!("{}: {} (payload: {:?})", err, error, original_message),
        ProcessorError::MissingAlarmName { original_message } => {
            format!("{} (payload: {:?})", err, original_message)
        }
        ProcessorError::Write(e) => format!("{}: {}", err, e),
        other => other.to_string(),
    }
}

/// Parse one serialized notification into the record to store.
fn parse_record(message: &str) -> Result<AlarmRecord, ProcessorError> {
    let fields: Map<String, Value> = match serde_json::from_str::<Value>(message) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => {
            return Err(ProcessorError::Unparseable {
                original_message: message.to_string(),
                error: format!("expected a JSON object, got {}", json_type(&other)),
            });
        }
        Err(e) => {
            return Err(ProcessorError::Unparseable {
                original_message: message.to_string(),
                error: e.to_string(),
            });
        }
    };

    let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);

    let alarm_name = text("AlarmName")
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| ProcessorError::MissingAlarmName {
            original_message: message.to_string(),
        })?;

    Ok(AlarmRecord {
        alarm_name,
        state_change: text("NewStateValue"),
        reason: text("NewStateReason"),
        timestamp: text("StateChangeTime"),
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
