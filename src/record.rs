//! Turning device lines into timestamped records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Error;

/// What to do with lines which are not valid records.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordPolicy {
    /// Log and drop them.
    #[default]
    DropMalformed,

    /// Forward them as raw text.
    KeepRaw,
}

/// The contents of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// A JSON object with at least one numeric field.
    Structured(Map<String, Value>),

    /// A line which did not parse, kept as-is.
    Raw(String),
}

/// A reading from the device, stamped when it was formatted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRecord {
    timestamp: i64,
    payload: Payload,
}

impl OutboundRecord {
    /// Seconds since the Unix epoch at formatting time.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The record contents.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Look up a top level field of a structured payload.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match &self.payload {
            Payload::Structured(fields) => fields.get(key),
            Payload::Raw(_) => None,
        }
    }
}

/// Turns lines into [`OutboundRecord`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordFormatter {
    policy: RecordPolicy,
}

impl RecordFormatter {
    /// A formatter applying the given policy to malformed lines.
    pub fn new(policy: RecordPolicy) -> Self {
        Self { policy }
    }

    /// Format a line, or `None` if it should not be forwarded.
    pub fn format(&self, line: &str) -> Option<OutboundRecord> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let payload = match Self::parse(line) {
            Ok(fields) => Payload::Structured(fields),
            Err(e) => match self.policy {
                RecordPolicy::DropMalformed => {
                    debug!(%e, "Dropping line");
                    return None;
                }
                RecordPolicy::KeepRaw => Payload::Raw(line.to_owned()),
            },
        };

        Some(OutboundRecord {
            timestamp: chrono::Utc::now().timestamp(),
            payload,
        })
    }

    /// Parse a line as a JSON object holding at least one number.
    pub fn parse(line: &str) -> Result<Map<String, Value>, Error> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| Error::MalformedRecord(format!("`{line}` is not JSON: {e}")))?;

        let Value::Object(fields) = value else {
            return Err(Error::MalformedRecord(format!(
                "`{line}` is not a JSON object"
            )));
        };

        if !fields.values().any(Value::is_number) {
            return Err(Error::MalformedRecord(format!(
                "`{line}` has no numeric fields"
            )));
        }

        Ok(fields)
    }
}
