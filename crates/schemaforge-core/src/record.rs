//! The message envelope every sink consumes.
//!
//! ```json
//! {
//!   "objectKey": "k1",
//!   "objectType": "Order",
//!   "dataVersion": "2024-03-01T10:00:00Z",
//!   "eventType": "upsert",
//!   "region": "eu",
//!   "data": { "amount": "12", "items": [{ "sku": "A" }] }
//! }
//! ```
//!
//! The document written to sinks is `objectKey`, every other top-level
//! field outside the envelope, and the fields of `data`. A top-level field
//! wins over a `data` field of the same name.

use crate::errors::{IngestError, IngestResult};
use serde_json::{Map, Value};
use std::borrow::Cow;

pub const OBJECT_KEY_FIELD: &str = "objectKey";
pub const OBJECT_TYPE_FIELD: &str = "objectType";
pub const DATA_VERSION_FIELD: &str = "dataVersion";
pub const EVENT_TYPE_FIELD: &str = "eventType";
pub const DATA_FIELD: &str = "data";

/// Event type of partial updates. Such records never reach a sink.
pub const DELTA_EVENT_TYPE: &str = "delta";

const ENVELOPE_FIELDS: [&str; 3] =
    [OBJECT_TYPE_FIELD, DATA_VERSION_FIELD, EVENT_TYPE_FIELD];

/// `true` if `element` is a delta record. Checked before anything else
/// about the element is validated.
pub fn is_delta_element(element: &Value) -> bool {
    element
        .get(EVENT_TYPE_FIELD)
        .and_then(Value::as_str)
        .is_some_and(|t| t.eq_ignore_ascii_case(DELTA_EVENT_TYPE))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub object_key: String,
    pub object_type: String,
    pub data_version: String,
    pub event_type: Option<String>,
    document: Map<String, Value>,
}

impl Record {
    pub fn from_element(element: &Value) -> IngestResult<Self> {
        let Some(fields) = element.as_object() else {
            return Err(payload_error(format!(
                "record must be a JSON object, got {}",
                schema_sensing::json_kind(element)
            )));
        };

        let object_key = required_text(fields, OBJECT_KEY_FIELD)?;
        let object_type = required_text(fields, OBJECT_TYPE_FIELD)?;
        let data_version = required_text(fields, DATA_VERSION_FIELD)?;
        let event_type = fields
            .get(EVENT_TYPE_FIELD)
            .and_then(Value::as_str)
            .map(str::to_owned);

        let mut document = Map::new();
        for (name, value) in fields {
            if name == DATA_FIELD && value.is_object() {
                continue;
            }
            if ENVELOPE_FIELDS.contains(&name.as_str()) {
                continue;
            }
            document.insert(name.clone(), value.clone());
        }
        // objectKey may have been numeric; sinks key on its text form
        document.insert(
            OBJECT_KEY_FIELD.to_owned(),
            Value::String(object_key.clone()),
        );

        if let Some(Value::Object(data)) = fields.get(DATA_FIELD) {
            for (name, value) in data {
                let taken =
                    document.keys().any(|k| k.eq_ignore_ascii_case(name));
                if !taken {
                    document.insert(name.clone(), value.clone());
                }
            }
        }

        Ok(Self {
            object_key,
            object_type,
            data_version,
            event_type,
            document,
        })
    }

    pub fn is_delta(&self) -> bool {
        self.event_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(DELTA_EVENT_TYPE))
    }

    /// Candidate columns and nested values, in payload order.
    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    pub fn document_value(&self) -> Value {
        Value::Object(self.document.clone())
    }

    /// Single-level row for columnar sinks: scalars as text, nested values
    /// as their JSON text, nulls kept.
    pub fn flattened(&self) -> Map<String, Value> {
        self.document
            .iter()
            .map(|(name, value)| (name.clone(), flatten_value(value)))
            .collect()
    }
}

fn flatten_value(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(s.clone()),
        Value::Bool(_) | Value::Number(_) => Value::String(value.to_string()),
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
    }
}

fn required_text(fields: &Map<String, Value>, name: &str) -> IngestResult<String> {
    let text = match fields.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if text.trim().is_empty() {
        return Err(payload_error(format!("missing required field `{name}`")));
    }
    Ok(text)
}

fn payload_error(details: String) -> IngestError {
    IngestError::Payload {
        details: Cow::Owned(details),
    }
}
