//! Error envelopes: the record a component emits on its `err_` port when
//! processing an item fails.
//!
//! The wire shape is fixed:
//!
//! ```json
//! {"ts": "...", "system": "...", "component": "...", "port": "in_items",
//!  "input_offset": 42, "category": "validation", "message": "...",
//!  "payload": {...}, "trace_id": "..."}
//! ```

use crate::error::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Record emitted on an `err_` port for every per-item failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
  /// When the failure happened.
  pub ts: DateTime<Utc>,
  /// System the component belongs to.
  pub system: String,
  /// Component that failed.
  pub component: String,
  /// Port the failing item came from (or was headed to).
  pub port: Option<String>,
  /// Sequence number of the failing item on its input port.
  pub input_offset: Option<u64>,
  /// Failure classification.
  pub category: ErrorCategory,
  /// Human readable message.
  pub message: String,
  /// The item that failed, verbatim.
  pub payload: Value,
  /// Correlation id. Reuses the payload's `trace_id` field when present.
  pub trace_id: String,
}

impl ErrorEnvelope {
  /// Builds an envelope stamped with the current time.
  pub fn new(
    system: impl Into<String>,
    component: impl Into<String>,
    category: ErrorCategory,
    message: impl Into<String>,
    payload: Value,
  ) -> Self {
    let trace_id = payload
      .get("trace_id")
      .and_then(Value::as_str)
      .map(str::to_string)
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    Self {
      ts: Utc::now(),
      system: system.into(),
      component: component.into(),
      port: None,
      input_offset: None,
      category,
      message: message.into(),
      payload,
      trace_id,
    }
  }

  /// Sets the originating port.
  pub fn with_port(mut self, port: impl Into<String>) -> Self {
    self.port = Some(port.into());
    self
  }

  /// Sets the input offset.
  pub fn with_offset(mut self, offset: Option<u64>) -> Self {
    self.input_offset = offset;
    self
  }

  /// JSON form sent over an `err_` port.
  pub fn to_value(&self) -> Value {
    // Every field is a plain JSON type.
    serde_json::to_value(self).unwrap_or(Value::Null)
  }

  /// Parses an envelope received from an `err_` port.
  pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
    serde_json::from_value(value)
  }

  /// JSON Schema every `err_` port validates against.
  pub fn schema() -> Value {
    json!({
      "type": "object",
      "required": ["ts", "system", "component", "category", "message", "payload", "trace_id"],
      "properties": {
        "ts": {"type": "string"},
        "system": {"type": "string"},
        "component": {"type": "string"},
        "port": {"type": ["string", "null"]},
        "input_offset": {"type": ["integer", "null"], "minimum": 0},
        "category": {"enum": ["validation", "runtime", "io"]},
        "message": {"type": "string"},
        "trace_id": {"type": "string"}
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn wire_shape_has_fixed_keys() {
    let envelope = ErrorEnvelope::new(
      "sys",
      "parser",
      ErrorCategory::Validation,
      "bad item",
      json!({"id": 7}),
    )
    .with_port("in_items")
    .with_offset(Some(7));

    let value = envelope.to_value();
    let object = value.as_object().unwrap();
    let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(
      keys,
      vec![
        "category",
        "component",
        "input_offset",
        "message",
        "payload",
        "port",
        "system",
        "trace_id",
        "ts"
      ]
    );
    assert_eq!(value["category"], "validation");
    assert_eq!(value["input_offset"], 7);
  }

  #[test]
  fn reuses_payload_trace_id() {
    let envelope = ErrorEnvelope::new(
      "sys",
      "c",
      ErrorCategory::Runtime,
      "boom",
      json!({"trace_id": "abc-123"}),
    );
    assert_eq!(envelope.trace_id, "abc-123");
  }

  #[test]
  fn envelope_satisfies_its_own_schema() {
    let schema = jsonschema::JSONSchema::compile(&ErrorEnvelope::schema()).unwrap();
    let envelope = ErrorEnvelope::new("sys", "c", ErrorCategory::Io, "disk", Value::Null);
    assert!(schema.is_valid(&envelope.to_value()));
  }
}
