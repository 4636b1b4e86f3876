//! Structural validators attached to ports.

use jsonschema::JSONSchema;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Structural validator for values crossing a port.
///
/// `Any` accepts everything; `Json` is a compiled JSON Schema document. The
/// source document is kept so wiring can compare two schemas.
#[derive(Clone, Default)]
pub enum PortSchema {
  /// Accepts every value.
  #[default]
  Any,
  /// A compiled JSON Schema.
  Json {
    /// The schema document as declared.
    document: Value,
    /// Compiled validator.
    compiled: Arc<JSONSchema>,
  },
}

impl PortSchema {
  /// Compiles a JSON Schema document.
  pub fn json(document: Value) -> Result<Self, String> {
    let compiled = JSONSchema::compile(&document).map_err(|e| e.to_string())?;
    Ok(PortSchema::Json {
      document,
      compiled: Arc::new(compiled),
    })
  }

  /// Shorthand for a schema accepting one JSON type (`"integer"`, `"string"`,
  /// `"object"`, ...).
  pub fn of_type(json_type: &str) -> Self {
    // A `{"type": <name>}` document only fails to compile for unknown names;
    // those degrade to a schema matching nothing rather than everything.
    PortSchema::json(serde_json::json!({ "type": json_type }))
      .unwrap_or_else(|_| PortSchema::rejecting())
  }

  fn rejecting() -> Self {
    let document = serde_json::json!({ "not": {} });
    match JSONSchema::compile(&document) {
      Ok(compiled) => PortSchema::Json {
        document,
        compiled: Arc::new(compiled),
      },
      Err(_) => PortSchema::Any,
    }
  }

  /// The schema document, `None` for [`PortSchema::Any`].
  pub fn document(&self) -> Option<&Value> {
    match self {
      PortSchema::Any => None,
      PortSchema::Json { document, .. } => Some(document),
    }
  }

  /// Checks `value`; on mismatch returns every violation, joined.
  ///
  /// Never coerces: `"1"` does not satisfy `{"type": "integer"}`.
  pub fn check(&self, value: &Value) -> Result<(), String> {
    match self {
      PortSchema::Any => Ok(()),
      PortSchema::Json { compiled, .. } => match compiled.validate(value) {
        Ok(()) => Ok(()),
        Err(errors) => {
          let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
          Err(messages.join("; "))
        }
      },
    }
  }

  /// Whether an output with schema `self` may feed an input with schema
  /// `input`.
  pub fn feeds(&self, input: &PortSchema) -> bool {
    match (self.document(), input.document()) {
      (_, None) | (None, _) => true,
      (Some(out), Some(inp)) => out == inp,
    }
  }
}

impl fmt::Debug for PortSchema {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PortSchema::Any => f.write_str("Any"),
      PortSchema::Json { document, .. } => write!(f, "Json({document})"),
    }
  }
}

impl PartialEq for PortSchema {
  fn eq(&self, other: &Self) -> bool {
    self.document() == other.document()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use serde_json::json;

  fn json_type_of(value: &Value) -> &'static str {
    match value {
      Value::Null => "null",
      Value::Bool(_) => "boolean",
      Value::Number(_) => "integer",
      Value::String(_) => "string",
      Value::Array(_) => "array",
      Value::Object(_) => "object",
    }
  }

  fn any_value() -> impl Strategy<Value = Value> {
    prop_oneof![
      Just(Value::Null),
      any::<bool>().prop_map(Value::Bool),
      any::<i64>().prop_map(|n| json!(n)),
      "[a-z0-9]{0,8}".prop_map(Value::String),
      prop::collection::vec(any::<i32>(), 0..4).prop_map(|v| json!(v)),
      "[a-z]{1,4}".prop_map(|k| json!({ k: 1 })),
    ]
  }

  fn any_type() -> impl Strategy<Value = &'static str> {
    prop_oneof![
      Just("null"),
      Just("boolean"),
      Just("integer"),
      Just("string"),
      Just("array"),
      Just("object"),
    ]
  }

  proptest! {
    #[test]
    fn check_succeeds_iff_value_matches(json_type in any_type(), value in any_value()) {
      let schema = PortSchema::of_type(json_type);
      let matches = json_type_of(&value) == json_type;
      prop_assert_eq!(schema.check(&value).is_ok(), matches);
    }
  }

  #[test]
  fn no_coercion_between_shapes() {
    let schema = PortSchema::of_type("integer");
    assert!(schema.check(&json!("1")).is_err());
    assert!(schema.check(&json!(1)).is_ok());
  }

  #[test]
  fn object_schema_reports_violation() {
    let schema = PortSchema::json(json!({
      "type": "object",
      "required": ["action"],
      "properties": {"action": {"type": "string"}}
    }))
    .unwrap();
    assert!(schema.check(&json!({"action": "get"})).is_ok());
    let err = schema.check(&json!({"value": 1})).unwrap_err();
    assert!(err.contains("action"));
  }

  #[test]
  fn feeds_requires_equal_documents_or_any() {
    let ints = PortSchema::of_type("integer");
    let strings = PortSchema::of_type("string");
    assert!(ints.feeds(&PortSchema::Any));
    assert!(PortSchema::Any.feeds(&ints));
    assert!(ints.feeds(&PortSchema::of_type("integer")));
    assert!(!ints.feeds(&strings));
  }

  #[test]
  fn invalid_document_is_rejected() {
    assert!(PortSchema::json(json!({"type": 12})).is_err());
  }
}
