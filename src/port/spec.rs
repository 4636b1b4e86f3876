//! Port declarations returned by a body's `configure_ports`.

use crate::envelope::ErrorEnvelope;
use crate::error::PortError;
use crate::port::PortSchema;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Default buffer size of every port.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default bound on an ingress send.
pub const DEFAULT_INGRESS_TIMEOUT: Duration = Duration::from_secs(2);

/// What a port is for, derived from its name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
  /// `in_*`
  Input,
  /// `out_*`
  Output,
  /// `err_*`
  Error,
}

impl PortKind {
  /// Classifies a port name.
  pub fn of(name: &str) -> Result<Self, PortError> {
    let kind = if let Some(rest) = name.strip_prefix("in_") {
      (PortKind::Input, rest)
    } else if let Some(rest) = name.strip_prefix("out_") {
      (PortKind::Output, rest)
    } else if let Some(rest) = name.strip_prefix("err_") {
      (PortKind::Error, rest)
    } else {
      return Err(PortError::InvalidName(name.to_string()));
    };
    if kind.1.is_empty() {
      return Err(PortError::InvalidName(name.to_string()));
    }
    Ok(kind.0)
  }

  /// Whether this kind sits on the output side (`out_` or `err_`).
  pub fn is_outbound(self) -> bool {
    matches!(self, PortKind::Output | PortKind::Error)
  }
}

/// What a send does when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
  /// Wait for space indefinitely. Every internal port uses this.
  #[default]
  Block,
  /// Wait up to the bound, then drop the value and fail. Ingress only.
  BlockWithTimeout(Duration),
}

impl OverflowPolicy {
  /// `BLOCK_WITH_TIMEOUT` with the default 2 s bound.
  pub fn ingress() -> Self {
    OverflowPolicy::BlockWithTimeout(DEFAULT_INGRESS_TIMEOUT)
  }
}

/// Declaration of one port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortSpec {
  /// Port name; the prefix decides its kind.
  pub name: String,
  /// Structural validator.
  pub schema: PortSchema,
  /// Channel capacity when this port is the receiving end.
  pub buffer_size: usize,
  /// Behaviour of a send on a full buffer.
  pub overflow_policy: OverflowPolicy,
}

impl PortSpec {
  fn named(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      schema: PortSchema::Any,
      buffer_size: DEFAULT_BUFFER_SIZE,
      overflow_policy: OverflowPolicy::Block,
    }
  }

  /// Declares an input port (`in_*`).
  pub fn input(name: impl Into<String>) -> Self {
    Self::named(name)
  }

  /// Declares a data output port (`out_*`).
  pub fn output(name: impl Into<String>) -> Self {
    Self::named(name)
  }

  /// Declares an error port (`err_*`) carrying error envelopes.
  ///
  /// # Errors
  ///
  /// [`PortError::InvalidSchema`] if the envelope schema does not compile.
  pub fn error(name: impl Into<String>) -> Result<Self, PortError> {
    let name = name.into();
    match envelope_schema() {
      Ok(schema) => Ok(Self::named(name).with_schema(schema.clone())),
      Err(message) => Err(PortError::InvalidSchema {
        port: name,
        message: message.clone(),
      }),
    }
  }

  /// Sets the schema.
  pub fn with_schema(mut self, schema: PortSchema) -> Self {
    self.schema = schema;
    self
  }

  /// Sets the buffer size (at least 1).
  pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
    self.buffer_size = buffer_size.max(1);
    self
  }

  /// Sets the overflow policy.
  pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
    self.overflow_policy = policy;
    self
  }

  /// Kind derived from the name.
  pub fn kind(&self) -> Result<PortKind, PortError> {
    PortKind::of(&self.name)
  }
}

fn envelope_schema() -> Result<&'static PortSchema, &'static String> {
  static SCHEMA: OnceLock<Result<PortSchema, String>> = OnceLock::new();
  SCHEMA
    .get_or_init(|| PortSchema::json(ErrorEnvelope::schema()))
    .as_ref()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kinds_follow_prefix() {
    assert_eq!(PortKind::of("in_items").unwrap(), PortKind::Input);
    assert_eq!(PortKind::of("out_items").unwrap(), PortKind::Output);
    assert_eq!(PortKind::of("err_out").unwrap(), PortKind::Error);
    assert!(PortKind::of("items").is_err());
    assert!(PortKind::of("in_").is_err());
    assert!(PortKind::of("input").is_err());
  }

  #[test]
  fn error_ports_carry_envelope_schema() {
    let spec = PortSpec::error("err_out").unwrap();
    assert_eq!(spec.schema.document(), Some(&ErrorEnvelope::schema()));
    assert_eq!(spec.buffer_size, DEFAULT_BUFFER_SIZE);
    assert_eq!(spec.overflow_policy, OverflowPolicy::Block);
  }

  #[test]
  fn envelope_schema_compiles_and_rejects_garbage() {
    let schema = envelope_schema().unwrap();
    assert!(schema.check(&serde_json::json!("not an envelope")).is_err());
    let envelope = ErrorEnvelope::new("s", "c", crate::error::ErrorCategory::Runtime, "m", serde_json::json!(1));
    assert!(schema.check(&envelope.to_value()).is_ok());
  }

  #[test]
  fn buffer_size_is_at_least_one() {
    assert_eq!(PortSpec::input("in_x").with_buffer_size(0).buffer_size, 1);
  }
}
