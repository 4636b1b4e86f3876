//! # Error Taxonomy
//!
//! Every failure the runtime can observe is one of the types below. They map
//! onto the five runtime outcomes:
//!
//! - **Validation** ([`PortError::Validation`], [`BodyError::Validation`]):
//!   recoverable, routed to the component's `err_` port as an
//!   [`ErrorEnvelope`](crate::envelope::ErrorEnvelope).
//! - **Backpressure timeout** ([`PortError::BackpressureTimeout`]): only on
//!   ingress ports, surfaced to the ingress caller.
//! - **Component crash** ([`ComponentCrash`]): a failure with no `err_` escape
//!   hatch. Fatal to that component only.
//! - **Checkpoint write failure** ([`CheckpointError`]): logged and retried on
//!   the next interval.
//! - **Restore failure** ([`RestoreError`]): fatal at startup.
//!
//! Construction-time problems ([`ComponentError`], [`ExpansionError`],
//! [`WiringError`], [`ConfigError`]) fail fast with a descriptive message
//! before anything runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification carried by every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
  /// The item did not match a port schema or a body rejected it as malformed.
  Validation,
  /// The body failed while processing a well-formed item.
  Runtime,
  /// A store, file or channel operation failed underneath the body.
  Io,
}

impl fmt::Display for ErrorCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ErrorCategory::Validation => f.write_str("validation"),
      ErrorCategory::Runtime => f.write_str("runtime"),
      ErrorCategory::Io => f.write_str("io"),
    }
  }
}

/// Failures raised by port operations.
#[derive(Debug, Error)]
pub enum PortError {
  /// The value does not structurally match the port schema.
  #[error("port '{port}' rejected value: {message}")]
  Validation {
    /// Port that rejected the value.
    port: String,
    /// Sequence number of the rejected item, when it was received.
    offset: Option<u64>,
    /// Schema violations, joined.
    message: String,
    /// The rejected value.
    payload: Value,
  },
  /// An ingress send waited out its bound on a full buffer.
  #[error("port '{port}' backpressure timeout after {waited:?}")]
  BackpressureTimeout {
    /// Port whose buffer stayed full.
    port: String,
    /// How long the send waited.
    waited: Duration,
  },
  /// The other side of the channel is gone.
  #[error("port '{port}' is closed")]
  Closed {
    /// Port whose peer closed.
    port: String,
    /// The value that could not be delivered, if any.
    payload: Option<Value>,
  },
  /// The port was never bound to a channel.
  #[error("port '{0}' is not connected")]
  NotConnected(String),
  /// The port is already bound; ports bind exactly once.
  #[error("port '{0}' is already connected")]
  AlreadyConnected(String),
  /// The port name does not start with `in_`, `out_` or `err_`.
  #[error("invalid port name '{0}': must start with in_, out_ or err_")]
  InvalidName(String),
  /// A schema document failed to compile.
  #[error("invalid schema for port '{port}': {message}")]
  InvalidSchema {
    /// Port whose schema failed.
    port: String,
    /// Compiler message.
    message: String,
  },
}

impl PortError {
  /// Category used when this error becomes an envelope.
  pub fn category(&self) -> ErrorCategory {
    match self {
      PortError::Validation { .. } | PortError::InvalidSchema { .. } => ErrorCategory::Validation,
      PortError::BackpressureTimeout { .. }
      | PortError::Closed { .. }
      | PortError::NotConnected(_)
      | PortError::AlreadyConnected(_) => ErrorCategory::Io,
      PortError::InvalidName(_) => ErrorCategory::Validation,
    }
  }
}

/// Failures returned by component bodies from their per-item methods.
#[derive(Debug, Error)]
pub enum BodyError {
  /// The item is malformed for this body.
  #[error("validation failed: {0}")]
  Validation(String),
  /// Processing failed.
  #[error("{0}")]
  Runtime(String),
  /// A store or file operation failed.
  #[error("io failure: {0}")]
  Io(String),
}

impl BodyError {
  /// Shorthand for a [`BodyError::Runtime`].
  pub fn runtime(message: impl fmt::Display) -> Self {
    BodyError::Runtime(message.to_string())
  }

  /// Shorthand for a [`BodyError::Validation`].
  pub fn validation(message: impl fmt::Display) -> Self {
    BodyError::Validation(message.to_string())
  }

  /// Category used when this error becomes an envelope.
  pub fn category(&self) -> ErrorCategory {
    match self {
      BodyError::Validation(_) => ErrorCategory::Validation,
      BodyError::Runtime(_) => ErrorCategory::Runtime,
      BodyError::Io(_) => ErrorCategory::Io,
    }
  }
}

impl From<StoreError> for BodyError {
  fn from(e: StoreError) -> Self {
    BodyError::Io(e.to_string())
  }
}

impl From<std::io::Error> for BodyError {
  fn from(e: std::io::Error) -> Self {
    BodyError::Io(e.to_string())
  }
}

/// Construction-time violations of a component's declared shape.
#[derive(Debug, Error)]
pub enum ComponentError {
  /// Port counts break the shape invariant.
  #[error("component '{component}': {shape} requires {requirement}, found {inputs} input(s) and {outputs} data output(s)")]
  ShapeViolation {
    /// Component name.
    component: String,
    /// Shape being constructed.
    shape: crate::component::Shape,
    /// Human readable invariant.
    requirement: &'static str,
    /// Declared input ports.
    inputs: usize,
    /// Declared non-error output ports.
    outputs: usize,
  },
  /// Two ports share a name.
  #[error("component '{component}': duplicate port '{port}'")]
  DuplicatePort {
    /// Component name.
    component: String,
    /// Offending port.
    port: String,
  },
  /// A port spec is malformed.
  #[error("component '{component}': {source}")]
  Port {
    /// Component name.
    component: String,
    /// Underlying port error.
    #[source]
    source: PortError,
  },
  /// Restoring a body from a snapshot failed.
  #[error("component '{component}': cannot restore state: {message}")]
  Restore {
    /// Component name.
    component: String,
    /// Reason.
    message: String,
  },
}

/// Failures while expanding a recipe into a component.
#[derive(Debug, Error)]
pub enum ExpansionError {
  /// No recipe with that name is registered.
  #[error("unknown recipe '{0}'")]
  UnknownRecipe(String),
  /// A recipe with that name is already registered.
  #[error("recipe '{0}' is already registered")]
  DuplicateRecipe(String),
  /// The template produced a different primitive than the recipe declares.
  #[error("recipe '{recipe}' declares {expected} but its template produced {actual}")]
  ShapeMismatch {
    /// Recipe name.
    recipe: String,
    /// Declared base shape.
    expected: crate::component::Shape,
    /// Shape that came out.
    actual: crate::component::Shape,
  },
  /// A trait cannot be attached to the recipe's base shape.
  #[error("recipe '{recipe}': trait '{recipe_trait}' cannot be attached to a {shape}")]
  TraitNotApplicable {
    /// Recipe name.
    recipe: String,
    /// The offending trait.
    recipe_trait: crate::recipe::RecipeTrait,
    /// Base shape.
    shape: crate::component::Shape,
  },
  /// Splitter recipes must declare deterministic routing.
  #[error("recipe '{0}': splitter routing must be declared deterministic")]
  NonDeterministicRouting(String),
  /// The recipe needs an idempotency store and none was supplied.
  #[error("recipe '{0}' is idempotent but no idempotency store is configured")]
  MissingIdempotencyStore(String),
  /// The configuration cannot be used by the template.
  #[error("recipe '{recipe}': invalid config: {message}")]
  InvalidConfig {
    /// Recipe name.
    recipe: String,
    /// Reason.
    message: String,
  },
  /// The expanded component breaks its shape's port invariant.
  #[error(transparent)]
  Component(#[from] ComponentError),
}

impl ExpansionError {
  /// Shorthand for [`ExpansionError::InvalidConfig`].
  pub fn config(recipe: &str, message: impl fmt::Display) -> Self {
    ExpansionError::InvalidConfig {
      recipe: recipe.to_string(),
      message: message.to_string(),
    }
  }
}

/// Failures while wiring a topology into a graph.
#[derive(Debug, Error)]
pub enum WiringError {
  /// Two components share a name.
  #[error("duplicate component '{0}'")]
  DuplicateComponent(String),
  /// A binding or ingress entry names a component that does not exist.
  #[error("unknown component '{0}'")]
  UnknownComponent(String),
  /// A binding or ingress entry names a port that does not exist.
  #[error("component '{component}' has no {direction} port '{port}'")]
  UnknownPort {
    /// Component name.
    component: String,
    /// Port name.
    port: String,
    /// `input` or `output`.
    direction: &'static str,
  },
  /// A port appears in more than one binding.
  #[error("port '{0}' is bound more than once")]
  AlreadyBound(String),
  /// An input port is neither bound nor declared as ingress.
  #[error("input port '{0}' is not bound")]
  UnboundInput(String),
  /// A data output port is not bound.
  #[error("output port '{0}' is not bound")]
  UnboundOutput(String),
  /// Output and input schemas differ.
  #[error("incompatible schemas on binding {from} -> {to}")]
  IncompatibleSchema {
    /// Output side.
    from: String,
    /// Input side.
    to: String,
  },
  /// `BLOCK_WITH_TIMEOUT` declared on an internal binding.
  #[error("port '{0}' declares BLOCK_WITH_TIMEOUT but is not an ingress port")]
  TimeoutOnInternalPort(String),
  /// The expanded component declares different ports than the topology.
  #[error("component '{component}': declared ports do not match expansion: {message}")]
  DeclaredPortsMismatch {
    /// Component name.
    component: String,
    /// Difference.
    message: String,
  },
  /// The topology asked for a different primitive than the recipe provides.
  #[error("component '{component}': topology asks for {expected}, recipe provides {actual}")]
  PrimitiveMismatch {
    /// Component name.
    component: String,
    /// Requested by topology.
    expected: crate::component::Shape,
    /// Provided by recipe.
    actual: crate::component::Shape,
  },
  /// Expanding a component failed.
  #[error("component '{component}': {source}")]
  Expansion {
    /// Component name.
    component: String,
    /// Underlying failure.
    #[source]
    source: ExpansionError,
  },
  /// Binding a port failed.
  #[error(transparent)]
  Port(#[from] PortError),
  /// The topology document could not be read.
  #[error("cannot read topology: {0}")]
  Topology(String),
  /// The idempotency store could not be opened.
  #[error("cannot open idempotency store: {0}")]
  Store(#[from] StoreError),
}

/// Failures of the checkpoint path. Never fatal to a running graph.
#[derive(Debug, Error)]
pub enum CheckpointError {
  /// I/O or filesystem error.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// Serialization or deserialization failed.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  /// Checkpoint not found.
  #[error("checkpoint {0} not found")]
  NotFound(u64),
  /// The checkpoint on disk is unreadable or inconsistent.
  #[error("checkpoint {epoch} is corrupt: {message}")]
  Corrupt {
    /// Epoch.
    epoch: u64,
    /// Reason.
    message: String,
  },
  /// Components did not reach their safe points in time.
  #[error("pause not reached within {0:?}: {1} component(s) still busy")]
  PauseTimeout(Duration, usize),
  /// A component failed to snapshot its state.
  #[error("component '{component}' failed to snapshot: {message}")]
  Snapshot {
    /// Component name.
    component: String,
    /// Reason.
    message: String,
  },
  /// The background write task failed.
  #[error("checkpoint writer failed: {0}")]
  Writer(String),
}

/// Failures of restore. Always fatal at startup.
#[derive(Debug, Error)]
pub enum RestoreError {
  /// No checkpoint exists to restore from.
  #[error("no checkpoint available for system '{0}'")]
  NoCheckpoint(String),
  /// The requested checkpoint could not be loaded.
  #[error("cannot load checkpoint: {0}")]
  Load(#[from] CheckpointError),
  /// The checkpoint belongs to a different system.
  #[error("checkpoint belongs to system '{found}', expected '{expected}'")]
  SystemMismatch {
    /// Wired system id.
    expected: String,
    /// Checkpoint system id.
    found: String,
  },
  /// The checkpoint and the wired topology disagree.
  #[error("checkpoint does not match topology: {0}")]
  TopologyMismatch(String),
  /// A component rejected its restored state.
  #[error(transparent)]
  Component(#[from] ComponentError),
  /// Restore runs once per wired graph, before it starts.
  #[error("graph was already restored")]
  AlreadyRestored,
}

/// Failures of the idempotency store.
#[derive(Debug, Error)]
pub enum StoreError {
  /// I/O error (e.g. creating the database directory).
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// The database backend failed.
  #[error("backend error: {0}")]
  Backend(String),
  /// A stored row could not be decoded.
  #[error("corrupt record: {0}")]
  Corrupt(String),
  /// A mutex guarding the backend was poisoned.
  #[error("store lock poisoned")]
  LockPoisoned,
}

impl StoreError {
  /// Wraps a backend error.
  pub fn backend(e: impl fmt::Display) -> Self {
    StoreError::Backend(e.to_string())
  }
}

/// Failures loading or validating [`RuntimeConfig`](crate::config::RuntimeConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
  /// The config file could not be read.
  #[error("cannot read config {path}: {source}")]
  Read {
    /// File path.
    path: String,
    /// Underlying error.
    #[source]
    source: std::io::Error,
  },
  /// The config file is not valid JSON for the config schema.
  #[error("cannot parse config: {0}")]
  Parse(#[from] serde_json::Error),
  /// An environment override is malformed.
  #[error("invalid value for {key}: {value}")]
  Env {
    /// Variable name.
    key: String,
    /// Raw value.
    value: String,
  },
  /// A field has an unusable value.
  #[error("invalid config: {0}")]
  Invalid(String),
}

/// A component that terminated because a failure had nowhere to go.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("component '{component}' crashed: {reason}")]
pub struct ComponentCrash {
  /// Component name.
  pub component: String,
  /// Failure that killed it.
  pub reason: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn categories_follow_taxonomy() {
    let validation = PortError::Validation {
      port: "in_items".into(),
      offset: Some(3),
      message: "bad".into(),
      payload: Value::Null,
    };
    assert_eq!(validation.category(), ErrorCategory::Validation);

    let timeout = PortError::BackpressureTimeout {
      port: "in_requests".into(),
      waited: Duration::from_secs(2),
    };
    assert_eq!(timeout.category(), ErrorCategory::Io);

    assert_eq!(BodyError::runtime("boom").category(), ErrorCategory::Runtime);
    assert_eq!(
      BodyError::from(StoreError::LockPoisoned).category(),
      ErrorCategory::Io
    );
  }

  #[test]
  fn category_serializes_lowercase() {
    let json = serde_json::to_string(&ErrorCategory::Validation).unwrap();
    assert_eq!(json, "\"validation\"");
  }

  #[test]
  fn crash_message_names_component() {
    let crash = ComponentCrash {
      component: "counter".into(),
      reason: "no err_ port".into(),
    };
    assert_eq!(crash.to_string(), "component 'counter' crashed: no err_ port");
  }
}
