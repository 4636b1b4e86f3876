//! Topology document handed over by the validation layer.
//!
//! ```json
//! {
//!   "system": "orders",
//!   "components": [
//!     {"name": "numbers", "recipe": "range_source", "config": {"end": 100}},
//!     {"name": "count", "recipe": "counting_sink", "primitive": "sink"}
//!   ],
//!   "bindings": [
//!     {"from": {"component": "numbers", "port": "out_items"},
//!      "to": {"component": "count", "port": "in_items"}}
//!   ],
//!   "ingress": []
//! }
//! ```

use crate::component::Shape;
use crate::error::WiringError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;

/// A validated component graph, before expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
  /// System id.
  pub system: String,
  /// Components, in declaration order.
  pub components: Vec<ComponentDecl>,
  /// Output-to-input bindings.
  #[serde(default)]
  pub bindings: Vec<Binding>,
  /// Input ports fed from outside the graph.
  #[serde(default)]
  pub ingress: Vec<PortRef>,
}

/// One component of a topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentDecl {
  /// Unique name.
  pub name: String,
  /// Recipe to expand.
  pub recipe: String,
  /// Primitive chosen by the generation layer; re-checked at wiring.
  #[serde(default)]
  pub primitive: Option<Shape>,
  /// Recipe configuration.
  #[serde(default)]
  pub config: Value,
  /// Ports the generation layer expects the component to declare.
  #[serde(default)]
  pub ports: Option<Vec<String>>,
}

/// `(component, port) -> (component, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Binding {
  /// Output side.
  pub from: PortRef,
  /// Input side.
  pub to: PortRef,
}

/// A port of a named component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRef {
  /// Component name.
  pub component: String,
  /// Port name.
  pub port: String,
}

impl PortRef {
  /// Creates a reference.
  pub fn new(component: impl Into<String>, port: impl Into<String>) -> Self {
    Self {
      component: component.into(),
      port: port.into(),
    }
  }

  /// `component.port`, the key used by checkpoints and metrics.
  pub fn key(&self) -> String {
    port_key(&self.component, &self.port)
  }
}

impl fmt::Display for PortRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.component, self.port)
  }
}

pub(crate) fn port_key(component: &str, port: &str) -> String {
  format!("{component}.{port}")
}

impl Topology {
  /// Empty topology for `system`.
  pub fn new(system: impl Into<String>) -> Self {
    Self {
      system: system.into(),
      components: Vec::new(),
      bindings: Vec::new(),
      ingress: Vec::new(),
    }
  }

  /// Parses a topology document.
  pub fn from_json(raw: &str) -> Result<Self, WiringError> {
    serde_json::from_str(raw).map_err(|e| WiringError::Topology(e.to_string()))
  }

  /// Reads and parses a topology file.
  pub fn load(path: &Path) -> Result<Self, WiringError> {
    let raw = std::fs::read_to_string(path)
      .map_err(|e| WiringError::Topology(format!("{}: {e}", path.display())))?;
    Self::from_json(&raw)
  }

  /// Adds a component.
  pub fn component(mut self, name: &str, recipe: &str, config: Value) -> Self {
    self.components.push(ComponentDecl {
      name: name.to_string(),
      recipe: recipe.to_string(),
      primitive: None,
      config,
      ports: None,
    });
    self
  }

  /// Adds a binding.
  pub fn bind(mut self, from: (&str, &str), to: (&str, &str)) -> Self {
    self.bindings.push(Binding {
      from: PortRef::new(from.0, from.1),
      to: PortRef::new(to.0, to.1),
    });
    self
  }

  /// Declares an ingress port.
  pub fn with_ingress(mut self, component: &str, port: &str) -> Self {
    self.ingress.push(PortRef::new(component, port));
    self
  }
}
