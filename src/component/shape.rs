use crate::error::ComponentError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The five processing shapes. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
  /// 0 inputs, at least 1 data output.
  Source,
  /// At least 1 input, no data output.
  Sink,
  /// Exactly 1 input and 1 data output.
  Transformer,
  /// 1 input, at least 2 data outputs.
  Splitter,
  /// At least 2 inputs, 1 data output.
  Merger,
}

impl Shape {
  /// Every shape.
  pub const ALL: [Shape; 5] = [
    Shape::Source,
    Shape::Sink,
    Shape::Transformer,
    Shape::Splitter,
    Shape::Merger,
  ];

  /// The port-count invariant, in words.
  pub fn requirement(self) -> &'static str {
    match self {
      Shape::Source => "0 inputs and at least 1 data output",
      Shape::Sink => "at least 1 input and no data output",
      Shape::Transformer => "exactly 1 input and exactly 1 data output",
      Shape::Splitter => "exactly 1 input and at least 2 data outputs",
      Shape::Merger => "at least 2 inputs and exactly 1 data output",
    }
  }

  /// Whether `inputs` / `outputs` (data outputs, `err_` excluded) satisfy the
  /// invariant.
  pub fn accepts(self, inputs: usize, outputs: usize) -> bool {
    match self {
      Shape::Source => inputs == 0 && outputs >= 1,
      Shape::Sink => inputs >= 1 && outputs == 0,
      Shape::Transformer => inputs == 1 && outputs == 1,
      Shape::Splitter => inputs == 1 && outputs >= 2,
      Shape::Merger => inputs >= 2 && outputs == 1,
    }
  }

  /// Enforces the invariant for `component`.
  pub fn check(self, component: &str, inputs: usize, outputs: usize) -> Result<(), ComponentError> {
    if self.accepts(inputs, outputs) {
      return Ok(());
    }
    Err(ComponentError::ShapeViolation {
      component: component.to_string(),
      shape: self,
      requirement: self.requirement(),
      inputs,
      outputs,
    })
  }
}

impl fmt::Display for Shape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Shape::Source => "Source",
      Shape::Sink => "Sink",
      Shape::Transformer => "Transformer",
      Shape::Splitter => "Splitter",
      Shape::Merger => "Merger",
    };
    f.write_str(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn invariants_per_shape() {
    let table = [
      (Shape::Source, 0, 1, true),
      (Shape::Source, 1, 1, false),
      (Shape::Source, 0, 0, false),
      (Shape::Sink, 1, 0, true),
      (Shape::Sink, 3, 0, true),
      (Shape::Sink, 1, 1, false),
      (Shape::Transformer, 1, 1, true),
      (Shape::Transformer, 2, 1, false),
      (Shape::Transformer, 1, 2, false),
      (Shape::Splitter, 1, 2, true),
      (Shape::Splitter, 1, 1, false),
      (Shape::Merger, 2, 1, true),
      (Shape::Merger, 1, 1, false),
      (Shape::Merger, 2, 2, false),
    ];
    for (shape, inputs, outputs, ok) in table {
      assert_eq!(shape.accepts(inputs, outputs), ok, "{shape} {inputs}/{outputs}");
    }
  }

  #[test]
  fn violation_names_requirement() {
    let err = Shape::Merger.check("join", 1, 1).unwrap_err();
    assert!(err.to_string().contains("at least 2 inputs"));
  }

  #[test]
  fn serde_uses_snake_case() {
    assert_eq!(serde_json::to_string(&Shape::Transformer).unwrap(), "\"transformer\"");
  }
}
