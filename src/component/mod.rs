//! # Components
//!
//! A component is a body specialised to one of the five [`Shape`]s, plus the
//! ports the body declared. The set of shapes is closed: [`Primitive`] has
//! exactly five cases and each one carries its own per-item method.
//!
//! Construction enforces the shape's port-count invariant, so anything that
//! holds a [`Component`] may rely on it.
//!
//! ## Lifecycle
//!
//! construct → declare ports → wire → `setup` → per-item loop → `cleanup`
//!
//! Each loop checks in with the pause barrier between items, so a checkpoint
//! never observes a half-processed item. A per-item failure becomes an
//! [`ErrorEnvelope`](crate::envelope::ErrorEnvelope) on the first `err_`
//! port; with no `err_` port the component terminates with a
//! [`ComponentCrash`].

mod body;
mod merger;
mod runner;
mod shape;
mod sink;
mod source;
mod splitter;
mod state;
mod transformer;


pub use body::{
  ComponentBody, ComponentContext, MergerBody, SinkBody, SourceBody, SplitterBody,
  TransformerBody,
};
pub use shape::Shape;
pub use state::{KvStore, WindowBuffer};

use crate::checkpoint::{CRASHED_KEY, Deposit, IdempotencyStore, Participant};
use crate::error::{BodyError, ComponentCrash, ComponentError, PortError};
use crate::metrics::ComponentMetrics;
use crate::port::{InputPort, OutputPort, PortKind, PortSpec};
use crate::recipe::Provenance;
use runner::{Exit, Frame};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// A body bound to its shape.
pub enum Primitive {
  /// Produces items.
  Source(Box<dyn SourceBody>),
  /// Consumes items.
  Sink(Box<dyn SinkBody>),
  /// One output per input.
  Transformer(Box<dyn TransformerBody>),
  /// Routes each input to a subset of outputs.
  Splitter(Box<dyn SplitterBody>),
  /// Combines several inputs into one output.
  Merger(Box<dyn MergerBody>),
}

macro_rules! with_body {
  ($primitive:expr, $body:ident => $call:expr) => {
    match $primitive {
      Primitive::Source($body) => $call,
      Primitive::Sink($body) => $call,
      Primitive::Transformer($body) => $call,
      Primitive::Splitter($body) => $call,
      Primitive::Merger($body) => $call,
    }
  };
}

impl Primitive {
  /// Wraps a Source body.
  pub fn source(body: impl SourceBody + 'static) -> Self {
    Primitive::Source(Box::new(body))
  }

  /// Wraps a Sink body.
  pub fn sink(body: impl SinkBody + 'static) -> Self {
    Primitive::Sink(Box::new(body))
  }

  /// Wraps a Transformer body.
  pub fn transformer(body: impl TransformerBody + 'static) -> Self {
    Primitive::Transformer(Box::new(body))
  }

  /// Wraps a Splitter body.
  pub fn splitter(body: impl SplitterBody + 'static) -> Self {
    Primitive::Splitter(Box::new(body))
  }

  /// Wraps a Merger body.
  pub fn merger(body: impl MergerBody + 'static) -> Self {
    Primitive::Merger(Box::new(body))
  }

  /// The shape of this primitive.
  pub fn shape(&self) -> Shape {
    match self {
      Primitive::Source(_) => Shape::Source,
      Primitive::Sink(_) => Shape::Sink,
      Primitive::Transformer(_) => Shape::Transformer,
      Primitive::Splitter(_) => Shape::Splitter,
      Primitive::Merger(_) => Shape::Merger,
    }
  }

  fn configure_ports(&self) -> Vec<PortSpec> {
    with_body!(self, body => body.configure_ports())
  }

  fn snapshot(&self) -> Result<Value, BodyError> {
    with_body!(self, body => body.snapshot())
  }

  fn restore(&mut self, state: Value) -> Result<(), BodyError> {
    with_body!(self, body => body.restore(state))
  }

  async fn setup(&mut self, ctx: &mut ComponentContext) -> Result<(), BodyError> {
    with_body!(self, body => body.setup(ctx).await)
  }

  async fn cleanup(&mut self, ctx: &mut ComponentContext) -> Result<(), BodyError> {
    with_body!(self, body => body.cleanup(ctx).await)
  }
}

impl std::fmt::Debug for Primitive {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Primitive::{}", self.shape())
  }
}

/// Checkpointed state of a component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ComponentState {
  #[serde(default)]
  body: Value,
  #[serde(default)]
  store: Option<KvStore>,
  #[serde(default)]
  window: Option<Vec<Value>>,
  #[serde(default)]
  cursor: usize,
}

/// How a component's run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ComponentOutcome {
  /// Every input reached end-of-stream, or the source was exhausted.
  Completed,
  /// Cancellation was observed at a safe point.
  Cancelled,
  /// A failure had nowhere to go.
  Crashed {
    /// Why.
    reason: String,
  },
}

/// A constructed component: shape, body and ports.
pub struct Component {
  name: String,
  primitive: Primitive,
  inputs: Vec<InputPort>,
  outputs: Vec<OutputPort>,
  metrics: Arc<ComponentMetrics>,
  ctx: ComponentContext,
  window: Option<WindowBuffer>,
  cursor: usize,
  config: Value,
  provenance: Option<Provenance>,
}

impl Component {
  /// Builds a component from a body, enforcing the shape invariant on the
  /// ports the body declares.
  pub fn new(name: impl Into<String>, primitive: Primitive) -> Result<Self, ComponentError> {
    let name = name.into();
    let metrics = Arc::new(ComponentMetrics::new(&name));
    let port_error = |source: PortError| ComponentError::Port {
      component: name.clone(),
      source,
    };

    let mut seen = BTreeSet::new();
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for spec in primitive.configure_ports() {
      if !seen.insert(spec.name.clone()) {
        return Err(ComponentError::DuplicatePort {
          component: name.clone(),
          port: spec.name,
        });
      }
      match spec.kind().map_err(port_error)? {
        PortKind::Input => inputs.push(InputPort::new(spec, Arc::clone(&metrics)).map_err(port_error)?),
        PortKind::Output | PortKind::Error => {
          outputs.push(OutputPort::new(spec, Arc::clone(&metrics)).map_err(port_error)?)
        }
      }
    }

    let data_outputs = outputs.iter().filter(|port| !port.is_error()).count();
    primitive.shape().check(&name, inputs.len(), data_outputs)?;

    Ok(Self {
      ctx: ComponentContext::new(&name, ""),
      name,
      primitive,
      inputs,
      outputs,
      metrics,
      window: None,
      cursor: 0,
      config: Value::Null,
      provenance: None,
    })
  }

  /// Component name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Shape.
  pub fn shape(&self) -> Shape {
    self.primitive.shape()
  }

  /// Configuration the component was built from.
  pub fn config(&self) -> &Value {
    &self.config
  }

  /// Recipe that produced this component, if it came from one.
  pub fn provenance(&self) -> Option<&Provenance> {
    self.provenance.as_ref()
  }

  /// Component metrics.
  pub fn metrics(&self) -> &Arc<ComponentMetrics> {
    &self.metrics
  }

  /// Input ports, in declaration order.
  pub fn inputs(&self) -> &[InputPort] {
    &self.inputs
  }

  /// Output ports (data and error), in declaration order.
  pub fn outputs(&self) -> &[OutputPort] {
    &self.outputs
  }

  /// Data output ports.
  pub fn data_outputs(&self) -> impl Iterator<Item = &OutputPort> {
    self.outputs.iter().filter(|port| !port.is_error())
  }

  /// `err_` ports.
  pub fn error_ports(&self) -> impl Iterator<Item = &OutputPort> {
    self.outputs.iter().filter(|port| port.is_error())
  }

  /// Input port by name.
  pub fn input(&self, name: &str) -> Option<&InputPort> {
    self.inputs.iter().find(|port| port.name() == name)
  }

  /// Output port by name.
  pub fn output(&self, name: &str) -> Option<&OutputPort> {
    self.outputs.iter().find(|port| port.name() == name)
  }

  pub(crate) fn input_mut(&mut self, name: &str) -> Option<&mut InputPort> {
    self.inputs.iter_mut().find(|port| port.name() == name)
  }

  pub(crate) fn output_mut(&mut self, name: &str) -> Option<&mut OutputPort> {
    self.outputs.iter_mut().find(|port| port.name() == name)
  }

  pub(crate) fn ports_mut(&mut self) -> (&mut [InputPort], &mut [OutputPort]) {
    (&mut self.inputs, &mut self.outputs)
  }

  /// Whether the `persistent` store is attached.
  pub fn is_persistent(&self) -> bool {
    self.ctx.store_ref().is_some()
  }

  /// The `windowed` buffer, when attached.
  pub fn window(&self) -> Option<&WindowBuffer> {
    self.window.as_ref()
  }

  pub(crate) fn set_config(&mut self, config: Value) {
    self.config = config;
  }

  pub(crate) fn set_provenance(&mut self, provenance: Provenance) {
    self.provenance = Some(provenance);
  }

  pub(crate) fn set_system_id(&mut self, system_id: &str) {
    self.ctx.set_system_id(system_id);
  }

  pub(crate) fn attach_idempotency(&mut self, store: Arc<dyn IdempotencyStore>) {
    self.ctx.attach_idempotency(store);
  }

  pub(crate) fn attach_store(&mut self, store: KvStore) {
    self.ctx.attach_store(store);
  }

  pub(crate) fn attach_window(&mut self, window: WindowBuffer) {
    self.window = Some(window);
  }

  /// Appends an `err_out` port if the body declared no `err_` port.
  pub(crate) fn ensure_error_port(&mut self) -> Result<(), ComponentError> {
    if self.error_ports().next().is_some() {
      return Ok(());
    }
    let port = PortSpec::error("err_out")
      .and_then(|spec| OutputPort::new(spec, Arc::clone(&self.metrics)))
      .map_err(|source| ComponentError::Port {
        component: self.name.clone(),
        source,
      })?;
    self.outputs.push(port);
    Ok(())
  }

  /// Port name to the last sequence number sent or received.
  pub fn port_offsets(&self) -> BTreeMap<String, u64> {
    let inputs = self
      .inputs
      .iter()
      .map(|port| (port.name().to_string(), port.metrics().sequence()));
    let outputs = self
      .outputs
      .iter()
      .map(|port| (port.name().to_string(), port.metrics().sequence()));
    inputs.chain(outputs).collect()
  }

  /// Restores one port's sequence number. Returns `false` for an unknown
  /// port.
  pub(crate) fn set_port_offset(&mut self, port: &str, sequence: u64) -> bool {
    if let Some(input) = self.input(port) {
      input.metrics().set_sequence(sequence);
      return true;
    }
    if let Some(output) = self.output(port) {
      output.metrics().set_sequence(sequence);
      return true;
    }
    false
  }

  /// Checkpointable state:
  /// `{"body": .., "store": .., "window": .., "cursor": n}`.
  pub fn snapshot(&self) -> Result<Value, BodyError> {
    capture(
      self.primitive.snapshot(),
      self.ctx.store_ref(),
      self.window.as_ref(),
      self.cursor,
    )
    .map_err(BodyError::Runtime)
  }

  /// Reinstates a state produced by [`snapshot`](Self::snapshot).
  pub fn restore(&mut self, state: Value) -> Result<(), ComponentError> {
    let restore_error = |message: String| ComponentError::Restore {
      component: self.name.clone(),
      message,
    };
    if let Some(reason) = state.get(CRASHED_KEY) {
      warn!(component = %self.name, %reason, "component crashed before the checkpoint, starting fresh");
      return Ok(());
    }
    let state: ComponentState =
      serde_json::from_value(state).map_err(|e| restore_error(e.to_string()))?;

    self
      .primitive
      .restore(state.body)
      .map_err(|e| restore_error(e.to_string()))?;
    match (state.store, self.ctx.store_ref().is_some()) {
      (Some(store), true) => self.ctx.attach_store(store),
      (None, false) => {}
      (Some(_), false) => return Err(restore_error("state carries a store but the component is not persistent".into())),
      (None, true) => return Err(restore_error("persistent component state has no store".into())),
    }
    match (state.window, self.window.as_mut()) {
      (Some(items), Some(window)) => window.restore(items),
      (None, None) => {}
      _ => return Err(restore_error("window state does not match the component".into())),
    }
    self.cursor = if self.inputs.is_empty() {
      0
    } else {
      state.cursor % self.inputs.len()
    };
    Ok(())
  }

  /// Runs the component to completion.
  ///
  /// The participant ties the loop to the graph's pause barrier and
  /// cancellation token. On exit the final state is deposited with the
  /// barrier and every port is closed.
  pub async fn run(self, participant: Participant) -> ComponentOutcome {
    let Component {
      name,
      mut primitive,
      inputs,
      outputs,
      metrics,
      ctx,
      window,
      cursor,
      ..
    } = self;
    let shape = primitive.shape();
    let (errors, data): (Vec<_>, Vec<_>) = outputs.into_iter().partition(OutputPort::is_error);
    let mut frame = Frame {
      name,
      inputs,
      data,
      errors,
      metrics,
      ctx,
      window,
      cursor,
      participant,
    };

    info!(component = %frame.name, shape = %shape, "component started");
    let exit = match primitive.setup(&mut frame.ctx).await {
      Ok(()) => match &mut primitive {
        Primitive::Source(body) => source::run(body.as_mut(), &mut frame).await,
        Primitive::Sink(body) => sink::run(body.as_mut(), &mut frame).await,
        Primitive::Transformer(body) => transformer::run(body.as_mut(), &mut frame).await,
        Primitive::Splitter(body) => splitter::run(body.as_mut(), &mut frame).await,
        Primitive::Merger(body) => merger::run(body.as_mut(), &mut frame).await,
      },
      Err(e) => Err(ComponentCrash {
        component: frame.name.clone(),
        reason: format!("setup failed: {e}"),
      }),
    };

    if let Err(e) = primitive.cleanup(&mut frame.ctx).await {
      warn!(component = %frame.name, error = %e, "cleanup failed");
    }

    let outcome = match exit {
      Ok(Exit::Completed) => {
        info!(component = %frame.name, "component completed");
        ComponentOutcome::Completed
      }
      Ok(Exit::Cancelled) => {
        info!(component = %frame.name, "component cancelled");
        ComponentOutcome::Cancelled
      }
      Err(crash) => {
        frame.metrics.record_error();
        error!(component = %frame.name, reason = %crash.reason, "component crashed");
        ComponentOutcome::Crashed {
          reason: crash.reason,
        }
      }
    };

    let deposit = frame.state(primitive.snapshot());
    let Frame { participant, .. } = frame;
    participant.finish(deposit);
    outcome
  }
}

impl std::fmt::Debug for Component {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Component")
      .field("name", &self.name)
      .field("shape", &self.shape())
      .field("inputs", &self.inputs.iter().map(InputPort::name).collect::<Vec<_>>())
      .field("outputs", &self.outputs.iter().map(OutputPort::name).collect::<Vec<_>>())
      .field("provenance", &self.provenance)
      .finish()
  }
}

pub(crate) fn capture(
  body: Result<Value, BodyError>,
  store: Option<&KvStore>,
  window: Option<&WindowBuffer>,
  cursor: usize,
) -> Deposit {
  let body = body.map_err(|e| e.to_string())?;
  let state = json!({
    "body": body,
    "store": store,
    "window": window.map(WindowBuffer::pending),
    "cursor": cursor,
  });
  Ok(state)
}
