//! Topology to [`Graph`]: expansion, binding and the error collector.

use super::Harness;
use super::graph::Graph;
use super::topology::{PortRef, Topology, port_key};
use crate::checkpoint::{CheckpointStorage, FileCheckpointStorage, IdempotencyStore, PauseController, SqliteIdempotencyStore};
use crate::component::Component;
use crate::config::is_valid_system_id;
use crate::error::WiringError;
use crate::metrics::ComponentMetrics;
use crate::port::{Channel, InputPort, OutputPort, OverflowPolicy, PortSpec, ingress, link};
use crate::recipe::{Contract, RecipeExpander};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

pub(super) fn wire(harness: &Harness, topology: &Topology) -> Result<Graph, WiringError> {
  let system = harness
    .config
    .system_id
    .clone()
    .unwrap_or_else(|| topology.system.clone());
  if !is_valid_system_id(&system) {
    return Err(WiringError::Topology(format!("invalid system id '{system}'")));
  }

  let idempotency = idempotency_store(harness, topology, &system)?;
  let storage: Arc<dyn CheckpointStorage> = match &harness.storage {
    Some(storage) => Arc::clone(storage),
    None => Arc::new(FileCheckpointStorage::new(harness.config.checkpoint_dir(&system))),
  };

  let (mut components, index) = expand(harness, topology, &system, idempotency.as_ref())?;

  let pause = Arc::new(PauseController::new());
  let mut bound_inputs = BTreeSet::new();
  let mut bound_outputs = BTreeSet::new();
  let mut channels = BTreeMap::new();

  for binding in &topology.bindings {
    let (from, to) = (&binding.from, &binding.to);
    let src = lookup(&index, from)?;
    let dst = lookup(&index, to)?;
    {
      let output = components[src].output(&from.port).ok_or_else(|| unknown_port(from, "output"))?;
      let input = components[dst].input(&to.port).ok_or_else(|| unknown_port(to, "input"))?;
      if !bound_outputs.insert(from.key()) {
        return Err(WiringError::AlreadyBound(from.key()));
      }
      if !bound_inputs.insert(to.key()) {
        return Err(WiringError::AlreadyBound(to.key()));
      }
      if !output.spec().schema.feeds(&input.spec().schema) {
        return Err(WiringError::IncompatibleSchema {
          from: from.to_string(),
          to: to.to_string(),
        });
      }
      for (port, policy) in [
        (from, &output.spec().overflow_policy),
        (to, &input.spec().overflow_policy),
      ] {
        if matches!(policy, OverflowPolicy::BlockWithTimeout(_)) {
          return Err(WiringError::TimeoutOnInternalPort(port.key()));
        }
      }
    }

    let (output, input) = port_pair(&mut components, (src, &from.port), (dst, &to.port))
      .ok_or_else(|| unknown_port(from, "output"))?;
    let channel = link(output, input, pause.signal())?;
    channels.insert(to.key(), channel);
    debug!(from = %from, to = %to, "bound ports");
  }

  let mut senders = BTreeMap::new();
  for port in &topology.ingress {
    let idx = lookup(&index, port)?;
    let input = components[idx]
      .input_mut(&port.port)
      .ok_or_else(|| unknown_port(port, "input"))?;
    if !bound_inputs.insert(port.key()) {
      return Err(WiringError::AlreadyBound(port.key()));
    }
    let sender = ingress(input)?;
    if let Some(channel) = input.channel() {
      channels.insert(port.key(), Arc::clone(channel));
    }
    senders.insert(port.key(), sender);
  }

  for component in &components {
    for input in component.inputs() {
      let key = port_key(component.name(), input.name());
      if !bound_inputs.contains(&key) {
        return Err(WiringError::UnboundInput(key));
      }
    }
    for output in component.data_outputs() {
      let key = port_key(component.name(), output.name());
      if !bound_outputs.contains(&key) {
        return Err(WiringError::UnboundOutput(key));
      }
    }
  }

  let collectors = attach_collectors(&mut components, &bound_outputs, &pause, &mut channels)?;

  info!(
    system = %system,
    components = components.len(),
    bindings = topology.bindings.len(),
    ingress = senders.len(),
    collected = collectors.len(),
    "wired topology"
  );
  Ok(Graph {
    system,
    config: harness.config.clone(),
    components,
    channels,
    senders,
    collectors,
    pause,
    storage,
    idempotency,
    restored: None,
  })
}

fn idempotency_store(
  harness: &Harness,
  topology: &Topology,
  system: &str,
) -> Result<Option<Arc<dyn IdempotencyStore>>, WiringError> {
  if let Some(store) = &harness.idempotency {
    return Ok(Some(Arc::clone(store)));
  }
  let needed = topology.components.iter().any(|decl| {
    harness
      .library
      .get(&decl.recipe)
      .is_some_and(|recipe| recipe.has_contract(Contract::Idempotent))
  });
  if !needed {
    return Ok(None);
  }
  let path = harness.config.idempotency_path(system);
  let store = SqliteIdempotencyStore::open(&path)?;
  debug!(path = %path.display(), "opened idempotency store");
  Ok(Some(Arc::new(store)))
}

fn expand(
  harness: &Harness,
  topology: &Topology,
  system: &str,
  idempotency: Option<&Arc<dyn IdempotencyStore>>,
) -> Result<(Vec<Component>, BTreeMap<String, usize>), WiringError> {
  let mut expander = RecipeExpander::new(&harness.library);
  if let Some(store) = idempotency {
    expander = expander.with_idempotency_store(Arc::clone(store));
  }

  let mut components = Vec::with_capacity(topology.components.len());
  let mut index = BTreeMap::new();
  for decl in &topology.components {
    if index.insert(decl.name.clone(), components.len()).is_some() {
      return Err(WiringError::DuplicateComponent(decl.name.clone()));
    }
    let mut component = expander
      .expand(&decl.name, &decl.recipe, &decl.config)
      .map_err(|source| WiringError::Expansion {
        component: decl.name.clone(),
        source,
      })?;
    if let Some(expected) = decl.primitive {
      if expected != component.shape() {
        return Err(WiringError::PrimitiveMismatch {
          component: decl.name.clone(),
          expected,
          actual: component.shape(),
        });
      }
    }
    if let Some(ports) = &decl.ports {
      check_declared_ports(&component, ports)?;
    }
    component.set_system_id(system);
    components.push(component);
  }
  Ok((components, index))
}

/// The ports the generation layer expected must all exist, and the component
/// may add nothing but `err_` ports on top of them.
fn check_declared_ports(component: &Component, declared: &[String]) -> Result<(), WiringError> {
  let mismatch = |message: String| WiringError::DeclaredPortsMismatch {
    component: component.name().to_string(),
    message,
  };
  let actual: BTreeSet<&str> = component
    .inputs()
    .iter()
    .map(InputPort::name)
    .chain(component.outputs().iter().map(OutputPort::name))
    .collect();
  let declared: BTreeSet<&str> = declared.iter().map(String::as_str).collect();

  if let Some(missing) = declared.iter().find(|port| !actual.contains(*port)) {
    return Err(mismatch(format!("declared port '{missing}' was not produced")));
  }
  if let Some(extra) = actual
    .iter()
    .find(|port| !declared.contains(*port) && !port.starts_with("err_"))
  {
    return Err(mismatch(format!("port '{extra}' was not declared")));
  }
  Ok(())
}

fn lookup(index: &BTreeMap<String, usize>, port: &PortRef) -> Result<usize, WiringError> {
  index
    .get(&port.component)
    .copied()
    .ok_or_else(|| WiringError::UnknownComponent(port.component.clone()))
}

fn unknown_port(port: &PortRef, direction: &'static str) -> WiringError {
  WiringError::UnknownPort {
    component: port.component.clone(),
    port: port.port.clone(),
    direction,
  }
}

/// Mutable borrows of an output and an input that may live on the same
/// component.
fn port_pair<'a>(
  components: &'a mut [Component],
  (src, output): (usize, &str),
  (dst, input): (usize, &str),
) -> Option<(&'a mut OutputPort, &'a mut InputPort)> {
  let (producer, consumer) = match src.cmp(&dst) {
    std::cmp::Ordering::Equal => {
      let (inputs, outputs) = components[src].ports_mut();
      let output = outputs.iter_mut().find(|port| port.name() == output)?;
      let input = inputs.iter_mut().find(|port| port.name() == input)?;
      return Some((output, input));
    }
    std::cmp::Ordering::Less => {
      let (head, tail) = components.split_at_mut(dst);
      (&mut head[src], &mut tail[0])
    }
    std::cmp::Ordering::Greater => {
      let (head, tail) = components.split_at_mut(src);
      (&mut tail[0], &mut head[dst])
    }
  };
  Some((producer.output_mut(output)?, consumer.input_mut(input)?))
}

/// Binds every unbound `err_` port to a collector input. Each collector
/// channel is also recorded in `channels`, keyed by the `err_` port.
fn attach_collectors(
  components: &mut [Component],
  bound_outputs: &BTreeSet<String>,
  pause: &PauseController,
  channels: &mut BTreeMap<String, Arc<Channel>>,
) -> Result<Vec<(String, InputPort)>, WiringError> {
  let metrics = Arc::new(ComponentMetrics::new("_errors"));
  let mut collectors = Vec::new();
  for component in components.iter_mut() {
    let name = component.name().to_string();
    let unbound: Vec<String> = component
      .error_ports()
      .map(|port| port.name().to_string())
      .filter(|port| !bound_outputs.contains(&port_key(&name, port)))
      .collect();
    for port in unbound {
      let key = port_key(&name, &port);
      let mut input = InputPort::new(PortSpec::input(format!("in_{key}")), Arc::clone(&metrics))?;
      if let Some(output) = component.output_mut(&port) {
        let channel = link(output, &mut input, pause.signal())?;
        channels.insert(key.clone(), channel);
        collectors.push((key, input));
      }
    }
  }
  Ok(collectors)
}
