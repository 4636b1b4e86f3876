//! A wired graph before it starts: ingress senders and restore.

use super::running::RunningGraph;
use super::topology::port_key;
use crate::checkpoint::{Checkpoint, CheckpointStorage, Epoch, IdempotencyStore, PauseController};
use crate::component::Component;
use crate::config::RuntimeConfig;
use crate::error::RestoreError;
use crate::port::{Channel, IngressSender, InputPort};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Components bound into one system, not yet running.
pub struct Graph {
  pub(super) system: String,
  pub(super) config: RuntimeConfig,
  pub(super) components: Vec<Component>,
  /// Channel feeding each bound input, keyed `component.port`. Collector
  /// channels are keyed by the `err_` port they drain.
  pub(super) channels: BTreeMap<String, Arc<Channel>>,
  pub(super) senders: BTreeMap<String, IngressSender>,
  /// Collector inputs, keyed by the `err_` port they drain.
  pub(super) collectors: Vec<(String, InputPort)>,
  pub(super) pause: Arc<PauseController>,
  pub(super) storage: Arc<dyn CheckpointStorage>,
  pub(super) idempotency: Option<Arc<dyn IdempotencyStore>>,
  pub(super) restored: Option<Epoch>,
}

impl Graph {
  /// System id.
  pub fn system(&self) -> &str {
    &self.system
  }

  /// Components in topology order.
  pub fn components(&self) -> &[Component] {
    &self.components
  }

  /// Component by name.
  pub fn component(&self, name: &str) -> Option<&Component> {
    self.components.iter().find(|c| c.name() == name)
  }

  /// Checkpoint storage used by this graph.
  pub fn storage(&self) -> &Arc<dyn CheckpointStorage> {
    &self.storage
  }

  /// Idempotency store, when any component needs one.
  pub fn idempotency_store(&self) -> Option<&Arc<dyn IdempotencyStore>> {
    self.idempotency.as_ref()
  }

  /// Takes the sender feeding ingress port `key` (`component.port`).
  ///
  /// Senders not taken before [`start`](Self::start) are closed, so their
  /// inputs see end-of-stream once drained.
  pub fn ingress(&mut self, key: &str) -> Option<IngressSender> {
    self.senders.remove(key)
  }

  /// Epoch this graph was restored from.
  pub fn restored_from(&self) -> Option<Epoch> {
    self.restored
  }

  /// Reinstates component states, port offsets and in-flight items from a
  /// checkpoint: `epoch`, or the newest valid one.
  ///
  /// Everything is checked against the wired topology before anything is
  /// applied.
  ///
  /// # Errors
  ///
  /// - [`RestoreError::AlreadyRestored`] on a second call
  /// - [`RestoreError::NoCheckpoint`] if the storage holds no valid checkpoint
  /// - [`RestoreError::Load`] if `epoch` is missing or corrupt
  /// - [`RestoreError::SystemMismatch`] for another system's checkpoint
  /// - [`RestoreError::TopologyMismatch`] if components or ports differ
  /// - [`RestoreError::Component`] if a component rejects its state
  pub fn restore(&mut self, epoch: Option<Epoch>) -> Result<Epoch, RestoreError> {
    if self.restored.is_some() {
      return Err(RestoreError::AlreadyRestored);
    }
    let checkpoint = match epoch {
      Some(epoch) => self.storage.load(epoch)?,
      None => self
        .storage
        .latest_valid()?
        .ok_or_else(|| RestoreError::NoCheckpoint(self.system.clone()))?,
    };
    if checkpoint.system_id != self.system {
      return Err(RestoreError::SystemMismatch {
        expected: self.system.clone(),
        found: checkpoint.system_id,
      });
    }
    let ports = self.check_matches(&checkpoint)?;

    for component in &mut self.components {
      let state = checkpoint
        .component_states
        .get(component.name())
        .cloned()
        .unwrap_or_default();
      component.restore(state)?;
      if let (Some(was), Some(now)) = (checkpoint.provenance.get(component.name()), component.provenance()) {
        if was != now {
          warn!(component = component.name(), checkpoint = %was, current = %now, "recipe changed since checkpoint");
        }
      }
    }
    for (key, sequence) in &checkpoint.port_offsets {
      if let Some((idx, port)) = ports.get(key) {
        self.components[*idx].set_port_offset(port, *sequence);
      }
    }
    for (key, values) in &checkpoint.in_flight {
      if let Some(channel) = self.channels.get(key) {
        channel.preload(values.clone());
      }
    }

    info!(
      system = %self.system,
      epoch = checkpoint.epoch.as_u64(),
      in_flight = checkpoint.in_flight_len(),
      "restored checkpoint"
    );
    self.restored = Some(checkpoint.epoch);
    Ok(checkpoint.epoch)
  }

  /// Port key to `(component index, port name)` for every port, after
  /// checking the checkpoint only names what this graph has.
  fn check_matches(&self, checkpoint: &Checkpoint) -> Result<BTreeMap<String, (usize, String)>, RestoreError> {
    let ours: BTreeSet<&str> = self.components.iter().map(Component::name).collect();
    let theirs: BTreeSet<&str> = checkpoint.component_states.keys().map(String::as_str).collect();
    if let Some(missing) = ours.difference(&theirs).next() {
      return Err(RestoreError::TopologyMismatch(format!(
        "checkpoint has no state for component '{missing}'"
      )));
    }
    if let Some(extra) = theirs.difference(&ours).next() {
      return Err(RestoreError::TopologyMismatch(format!(
        "checkpoint holds unknown component '{extra}'"
      )));
    }

    let mut ports = BTreeMap::new();
    for (idx, component) in self.components.iter().enumerate() {
      for name in component.port_offsets().into_keys() {
        ports.insert(port_key(component.name(), &name), (idx, name));
      }
    }
    if let Some(key) = checkpoint.port_offsets.keys().find(|key| !ports.contains_key(*key)) {
      return Err(RestoreError::TopologyMismatch(format!("checkpoint holds unknown port '{key}'")));
    }
    if let Some(key) = checkpoint.in_flight.keys().find(|key| !self.channels.contains_key(*key)) {
      return Err(RestoreError::TopologyMismatch(format!(
        "checkpoint holds in-flight items for unbound input '{key}'"
      )));
    }
    Ok(ports)
  }

  /// Spawns every component and the error collectors.
  pub fn start(self) -> RunningGraph {
    RunningGraph::start(self)
  }
}

impl std::fmt::Debug for Graph {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Graph")
      .field("system", &self.system)
      .field("components", &self.components)
      .field("ingress", &self.senders.keys().collect::<Vec<_>>())
      .field("restored", &self.restored)
      .finish()
  }
}
