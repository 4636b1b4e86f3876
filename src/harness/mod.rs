//! # Harness
//!
//! Turns a validated [`Topology`] into a running system:
//!
//! 1. every component is expanded from its recipe;
//! 2. each binding gets one bounded channel, checked for schema
//!    compatibility and for internal-only blocking policies;
//! 3. declared ingress ports get senders for callers outside the graph;
//! 4. `err_` ports the topology left unbound go to an error collector;
//! 5. optionally, a checkpoint is restored before anything runs.
//!
//! Once started, the graph checkpoints itself every
//! [`checkpoint_interval_secs`](crate::config::RuntimeConfig::checkpoint_interval_secs)
//! and on demand through [`RunningGraph::checkpoint_now`].
//!
//! ```rust,no_run
//! use portweave::config::RuntimeConfig;
//! use portweave::harness::{Harness, Topology};
//! use portweave::recipe::RecipeLibrary;
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let topology = Topology::new("numbers")
//!   .component("numbers", "range_source", json!({"start": 1, "end": 100}))
//!   .component("count", "counting_sink", json!({}))
//!   .bind(("numbers", "out_items"), ("count", "in_items"));
//! let harness = Harness::new(RuntimeConfig::default(), RecipeLibrary::with_builtins());
//! let report = harness.wire(&topology)?.start().wait().await;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

mod collector;
mod graph;
mod running;
mod status;
mod topology;
mod wiring;

#[cfg(test)]
mod harness_test;

pub use collector::ErrorLog;
pub use graph::Graph;
pub use running::{RunReport, RunningGraph};
pub use status::{ComponentStatus, RunState, SystemStatus};
pub use topology::{Binding, ComponentDecl, PortRef, Topology};

use crate::checkpoint::{CheckpointStorage, IdempotencyStore};
use crate::config::RuntimeConfig;
use crate::error::WiringError;
use crate::recipe::RecipeLibrary;
use std::sync::Arc;

/// Wires topologies against one recipe library and configuration.
pub struct Harness {
  config: RuntimeConfig,
  library: RecipeLibrary,
  idempotency: Option<Arc<dyn IdempotencyStore>>,
  storage: Option<Arc<dyn CheckpointStorage>>,
}

impl Harness {
  /// Harness with file-based checkpoints and an SQLite idempotency store,
  /// both under `config.root`.
  pub fn new(config: RuntimeConfig, library: RecipeLibrary) -> Self {
    Self {
      config,
      library,
      idempotency: None,
      storage: None,
    }
  }

  /// Uses `store` instead of opening the SQLite store.
  pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
    self.idempotency = Some(store);
    self
  }

  /// Uses `storage` instead of the per-system checkpoint directory.
  pub fn with_checkpoint_storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
    self.storage = Some(storage);
    self
  }

  /// Runtime configuration.
  pub fn config(&self) -> &RuntimeConfig {
    &self.config
  }

  /// Recipe library.
  pub fn library(&self) -> &RecipeLibrary {
    &self.library
  }

  /// Expands and binds `topology`.
  ///
  /// # Errors
  ///
  /// Any [`WiringError`]; nothing is spawned when wiring fails.
  pub fn wire(&self, topology: &Topology) -> Result<Graph, WiringError> {
    wiring::wire(self, topology)
  }
}
