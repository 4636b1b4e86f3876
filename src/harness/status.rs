//! Point-in-time view of a running system, written next to the checkpoints
//! so `portweave status` can read it from another process.

use crate::checkpoint::Epoch;
use crate::component::{ComponentOutcome, Shape};
use crate::metrics::{ComponentMetricsSnapshot, PortMetricsSnapshot};
use crate::recipe::Provenance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Lifecycle state of one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
  /// Task still running (possibly parked for a checkpoint).
  Running,
  /// Finished normally.
  Completed,
  /// Stopped by cancellation.
  Cancelled,
  /// Ended by an unhandled failure.
  Crashed(String),
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RunState::Running => f.write_str("running"),
      RunState::Completed => f.write_str("completed"),
      RunState::Cancelled => f.write_str("cancelled"),
      RunState::Crashed(reason) => write!(f, "crashed: {reason}"),
    }
  }
}

impl From<ComponentOutcome> for RunState {
  fn from(outcome: ComponentOutcome) -> Self {
    match outcome {
      ComponentOutcome::Completed => RunState::Completed,
      ComponentOutcome::Cancelled => RunState::Cancelled,
      ComponentOutcome::Crashed { reason } => RunState::Crashed(reason),
    }
  }
}

/// One component in a [`SystemStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
  /// Component name.
  pub name: String,
  /// Primitive.
  pub shape: Shape,
  /// Recipe the component was expanded from.
  pub provenance: Option<Provenance>,
  /// Lifecycle state.
  pub state: RunState,
  /// Component counters and histograms.
  pub metrics: ComponentMetricsSnapshot,
  /// Per-port counters, keyed by port name.
  pub ports: BTreeMap<String, PortMetricsSnapshot>,
}

/// Status of a whole system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
  /// System id.
  pub system: String,
  /// When the status was taken.
  pub taken_at: DateTime<Utc>,
  /// Newest checkpoint written (or restored) by this run.
  pub last_checkpoint: Option<Epoch>,
  /// Components in topology order.
  pub components: Vec<ComponentStatus>,
  /// Envelopes that reached the error collector.
  pub collected_errors: u64,
}

impl SystemStatus {
  /// Component by name.
  pub fn component(&self, name: &str) -> Option<&ComponentStatus> {
    self.components.iter().find(|c| c.name == name)
  }

  /// Writes the status as JSON, replacing any previous file atomically.
  pub fn write(&self, path: &Path) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, self)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
  }

  /// Reads a status file written by [`write`](Self::write).
  pub fn read(path: &Path) -> io::Result<Self> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(io::Error::other)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::metrics::ComponentMetrics;

  #[test]
  fn status_file_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("status").join("orders.json");
    let status = SystemStatus {
      system: "orders".into(),
      taken_at: Utc::now(),
      last_checkpoint: Some(Epoch::new(4)),
      components: vec![ComponentStatus {
        name: "count".into(),
        shape: Shape::Sink,
        provenance: None,
        state: RunState::Crashed("boom".into()),
        metrics: ComponentMetrics::new("count").snapshot(0),
        ports: BTreeMap::new(),
      }],
      collected_errors: 2,
    };
    status.write(&path).unwrap();
    let read = SystemStatus::read(&path).unwrap();
    assert_eq!(read, status);
    assert_eq!(read.component("count").unwrap().state, RunState::Crashed("boom".into()));
  }
}
