//! Checkpoints and idempotency records: the crash-recovery substrate.
//!
//! A [`Checkpoint`] is a consistent snapshot of a paused graph: every
//! component's opaque state, every port's last sequence number and the
//! values still buffered between components. Checkpoints are written by a
//! [`CheckpointStorage`]; the file backend lays them out as
//! `<root>/checkpoints/<system>/<epoch>/checkpoint.json` and publishes each
//! one with a single directory rename, so a partial checkpoint is never
//! visible.
//!
//! Side effects that must not repeat after a restore are guarded by an
//! [`IdempotencyStore`].

mod barrier;
mod idempotency;
#[cfg(test)]
mod idempotency_test;

pub use barrier::{
  CRASHED_KEY, Deposit, Participant, PauseController, PauseGuard, PauseSignal, SafePoint, crashed_state,
};
pub use idempotency::{
  ActionStatus, Claim, IdempotencyRecord, IdempotencyStore, MemoryIdempotencyStore,
  SqliteIdempotencyStore, payload_hash,
};

use crate::error::CheckpointError;
use crate::recipe::Provenance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const TMP_PREFIX: &str = ".tmp-";

/// Monotonic checkpoint number within one system.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
  /// Creates an epoch from a raw value.
  #[inline]
  pub const fn new(epoch: u64) -> Self {
    Self(epoch)
  }

  /// Returns the raw u64 value.
  #[inline]
  pub const fn as_u64(self) -> u64 {
    self.0
  }

  /// The epoch after this one.
  #[inline]
  pub const fn next(self) -> Self {
    Self(self.0 + 1)
  }
}

impl fmt::Display for Epoch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Snapshot of a paused graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
  /// Checkpoint number.
  pub epoch: Epoch,
  /// When the snapshot was taken.
  pub timestamp: DateTime<Utc>,
  /// System the graph belongs to.
  pub system_id: String,
  /// Component name to opaque state.
  pub component_states: BTreeMap<String, Value>,
  /// `component.port` to the last sequence number sent or received.
  pub port_offsets: BTreeMap<String, u64>,
  /// `component.port` (inputs) to the values buffered in its channel.
  #[serde(default)]
  pub in_flight: BTreeMap<String, Vec<Value>>,
  /// Component name to the recipe that produced it.
  #[serde(default)]
  pub provenance: BTreeMap<String, Provenance>,
}

impl Checkpoint {
  /// Creates an empty checkpoint stamped with the current time.
  pub fn new(epoch: Epoch, system_id: impl Into<String>) -> Self {
    Self {
      epoch,
      timestamp: Utc::now(),
      system_id: system_id.into(),
      component_states: BTreeMap::new(),
      port_offsets: BTreeMap::new(),
      in_flight: BTreeMap::new(),
      provenance: BTreeMap::new(),
    }
  }

  /// Number of buffered values captured across all channels.
  pub fn in_flight_len(&self) -> usize {
    self.in_flight.values().map(Vec::len).sum()
  }
}

/// Storage backend for the checkpoints of one system.
pub trait CheckpointStorage: Send + Sync {
  /// Persists `checkpoint` atomically. Fails if the epoch already exists.
  fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

  /// Loads one epoch.
  fn load(&self, epoch: Epoch) -> Result<Checkpoint, CheckpointError>;

  /// Stored epochs, ascending.
  fn list(&self) -> Result<Vec<Epoch>, CheckpointError>;

  /// Deletes all but the newest `retain` epochs. Returns the deleted ones.
  fn prune(&self, retain: usize) -> Result<Vec<Epoch>, CheckpointError>;

  /// Newest checkpoint that loads cleanly. Unreadable epochs are skipped
  /// with a warning.
  fn latest_valid(&self) -> Result<Option<Checkpoint>, CheckpointError> {
    for epoch in self.list()?.into_iter().rev() {
      match self.load(epoch) {
        Ok(checkpoint) => return Ok(Some(checkpoint)),
        Err(e) => warn!(epoch = epoch.as_u64(), error = %e, "skipping unreadable checkpoint"),
      }
    }
    Ok(None)
  }

  /// Epoch the next checkpoint should use.
  fn next_epoch(&self) -> Result<Epoch, CheckpointError> {
    Ok(self.list()?.last().map_or(Epoch::new(1), |epoch| epoch.next()))
  }
}

/// File-based checkpoint storage.
///
/// Each checkpoint is a directory `<base>/<epoch>/` holding
/// `checkpoint.json`. It is written into a `.tmp-*` sibling, fsynced and
/// renamed into place.
pub struct FileCheckpointStorage {
  base_path: PathBuf,
}

impl FileCheckpointStorage {
  /// Storage rooted directly at `base_path`.
  pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
    Self {
      base_path: base_path.as_ref().to_path_buf(),
    }
  }

  /// Storage for `system` under the runtime root:
  /// `<root>/checkpoints/<system>/`.
  pub fn for_system<P: AsRef<Path>>(root: P, system: &str) -> Self {
    Self::new(root.as_ref().join("checkpoints").join(system))
  }

  /// Directory holding the epochs.
  pub fn base_path(&self) -> &Path {
    &self.base_path
  }

  fn checkpoint_dir(&self, epoch: Epoch) -> PathBuf {
    self.base_path.join(epoch.as_u64().to_string())
  }

  fn sync_base(&self) -> Result<(), CheckpointError> {
    #[cfg(unix)]
    fs::File::open(&self.base_path)?.sync_all()?;
    Ok(())
  }
}

impl CheckpointStorage for FileCheckpointStorage {
  fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    fs::create_dir_all(&self.base_path)?;
    let dir = self.checkpoint_dir(checkpoint.epoch);
    if dir.exists() {
      return Err(CheckpointError::Writer(format!(
        "epoch {} already exists",
        checkpoint.epoch
      )));
    }

    let staging = tempfile::Builder::new()
      .prefix(TMP_PREFIX)
      .tempdir_in(&self.base_path)?;
    let mut file = fs::File::create(staging.path().join(CHECKPOINT_FILE))?;
    serde_json::to_writer_pretty(&mut file, checkpoint)?;
    file.sync_all()?;
    drop(file);

    fs::rename(staging.path(), &dir)?;
    self.sync_base()?;
    debug!(epoch = checkpoint.epoch.as_u64(), path = %dir.display(), "checkpoint published");
    Ok(())
  }

  fn load(&self, epoch: Epoch) -> Result<Checkpoint, CheckpointError> {
    let dir = self.checkpoint_dir(epoch);
    if !dir.exists() {
      return Err(CheckpointError::NotFound(epoch.as_u64()));
    }

    let json = fs::read_to_string(dir.join(CHECKPOINT_FILE)).map_err(|e| {
      CheckpointError::Corrupt {
        epoch: epoch.as_u64(),
        message: e.to_string(),
      }
    })?;
    let checkpoint: Checkpoint =
      serde_json::from_str(&json).map_err(|e| CheckpointError::Corrupt {
        epoch: epoch.as_u64(),
        message: e.to_string(),
      })?;
    if checkpoint.epoch != epoch {
      return Err(CheckpointError::Corrupt {
        epoch: epoch.as_u64(),
        message: format!("file records epoch {}", checkpoint.epoch),
      });
    }
    Ok(checkpoint)
  }

  fn list(&self) -> Result<Vec<Epoch>, CheckpointError> {
    if !self.base_path.exists() {
      return Ok(Vec::new());
    }
    let mut epochs = Vec::new();
    for entry in fs::read_dir(&self.base_path)? {
      let entry = entry?;
      if !entry.file_type()?.is_dir() {
        continue;
      }
      if let Some(epoch) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
        epochs.push(Epoch::new(epoch));
      }
    }
    epochs.sort();
    Ok(epochs)
  }

  fn prune(&self, retain: usize) -> Result<Vec<Epoch>, CheckpointError> {
    let epochs = self.list()?;
    let excess = epochs.len().saturating_sub(retain);
    let mut removed = Vec::with_capacity(excess);
    for epoch in epochs.into_iter().take(excess) {
      fs::remove_dir_all(self.checkpoint_dir(epoch))?;
      removed.push(epoch);
    }

    if self.base_path.exists() {
      for entry in fs::read_dir(&self.base_path)? {
        let entry = entry?;
        let stale = entry
          .file_name()
          .to_str()
          .is_some_and(|name| name.starts_with(TMP_PREFIX));
        if stale {
          debug!(path = %entry.path().display(), "removing stale staging directory");
          fs::remove_dir_all(entry.path())?;
        }
      }
    }
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::TempDir;

  fn sample(epoch: u64) -> Checkpoint {
    let mut checkpoint = Checkpoint::new(Epoch::new(epoch), "orders");
    checkpoint
      .component_states
      .insert("counter".into(), json!({"body": {"count": 40}}));
    checkpoint.port_offsets.insert("counter.in_items".into(), 40);
    checkpoint
      .in_flight
      .insert("counter.in_items".into(), vec![json!(41), json!(42)]);
    checkpoint
  }

  #[test]
  fn file_checkpoint_storage_save_load() {
    let tmp = TempDir::new().unwrap();
    let storage = FileCheckpointStorage::for_system(tmp.path(), "orders");

    let checkpoint = sample(1);
    storage.save(&checkpoint).unwrap();

    let path = tmp.path().join("checkpoints/orders/1/checkpoint.json");
    assert!(path.exists());
    assert_eq!(storage.load(Epoch::new(1)).unwrap(), checkpoint);
    assert_eq!(checkpoint.in_flight_len(), 2);
  }

  #[test]
  fn file_checkpoint_storage_refuses_to_overwrite() {
    let tmp = TempDir::new().unwrap();
    let storage = FileCheckpointStorage::new(tmp.path());
    storage.save(&sample(1)).unwrap();
    assert!(matches!(
      storage.save(&sample(1)),
      Err(CheckpointError::Writer(_))
    ));
  }

  #[test]
  fn list_ignores_staging_directories() {
    let tmp = TempDir::new().unwrap();
    let storage = FileCheckpointStorage::new(tmp.path());
    storage.save(&sample(2)).unwrap();
    storage.save(&sample(1)).unwrap();
    fs::create_dir_all(tmp.path().join(".tmp-abandoned")).unwrap();
    fs::create_dir_all(tmp.path().join("not-an-epoch")).unwrap();

    assert_eq!(storage.list().unwrap(), vec![Epoch::new(1), Epoch::new(2)]);
    assert_eq!(storage.next_epoch().unwrap(), Epoch::new(3));
  }

  #[test]
  fn prune_keeps_newest_and_sweeps_staging() {
    let tmp = TempDir::new().unwrap();
    let storage = FileCheckpointStorage::new(tmp.path());
    for epoch in 1..=5 {
      storage.save(&sample(epoch)).unwrap();
    }
    fs::create_dir_all(tmp.path().join(".tmp-crashed")).unwrap();

    let removed = storage.prune(2).unwrap();
    assert_eq!(removed, vec![Epoch::new(1), Epoch::new(2), Epoch::new(3)]);
    assert_eq!(storage.list().unwrap(), vec![Epoch::new(4), Epoch::new(5)]);
    assert!(!tmp.path().join(".tmp-crashed").exists());
  }

  #[test]
  fn latest_valid_skips_corrupt_epochs() {
    let tmp = TempDir::new().unwrap();
    let storage = FileCheckpointStorage::new(tmp.path());
    storage.save(&sample(1)).unwrap();
    storage.save(&sample(2)).unwrap();
    fs::write(tmp.path().join("2").join(CHECKPOINT_FILE), "{ truncated").unwrap();

    assert!(matches!(
      storage.load(Epoch::new(2)),
      Err(CheckpointError::Corrupt { epoch: 2, .. })
    ));
    let latest = storage.latest_valid().unwrap().unwrap();
    assert_eq!(latest.epoch, Epoch::new(1));
  }

  #[test]
  fn missing_epoch_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let storage = FileCheckpointStorage::new(tmp.path());
    assert!(matches!(
      storage.load(Epoch::new(9)),
      Err(CheckpointError::NotFound(9))
    ));
    assert!(storage.latest_valid().unwrap().is_none());
    assert_eq!(storage.next_epoch().unwrap(), Epoch::new(1));
  }
}
