//! Duplicate-action suppression across restarts.
//!
//! A side-effecting action is identified by `(key, action)`. Before running
//! it a body claims the pair; the claim says whether the action already
//! happened. After the side effect the body marks the record completed.
//!
//! Each store instance carries a run id. A `started` record left behind by
//! an earlier run means that run died mid-action, so the pair may be
//! reclaimed. A `started` record of the current run is a duplicate delivery
//! and is suppressed.

use crate::error::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Lifecycle of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
  /// The action began and has not finished.
  Started,
  /// The side effect happened.
  Completed,
  /// The action failed and may be retried.
  Failed,
}

impl ActionStatus {
  fn as_str(self) -> &'static str {
    match self {
      ActionStatus::Started => "started",
      ActionStatus::Completed => "completed",
      ActionStatus::Failed => "failed",
    }
  }
}

impl fmt::Display for ActionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ActionStatus {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "started" => Ok(ActionStatus::Started),
      "completed" => Ok(ActionStatus::Completed),
      "failed" => Ok(ActionStatus::Failed),
      other => Err(StoreError::Corrupt(format!("unknown status '{other}'"))),
    }
  }
}

/// Result of claiming `(key, action)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
  /// No record existed; one was inserted as `started`.
  Fresh,
  /// A `started` record of an earlier run, or a `failed` record, was taken
  /// over.
  Reclaimed,
  /// This run already started the action.
  InProgress,
  /// The action completed before.
  Completed,
}

impl Claim {
  /// Whether the caller must skip the side effect.
  pub fn is_done(self) -> bool {
    matches!(self, Claim::InProgress | Claim::Completed)
  }
}

/// One stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
  /// Business key.
  pub key: String,
  /// Action name.
  pub action: String,
  /// Current status.
  pub status: ActionStatus,
  /// SHA-256 of the payload, hex.
  pub payload_hash: String,
  /// Run that last touched the record.
  pub run_id: String,
  /// Last update.
  pub updated_at: DateTime<Utc>,
}

/// SHA-256 hex digest of the canonical JSON encoding of `payload`.
pub fn payload_hash(payload: &Value) -> String {
  let canonical = serde_json::to_string(payload).unwrap_or_default();
  format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Storage for idempotency records. Every operation is atomic per
/// `(key, action)`.
pub trait IdempotencyStore: Send + Sync {
  /// Run id stamped on records written by this instance.
  fn run_id(&self) -> &str;

  /// Claims `(key, action)` before a side effect.
  fn claim(&self, key: &str, action: &str, payload_hash: &str) -> Result<Claim, StoreError>;

  /// Marks the action completed.
  fn complete(&self, key: &str, action: &str) -> Result<(), StoreError>;

  /// Marks the action failed so a later delivery may retry it.
  fn fail(&self, key: &str, action: &str) -> Result<(), StoreError>;

  /// Reads one record.
  fn get(&self, key: &str, action: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

  /// Every record, ordered by key then action.
  fn records(&self) -> Result<Vec<IdempotencyRecord>, StoreError>;

  /// Deletes records last updated before `cutoff`. Returns how many.
  fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

  /// Returns `true` if the action already happened (or is running in this
  /// run) and must be skipped.
  fn record_action(&self, key: &str, action: &str) -> Result<bool, StoreError> {
    Ok(self.claim(key, action, "")?.is_done())
  }
}

fn decide(existing: Option<(ActionStatus, String)>, run_id: &str) -> Claim {
  match existing {
    None => Claim::Fresh,
    Some((ActionStatus::Completed, _)) => Claim::Completed,
    Some((ActionStatus::Started, owner)) if owner == run_id => Claim::InProgress,
    Some(_) => Claim::Reclaimed,
  }
}

/// In-process store; records are lost with the process.
pub struct MemoryIdempotencyStore {
  run_id: String,
  records: Mutex<BTreeMap<(String, String), IdempotencyRecord>>,
}

impl Default for MemoryIdempotencyStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryIdempotencyStore {
  /// Creates an empty store with a fresh run id.
  pub fn new() -> Self {
    Self {
      run_id: uuid::Uuid::new_v4().to_string(),
      records: Mutex::new(BTreeMap::new()),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<(String, String), IdempotencyRecord>>, StoreError> {
    self.records.lock().map_err(|_| StoreError::LockPoisoned)
  }

  fn set_status(&self, key: &str, action: &str, status: ActionStatus) -> Result<(), StoreError> {
    let mut records = self.lock()?;
    let record = records
      .get_mut(&(key.to_string(), action.to_string()))
      .ok_or_else(|| StoreError::Corrupt(format!("no record for ({key}, {action})")))?;
    record.status = status;
    record.run_id = self.run_id.clone();
    record.updated_at = Utc::now();
    Ok(())
  }
}

impl IdempotencyStore for MemoryIdempotencyStore {
  fn run_id(&self) -> &str {
    &self.run_id
  }

  fn claim(&self, key: &str, action: &str, payload_hash: &str) -> Result<Claim, StoreError> {
    let mut records = self.lock()?;
    let id = (key.to_string(), action.to_string());
    let claim = decide(
      records.get(&id).map(|r| (r.status, r.run_id.clone())),
      &self.run_id,
    );
    if matches!(claim, Claim::Fresh | Claim::Reclaimed) {
      records.insert(
        id,
        IdempotencyRecord {
          key: key.to_string(),
          action: action.to_string(),
          status: ActionStatus::Started,
          payload_hash: payload_hash.to_string(),
          run_id: self.run_id.clone(),
          updated_at: Utc::now(),
        },
      );
    }
    Ok(claim)
  }

  fn complete(&self, key: &str, action: &str) -> Result<(), StoreError> {
    self.set_status(key, action, ActionStatus::Completed)
  }

  fn fail(&self, key: &str, action: &str) -> Result<(), StoreError> {
    self.set_status(key, action, ActionStatus::Failed)
  }

  fn get(&self, key: &str, action: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
    Ok(
      self
        .lock()?
        .get(&(key.to_string(), action.to_string()))
        .cloned(),
    )
  }

  fn records(&self) -> Result<Vec<IdempotencyRecord>, StoreError> {
    Ok(self.lock()?.values().cloned().collect())
  }

  fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
    let mut records = self.lock()?;
    let before = records.len();
    records.retain(|_, record| record.updated_at >= cutoff);
    Ok(before - records.len())
  }
}

/// Idempotent DDL for the record table.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS idempotency_records (
    key TEXT NOT NULL,
    action TEXT NOT NULL,
    status TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    run_id TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (key, action)
);

CREATE INDEX IF NOT EXISTS idx_idempotency_updated_at ON idempotency_records (updated_at);
";

/// `SQLite`-backed store.
///
/// Uses a single `Mutex<Connection>`; each claim runs in an immediate
/// transaction so two claims of the same pair never interleave, even across
/// processes sharing the file.
pub struct SqliteIdempotencyStore {
  run_id: String,
  conn: Mutex<Connection>,
}

impl SqliteIdempotencyStore {
  /// Opens or creates the database at `path`.
  ///
  /// # Errors
  ///
  /// Returns [`StoreError::Io`] if the directory can't be created,
  /// or [`StoreError::Backend`] if the database can't be opened.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path).map_err(StoreError::backend)?;
    Self::init(conn)
  }

  /// In-memory database, for tests.
  pub fn in_memory() -> Result<Self, StoreError> {
    let conn = Connection::open_in_memory().map_err(StoreError::backend)?;
    Self::init(conn)
  }

  fn init(conn: Connection) -> Result<Self, StoreError> {
    conn
      .execute_batch(CREATE_TABLES)
      .map_err(StoreError::backend)?;
    let run_id = uuid::Uuid::new_v4().to_string();
    debug!(run_id = %run_id, "idempotency store opened");
    Ok(Self {
      run_id,
      conn: Mutex::new(conn),
    })
  }

  fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }

  fn set_status(&self, key: &str, action: &str, status: ActionStatus) -> Result<(), StoreError> {
    let conn = self.lock_conn()?;
    let updated = conn
      .execute(
        "UPDATE idempotency_records SET status = ?3, run_id = ?4, updated_at = ?5 \
         WHERE key = ?1 AND action = ?2",
        params![key, action, status.as_str(), self.run_id, timestamp(Utc::now())],
      )
      .map_err(StoreError::backend)?;
    if updated == 0 {
      return Err(StoreError::Corrupt(format!("no record for ({key}, {action})")));
    }
    Ok(())
  }

  fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, String, String)> {
    Ok((
      row.get(0)?,
      row.get(1)?,
      row.get(2)?,
      row.get(3)?,
      row.get(4)?,
      row.get(5)?,
    ))
  }

  fn decode(
    (key, action, status, payload_hash, run_id, updated_at): (String, String, String, String, String, String),
  ) -> Result<IdempotencyRecord, StoreError> {
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
      .map_err(|e| StoreError::Corrupt(format!("updated_at '{updated_at}': {e}")))?
      .with_timezone(&Utc);
    Ok(IdempotencyRecord {
      key,
      action,
      status: status.parse()?,
      payload_hash,
      run_id,
      updated_at,
    })
  }
}

impl IdempotencyStore for SqliteIdempotencyStore {
  fn run_id(&self) -> &str {
    &self.run_id
  }

  fn claim(&self, key: &str, action: &str, payload_hash: &str) -> Result<Claim, StoreError> {
    let mut conn = self.lock_conn()?;
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(StoreError::backend)?;

    let existing: Option<(String, String)> = tx
      .query_row(
        "SELECT status, run_id FROM idempotency_records WHERE key = ?1 AND action = ?2",
        params![key, action],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(StoreError::backend)?;
    let existing = match existing {
      Some((status, owner)) => Some((status.parse::<ActionStatus>()?, owner)),
      None => None,
    };

    let claim = decide(existing, &self.run_id);
    if matches!(claim, Claim::Fresh | Claim::Reclaimed) {
      tx.execute(
        "INSERT INTO idempotency_records (key, action, status, payload_hash, run_id, updated_at) \
         VALUES (?1, ?2, 'started', ?3, ?4, ?5) \
         ON CONFLICT (key, action) DO UPDATE SET \
           status = excluded.status, payload_hash = excluded.payload_hash, \
           run_id = excluded.run_id, updated_at = excluded.updated_at",
        params![key, action, payload_hash, self.run_id, timestamp(Utc::now())],
      )
      .map_err(StoreError::backend)?;
    }
    tx.commit().map_err(StoreError::backend)?;
    Ok(claim)
  }

  fn complete(&self, key: &str, action: &str) -> Result<(), StoreError> {
    self.set_status(key, action, ActionStatus::Completed)
  }

  fn fail(&self, key: &str, action: &str) -> Result<(), StoreError> {
    self.set_status(key, action, ActionStatus::Failed)
  }

  fn get(&self, key: &str, action: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
    let conn = self.lock_conn()?;
    let row = conn
      .query_row(
        "SELECT key, action, status, payload_hash, run_id, updated_at \
         FROM idempotency_records WHERE key = ?1 AND action = ?2",
        params![key, action],
        Self::row_to_record,
      )
      .optional()
      .map_err(StoreError::backend)?;
    row.map(Self::decode).transpose()
  }

  fn records(&self) -> Result<Vec<IdempotencyRecord>, StoreError> {
    let conn = self.lock_conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT key, action, status, payload_hash, run_id, updated_at \
         FROM idempotency_records ORDER BY key, action",
      )
      .map_err(StoreError::backend)?;
    let rows = stmt
      .query_map([], Self::row_to_record)
      .map_err(StoreError::backend)?;
    let mut records = Vec::new();
    for row in rows {
      records.push(Self::decode(row.map_err(StoreError::backend)?)?);
    }
    Ok(records)
  }

  fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
    let conn = self.lock_conn()?;
    conn
      .execute(
        "DELETE FROM idempotency_records WHERE updated_at < ?1",
        params![timestamp(cutoff)],
      )
      .map_err(StoreError::backend)
  }
}
