use super::*;
use crate::error::StoreError;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tempfile::TempDir;

fn stores() -> Vec<(&'static str, Box<dyn IdempotencyStore>)> {
  vec![
    (
      "memory",
      Box::new(MemoryIdempotencyStore::new()) as Box<dyn IdempotencyStore>,
    ),
    (
      "sqlite",
      Box::new(SqliteIdempotencyStore::in_memory().unwrap()) as Box<dyn IdempotencyStore>,
    ),
  ]
}

// ============================================================================
// record_action
// ============================================================================

#[test]
fn test_record_action_twice_runs_side_effect_once() {
  for (backend, store) in stores() {
    let mut executed = 0;
    for _ in 0..2 {
      if !store.record_action("order-7", "charge").unwrap() {
        executed += 1;
        store.complete("order-7", "charge").unwrap();
      }
    }
    assert_eq!(executed, 1, "{backend}");
  }
}

#[test]
fn test_started_in_same_run_is_suppressed() {
  for (backend, store) in stores() {
    assert_eq!(store.claim("k", "a", "h").unwrap(), Claim::Fresh, "{backend}");
    assert_eq!(store.claim("k", "a", "h").unwrap(), Claim::InProgress, "{backend}");
    assert!(store.record_action("k", "a").unwrap(), "{backend}");
  }
}

#[test]
fn test_failed_action_can_be_reclaimed() {
  for (backend, store) in stores() {
    store.claim("k", "a", "h").unwrap();
    store.fail("k", "a").unwrap();
    assert_eq!(store.claim("k", "a", "h").unwrap(), Claim::Reclaimed, "{backend}");
    let record = store.get("k", "a").unwrap().unwrap();
    assert_eq!(record.status, ActionStatus::Started, "{backend}");
  }
}

#[test]
fn test_completing_unknown_pair_is_an_error() {
  for (backend, store) in stores() {
    assert!(
      matches!(store.complete("missing", "a"), Err(StoreError::Corrupt(_))),
      "{backend}"
    );
  }
}

// ============================================================================
// Crash recovery across runs
// ============================================================================

#[test]
fn test_new_run_reclaims_abandoned_start_but_not_completion() {
  let tmp = TempDir::new().unwrap();
  let path = tmp.path().join("state").join("idempotency.sqlite3");

  {
    let first = SqliteIdempotencyStore::open(&path).unwrap();
    first.claim("1", "write", "h1").unwrap();
    first.complete("1", "write").unwrap();
    first.claim("2", "write", "h2").unwrap();
  }

  let second = SqliteIdempotencyStore::open(&path).unwrap();
  assert_eq!(second.claim("1", "write", "h1").unwrap(), Claim::Completed);
  assert_eq!(second.claim("2", "write", "h2").unwrap(), Claim::Reclaimed);
  let record = second.get("2", "write").unwrap().unwrap();
  assert_eq!(record.run_id, second.run_id());
}

// ============================================================================
// Records and retention
// ============================================================================

#[test]
fn test_records_keep_hash_and_order() {
  for (backend, store) in stores() {
    let hash = payload_hash(&json!({"id": 2}));
    store.claim("b", "x", &hash).unwrap();
    store.claim("a", "x", "").unwrap();
    store.complete("b", "x").unwrap();

    let records = store.records().unwrap();
    let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b"], "{backend}");
    assert_eq!(records[1].payload_hash, hash, "{backend}");
    assert_eq!(records[1].status, ActionStatus::Completed, "{backend}");
  }
}

#[test]
fn test_prune_before_cutoff() {
  for (backend, store) in stores() {
    store.claim("old", "a", "").unwrap();
    store.complete("old", "a").unwrap();
    assert_eq!(
      store.prune_before(Utc::now() - ChronoDuration::days(7)).unwrap(),
      0,
      "{backend}"
    );
    assert_eq!(
      store.prune_before(Utc::now() + ChronoDuration::seconds(1)).unwrap(),
      1,
      "{backend}"
    );
    assert!(store.records().unwrap().is_empty(), "{backend}");
  }
}

#[test]
fn test_payload_hash_is_sha256_hex() {
  let hash = payload_hash(&json!("abc"));
  assert_eq!(hash.len(), 64);
  assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  assert_eq!(hash, payload_hash(&json!("abc")));
  assert_ne!(hash, payload_hash(&json!("abd")));
}
