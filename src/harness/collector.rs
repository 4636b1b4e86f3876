//! Sink for `err_` ports the topology left unbound.
//!
//! Each such port is bound to a collector input; one task per port drains
//! it into a bounded in-memory log and logs every envelope at `warn`.

use crate::envelope::ErrorEnvelope;
use crate::port::{InputPort, Received};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::warn;

/// Most recent envelopes seen by the collector, oldest first.
pub struct ErrorLog {
  capacity: usize,
  entries: Mutex<VecDeque<ErrorEnvelope>>,
  total: AtomicU64,
}

impl ErrorLog {
  /// Log keeping the last `capacity` envelopes.
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      entries: Mutex::new(VecDeque::new()),
      total: AtomicU64::new(0),
    }
  }

  fn entries(&self) -> MutexGuard<'_, VecDeque<ErrorEnvelope>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Records one envelope, evicting the oldest when full.
  pub fn push(&self, envelope: ErrorEnvelope) {
    let mut entries = self.entries();
    if entries.len() == self.capacity {
      entries.pop_front();
    }
    entries.push_back(envelope);
    self.total.fetch_add(1, Ordering::Relaxed);
  }

  /// Copy of the retained envelopes.
  pub fn snapshot(&self) -> Vec<ErrorEnvelope> {
    self.entries().iter().cloned().collect()
  }

  /// Envelopes seen since start, including evicted ones.
  pub fn total(&self) -> u64 {
    self.total.load(Ordering::Relaxed)
  }
}

/// Drains `input` (bound to `origin`, an `err_` port) into `log` until the
/// port closes.
pub(super) fn spawn(origin: String, input: InputPort, log: Arc<ErrorLog>) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      match input.receive().await {
        Ok(Received::Item(delivery)) => record(&origin, delivery.value, &log),
        Ok(Received::EndOfStream) => break,
        Err(e) => warn!(port = %origin, error = %e, "unreadable item on error port"),
      }
    }
  })
}

fn record(origin: &str, value: Value, log: &ErrorLog) {
  match ErrorEnvelope::from_value(value) {
    Ok(envelope) => {
      warn!(
        port = %origin,
        component = %envelope.component,
        category = %envelope.category,
        offset = ?envelope.input_offset,
        message = %envelope.message,
        "error envelope"
      );
      log.push(envelope);
    }
    Err(e) => warn!(port = %origin, error = %e, "malformed error envelope"),
  }
}
