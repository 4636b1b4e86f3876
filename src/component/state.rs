//! State attached to a component by recipe traits: the `persistent`
//! key/value store and the `windowed` accumulation buffer. Both are part of
//! the component's checkpointed state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Key/value store backing a `persistent` Transformer.
///
/// Lives in the component and is captured by every checkpoint, so a restored
/// component sees exactly the values it had at the checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KvStore {
  entries: BTreeMap<String, Value>,
}

impl KvStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Reads a key.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.entries.get(key)
  }

  /// Writes a key, returning the previous value.
  pub fn put(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
    self.entries.insert(key.into(), value)
  }

  /// Removes a key.
  pub fn remove(&mut self, key: &str) -> Option<Value> {
    self.entries.remove(key)
  }

  /// Number of keys.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Whether the store is empty.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// Bounded accumulation buffer backing a `windowed` Merger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowBuffer {
  size: usize,
  items: Vec<Value>,
}

impl WindowBuffer {
  /// Buffer emitting every `size` items (at least 1).
  pub fn new(size: usize) -> Self {
    let size = size.max(1);
    Self {
      size,
      items: Vec::with_capacity(size),
    }
  }

  /// Window size.
  pub fn size(&self) -> usize {
    self.size
  }

  /// Items accumulated so far.
  pub fn pending(&self) -> &[Value] {
    &self.items
  }

  /// Adds one item. Returns the full window as a JSON array when it fills.
  pub fn push(&mut self, item: Value) -> Option<Value> {
    self.items.push(item);
    if self.items.len() >= self.size {
      Some(Value::Array(std::mem::take(&mut self.items)))
    } else {
      None
    }
  }

  /// Emits the partial window, if any.
  pub fn drain(&mut self) -> Option<Value> {
    if self.items.is_empty() {
      None
    } else {
      Some(Value::Array(std::mem::take(&mut self.items)))
    }
  }

  pub(crate) fn restore(&mut self, items: Vec<Value>) {
    self.items = items;
  }
}
