//! The contract between the runtime and generated component bodies.
//!
//! A body declares its ports, may prepare and release resources, and
//! implements the one per-item method of its shape. The runtime calls
//! nothing else and never inspects the body beyond these methods.

use super::state::KvStore;
use crate::checkpoint::{IdempotencyStore, payload_hash};
use crate::error::{BodyError, StoreError};
use crate::port::PortSpec;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Methods shared by every body.
#[async_trait]
pub trait ComponentBody: Send {
  /// Ports this body needs. Called once, at construction.
  fn configure_ports(&self) -> Vec<PortSpec>;

  /// Runs before the first item.
  async fn setup(&mut self, _ctx: &mut ComponentContext) -> Result<(), BodyError> {
    Ok(())
  }

  /// Runs after the last item, also after cancellation or a crash.
  async fn cleanup(&mut self, _ctx: &mut ComponentContext) -> Result<(), BodyError> {
    Ok(())
  }

  /// Opaque state captured by checkpoints.
  fn snapshot(&self) -> Result<Value, BodyError> {
    Ok(Value::Null)
  }

  /// Reinstates a state produced by [`snapshot`](Self::snapshot).
  fn restore(&mut self, _state: Value) -> Result<(), BodyError> {
    Ok(())
  }
}

/// Per-item method of a Source.
#[async_trait]
pub trait SourceBody: ComponentBody {
  /// Next value, or `None` when the generator is exhausted.
  async fn produce(&mut self, ctx: &mut ComponentContext) -> Result<Option<Value>, BodyError>;
}

/// Per-item method of a Sink.
#[async_trait]
pub trait SinkBody: ComponentBody {
  /// Consumes one item received on `port`.
  async fn consume(
    &mut self,
    port: &str,
    item: Value,
    ctx: &mut ComponentContext,
  ) -> Result<(), BodyError>;
}

/// Per-item method of a Transformer.
#[async_trait]
pub trait TransformerBody: ComponentBody {
  /// Exactly one output per input.
  async fn transform(&mut self, item: Value, ctx: &mut ComponentContext) -> Result<Value, BodyError>;
}

/// Per-item method of a Splitter.
#[async_trait]
pub trait SplitterBody: ComponentBody {
  /// Names of the data outputs that receive `item`. Must be a pure function
  /// of the item and the body state.
  async fn route(&mut self, item: &Value, ctx: &mut ComponentContext) -> Result<Vec<String>, BodyError>;
}

/// Per-item methods of a Merger.
#[async_trait]
pub trait MergerBody: ComponentBody {
  /// Combines one item from `port`; `Some` is forwarded to the output.
  async fn merge(
    &mut self,
    port: &str,
    item: Value,
    ctx: &mut ComponentContext,
  ) -> Result<Option<Value>, BodyError>;

  /// Called once every input reached end-of-stream.
  async fn flush(&mut self, _ctx: &mut ComponentContext) -> Result<Option<Value>, BodyError> {
    Ok(None)
  }
}

/// Runtime services a body may use while processing.
pub struct ComponentContext {
  name: String,
  system_id: String,
  idempotency: Option<Arc<dyn IdempotencyStore>>,
  store: Option<KvStore>,
  delivery: Option<(String, u64)>,
}

impl ComponentContext {
  /// Context for `name` in `system_id` with no services attached.
  pub fn new(name: impl Into<String>, system_id: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      system_id: system_id.into(),
      idempotency: None,
      store: None,
      delivery: None,
    }
  }

  /// Component name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// System id.
  pub fn system_id(&self) -> &str {
    &self.system_id
  }

  pub(crate) fn set_system_id(&mut self, system_id: &str) {
    self.system_id = system_id.to_string();
  }

  pub(crate) fn attach_idempotency(&mut self, store: Arc<dyn IdempotencyStore>) {
    self.idempotency = Some(store);
  }

  pub(crate) fn attach_store(&mut self, store: KvStore) {
    self.store = Some(store);
  }

  /// Marks the item being processed: input `port`, sequence number `seq`.
  pub fn set_delivery(&mut self, port: &str, seq: u64) {
    self.delivery = Some((port.to_string(), seq));
  }

  /// Input port and sequence number of the item being processed.
  pub fn delivery(&self) -> Option<(&str, u64)> {
    self.delivery.as_ref().map(|(port, seq)| (port.as_str(), *seq))
  }

  /// `component.port#seq` for the item being processed.
  ///
  /// Sequence numbers continue across restores, so a replayed item keeps
  /// its key.
  pub fn delivery_key(&self) -> Option<String> {
    self
      .delivery()
      .map(|(port, seq)| format!("{}.{port}#{seq}", self.name))
  }

  /// Whether an idempotency store is attached.
  pub fn has_idempotency(&self) -> bool {
    self.idempotency.is_some()
  }

  /// Runs `op` against the idempotency store on the blocking pool.
  async fn with_idempotency<T, F>(&self, op: F) -> Result<T, BodyError>
  where
    T: Send + 'static,
    F: FnOnce(&dyn IdempotencyStore) -> Result<T, StoreError> + Send + 'static,
  {
    let store = self
      .idempotency
      .as_ref()
      .map(Arc::clone)
      .ok_or_else(|| BodyError::runtime("no idempotency store attached"))?;
    let result = tokio::task::spawn_blocking(move || op(store.as_ref()))
      .await
      .map_err(|e| BodyError::runtime(format!("idempotency store task failed: {e}")))?;
    Ok(result?)
  }

  /// Claims `(key, action)` before a side effect. Returns `true` if the
  /// action already happened and must be skipped.
  pub async fn record_action(&self, key: &str, action: &str, payload: &Value) -> Result<bool, BodyError> {
    let (key, action, hash) = (key.to_string(), action.to_string(), payload_hash(payload));
    let claim = self
      .with_idempotency(move |store| store.claim(&key, &action, &hash))
      .await?;
    Ok(claim.is_done())
  }

  /// Marks a claimed action completed.
  pub async fn complete_action(&self, key: &str, action: &str) -> Result<(), BodyError> {
    let (key, action) = (key.to_string(), action.to_string());
    self
      .with_idempotency(move |store| store.complete(&key, &action))
      .await
  }

  /// Marks a claimed action failed.
  pub async fn fail_action(&self, key: &str, action: &str) -> Result<(), BodyError> {
    let (key, action) = (key.to_string(), action.to_string());
    self
      .with_idempotency(move |store| store.fail(&key, &action))
      .await
  }

  /// The persistent key/value store.
  pub fn store(&mut self) -> Result<&mut KvStore, BodyError> {
    self
      .store
      .as_mut()
      .ok_or_else(|| BodyError::runtime("component is not persistent"))
  }

  pub(crate) fn store_ref(&self) -> Option<&KvStore> {
    self.store.as_ref()
  }
}
