//! Recipes shipped with the crate.
//!
//! Each template reads its config into a typed struct (missing fields take
//! their defaults, unknown fields are rejected) and builds one body.

use super::{BUILTIN_VERSION, BodyTemplate, Contract, Recipe, RecipeTrait};
use crate::component::{
  ComponentBody, ComponentContext, MergerBody, Primitive, Shape, SinkBody, SourceBody,
  SplitterBody, TransformerBody,
};
use crate::checkpoint::payload_hash;
use crate::error::BodyError;
use crate::port::{PortSchema, PortSpec};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub(super) fn recipes() -> Vec<Recipe> {
  let builtin = |name: &str, shape: Shape, build: fn(&Value) -> Result<Primitive, BodyError>| {
    Recipe::new(name, BUILTIN_VERSION, shape, BodyTemplate::Builtin(build))
  };
  vec![
    builtin("range_source", Shape::Source, RangeSource::build).with_trait(RecipeTrait::Ordered),
    builtin("sequence_source", Shape::Source, SequenceSource::build).with_trait(RecipeTrait::Ordered),
    builtin("counting_sink", Shape::Sink, CountingSink::build),
    builtin("jsonl_sink", Shape::Sink, JsonlSink::build).with_contract(Contract::Idempotent),
    builtin("passthrough", Shape::Transformer, Passthrough::build),
    builtin("kv_store", Shape::Transformer, KvTransformer::build).with_trait(RecipeTrait::Persistent),
    builtin("field_router", Shape::Splitter, FieldRouter::build).with_contract(Contract::Deterministic),
    builtin("broadcast", Shape::Splitter, Broadcast::build).with_contract(Contract::Deterministic),
    builtin("round_robin_merge", Shape::Merger, Merge::build).with_trait(RecipeTrait::Ordered),
    builtin("windowed_merge", Shape::Merger, Merge::build).with_trait(RecipeTrait::Windowed),
  ]
}

fn parse<T: DeserializeOwned>(config: &Value) -> Result<T, BodyError> {
  let config = match config {
    Value::Null => json!({}),
    other => other.clone(),
  };
  serde_json::from_value(config).map_err(BodyError::validation)
}

fn restore_field<T: DeserializeOwned>(state: &Value, field: &str) -> Result<T, BodyError> {
  serde_json::from_value(state[field].clone())
    .map_err(|e| BodyError::runtime(format!("bad snapshot field '{field}': {e}")))
}

fn default_out_items() -> String {
  "out_items".to_string()
}

fn default_in_items() -> String {
  "in_items".to_string()
}

// ============================================================================
// Sources
// ============================================================================

fn default_one() -> i64 {
  1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RangeConfig {
  #[serde(default = "default_one")]
  start: i64,
  end: i64,
  #[serde(default = "default_one")]
  step: i64,
  #[serde(default = "default_out_items")]
  port: String,
}

/// Integers from `start` to `end` inclusive.
struct RangeSource {
  config: RangeConfig,
  next: Option<i64>,
}

impl RangeSource {
  fn build(config: &Value) -> Result<Primitive, BodyError> {
    let config: RangeConfig = parse(config)?;
    if config.step == 0 {
      return Err(BodyError::validation("step must not be 0"));
    }
    Ok(Primitive::source(Self {
      next: Some(config.start),
      config,
    }))
  }
}

#[async_trait]
impl ComponentBody for RangeSource {
  fn configure_ports(&self) -> Vec<PortSpec> {
    vec![PortSpec::output(&self.config.port).with_schema(PortSchema::of_type("integer"))]
  }

  fn snapshot(&self) -> Result<Value, BodyError> {
    Ok(json!({ "next": self.next }))
  }

  fn restore(&mut self, state: Value) -> Result<(), BodyError> {
    self.next = restore_field(&state, "next")?;
    Ok(())
  }
}

#[async_trait]
impl SourceBody for RangeSource {
  async fn produce(&mut self, _ctx: &mut ComponentContext) -> Result<Option<Value>, BodyError> {
    let RangeConfig { end, step, .. } = self.config;
    let current = match self.next {
      Some(next) if (step > 0 && next <= end) || (step < 0 && next >= end) => next,
      _ => return Ok(None),
    };
    self.next = current.checked_add(step);
    Ok(Some(json!(current)))
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SequenceConfig {
  items: Vec<Value>,
  #[serde(default = "default_out_items")]
  port: String,
}

/// A fixed list of values, in order.
struct SequenceSource {
  config: SequenceConfig,
  index: usize,
}

impl SequenceSource {
  fn build(config: &Value) -> Result<Primitive, BodyError> {
    Ok(Primitive::source(Self {
      config: parse(config)?,
      index: 0,
    }))
  }
}

#[async_trait]
impl ComponentBody for SequenceSource {
  fn configure_ports(&self) -> Vec<PortSpec> {
    vec![PortSpec::output(&self.config.port)]
  }

  fn snapshot(&self) -> Result<Value, BodyError> {
    Ok(json!({ "index": self.index }))
  }

  fn restore(&mut self, state: Value) -> Result<(), BodyError> {
    self.index = restore_field(&state, "index")?;
    Ok(())
  }
}

#[async_trait]
impl SourceBody for SequenceSource {
  async fn produce(&mut self, _ctx: &mut ComponentContext) -> Result<Option<Value>, BodyError> {
    let item = self.config.items.get(self.index).cloned();
    if item.is_some() {
      self.index += 1;
    }
    Ok(item)
  }
}

// ============================================================================
// Sinks
// ============================================================================

fn default_inputs() -> Vec<String> {
  vec![default_in_items()]
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CountingConfig {
  #[serde(default = "default_inputs")]
  inputs: Vec<String>,
}

/// Counts every item it receives, in total and per port.
struct CountingSink {
  inputs: Vec<String>,
  count: u64,
  per_port: BTreeMap<String, u64>,
}

impl CountingSink {
  fn build(config: &Value) -> Result<Primitive, BodyError> {
    let config: CountingConfig = parse(config)?;
    Ok(Primitive::sink(Self {
      inputs: config.inputs,
      count: 0,
      per_port: BTreeMap::new(),
    }))
  }
}

#[async_trait]
impl ComponentBody for CountingSink {
  fn configure_ports(&self) -> Vec<PortSpec> {
    self.inputs.iter().map(PortSpec::input).collect()
  }

  fn snapshot(&self) -> Result<Value, BodyError> {
    Ok(json!({ "count": self.count, "per_port": self.per_port }))
  }

  fn restore(&mut self, state: Value) -> Result<(), BodyError> {
    self.count = restore_field(&state, "count")?;
    self.per_port = restore_field(&state, "per_port")?;
    Ok(())
  }
}

#[async_trait]
impl SinkBody for CountingSink {
  async fn consume(
    &mut self,
    port: &str,
    _item: Value,
    _ctx: &mut ComponentContext,
  ) -> Result<(), BodyError> {
    self.count += 1;
    *self.per_port.entry(port.to_string()).or_default() += 1;
    Ok(())
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonlConfig {
  path: PathBuf,
  #[serde(default)]
  key_field: Option<String>,
  #[serde(default = "default_in_items")]
  input: String,
}

/// Appends each item as one JSON line. Every append is guarded by the
/// idempotency store, so a replayed item is counted but not written twice.
struct JsonlSink {
  config: JsonlConfig,
  file: Option<File>,
  received: u64,
  written: u64,
  skipped: u64,
}

const APPEND_ACTION: &str = "append";

impl JsonlSink {
  fn build(config: &Value) -> Result<Primitive, BodyError> {
    Ok(Primitive::sink(Self {
      config: parse(config)?,
      file: None,
      received: 0,
      written: 0,
      skipped: 0,
    }))
  }

  /// The item's `key_field`, else its delivery (`component.port#seq`).
  fn key(&self, item: &Value, ctx: &ComponentContext) -> String {
    let field = self.config.key_field.as_deref().map(|field| &item[field]);
    match field {
      Some(Value::String(key)) => key.clone(),
      Some(Value::Null) | None => ctx.delivery_key().unwrap_or_else(|| payload_hash(item)),
      Some(other) => other.to_string(),
    }
  }

  async fn append(&mut self, item: &Value) -> Result<(), BodyError> {
    let file = self
      .file
      .as_mut()
      .ok_or_else(|| BodyError::runtime("ledger file is not open"))?;
    let mut line = serde_json::to_vec(item).map_err(BodyError::runtime)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
  }
}

#[async_trait]
impl ComponentBody for JsonlSink {
  fn configure_ports(&self) -> Vec<PortSpec> {
    vec![PortSpec::input(&self.config.input)]
  }

  async fn setup(&mut self, _ctx: &mut ComponentContext) -> Result<(), BodyError> {
    if let Some(parent) = self.config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
      tokio::fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.config.path)
      .await?;
    self.file = Some(file);
    Ok(())
  }

  async fn cleanup(&mut self, _ctx: &mut ComponentContext) -> Result<(), BodyError> {
    if let Some(file) = self.file.take() {
      file.sync_all().await?;
    }
    Ok(())
  }

  fn snapshot(&self) -> Result<Value, BodyError> {
    Ok(json!({
      "received": self.received,
      "written": self.written,
      "skipped": self.skipped,
    }))
  }

  fn restore(&mut self, state: Value) -> Result<(), BodyError> {
    self.received = restore_field(&state, "received")?;
    self.written = restore_field(&state, "written")?;
    self.skipped = restore_field(&state, "skipped")?;
    Ok(())
  }
}

#[async_trait]
impl SinkBody for JsonlSink {
  async fn consume(
    &mut self,
    _port: &str,
    item: Value,
    ctx: &mut ComponentContext,
  ) -> Result<(), BodyError> {
    self.received += 1;
    let key = self.key(&item, ctx);
    if ctx.record_action(&key, APPEND_ACTION, &item).await? {
      debug!(component = ctx.name(), key = %key, "append already done, skipping");
      self.skipped += 1;
      return Ok(());
    }
    match self.append(&item).await {
      Ok(()) => {
        ctx.complete_action(&key, APPEND_ACTION).await?;
        self.written += 1;
        Ok(())
      }
      Err(e) => {
        ctx.fail_action(&key, APPEND_ACTION).await?;
        Err(e)
      }
    }
  }
}

// ============================================================================
// Transformers
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PassthroughConfig {
  #[serde(default = "default_in_items")]
  input: String,
  #[serde(default = "default_out_items")]
  output: String,
  #[serde(default)]
  schema: Option<Value>,
}

/// Forwards items unchanged; with `schema`, both ports validate against it.
struct Passthrough {
  input: PortSpec,
  output: PortSpec,
}

impl Passthrough {
  fn build(config: &Value) -> Result<Primitive, BodyError> {
    let config: PassthroughConfig = parse(config)?;
    let mut input = PortSpec::input(config.input);
    let mut output = PortSpec::output(config.output);
    if let Some(document) = config.schema {
      let schema = PortSchema::json(document).map_err(BodyError::validation)?;
      input = input.with_schema(schema.clone());
      output = output.with_schema(schema);
    }
    Ok(Primitive::transformer(Self { input, output }))
  }
}

#[async_trait]
impl ComponentBody for Passthrough {
  fn configure_ports(&self) -> Vec<PortSpec> {
    vec![self.input.clone(), self.output.clone()]
  }
}

#[async_trait]
impl TransformerBody for Passthrough {
  async fn transform(&mut self, item: Value, _ctx: &mut ComponentContext) -> Result<Value, BodyError> {
    Ok(item)
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KvConfig {
  #[serde(default = "default_kv_input")]
  input: String,
  #[serde(default = "default_kv_output")]
  output: String,
}

fn default_kv_input() -> String {
  "in_commands".to_string()
}

fn default_kv_output() -> String {
  "out_results".to_string()
}

const DEFAULT_KEY: &str = "default";

/// Executes `add`/`put`, `get` and `remove` commands against the persistent
/// store and emits the affected value.
struct KvTransformer {
  config: KvConfig,
}

impl KvTransformer {
  fn build(config: &Value) -> Result<Primitive, BodyError> {
    Ok(Primitive::transformer(Self {
      config: parse(config)?,
    }))
  }
}

#[async_trait]
impl ComponentBody for KvTransformer {
  fn configure_ports(&self) -> Vec<PortSpec> {
    vec![
      PortSpec::input(&self.config.input).with_schema(PortSchema::of_type("object")),
      PortSpec::output(&self.config.output),
    ]
  }
}

#[async_trait]
impl TransformerBody for KvTransformer {
  async fn transform(&mut self, item: Value, ctx: &mut ComponentContext) -> Result<Value, BodyError> {
    let key = match &item["key"] {
      Value::Null => DEFAULT_KEY.to_string(),
      Value::String(key) => key.clone(),
      other => other.to_string(),
    };
    let store = ctx.store()?;
    match item["action"].as_str() {
      Some("add" | "put") => {
        let value = item
          .get("value")
          .cloned()
          .ok_or_else(|| BodyError::validation("add requires a value"))?;
        store.put(key, value.clone());
        Ok(value)
      }
      Some("get") => Ok(store.get(&key).cloned().unwrap_or(Value::Null)),
      Some("remove") => Ok(store.remove(&key).unwrap_or(Value::Null)),
      Some(action) => Err(BodyError::validation(format!("unknown action '{action}'"))),
      None => Err(BodyError::validation("command has no action")),
    }
  }
}

// ============================================================================
// Splitters
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Targets {
  One(String),
  Many(Vec<String>),
}

impl Targets {
  fn ports(&self) -> Vec<String> {
    match self {
      Targets::One(port) => vec![port.clone()],
      Targets::Many(ports) => ports.clone(),
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldRouterConfig {
  field: String,
  routes: BTreeMap<String, Targets>,
  #[serde(default)]
  default: Option<Targets>,
  #[serde(default = "default_in_items")]
  input: String,
}

/// Routes on the value of one field. String values match route keys
/// directly; other values match their JSON text.
struct FieldRouter {
  config: FieldRouterConfig,
}

impl FieldRouter {
  fn build(config: &Value) -> Result<Primitive, BodyError> {
    Ok(Primitive::splitter(Self {
      config: parse(config)?,
    }))
  }
}

#[async_trait]
impl ComponentBody for FieldRouter {
  fn configure_ports(&self) -> Vec<PortSpec> {
    let mut outputs: Vec<String> = self.config.routes.values().flat_map(Targets::ports).collect();
    outputs.extend(self.config.default.iter().flat_map(Targets::ports));
    outputs.sort();
    outputs.dedup();

    let mut ports = vec![PortSpec::input(&self.config.input)];
    ports.extend(outputs.into_iter().map(PortSpec::output));
    ports
  }
}

#[async_trait]
impl SplitterBody for FieldRouter {
  async fn route(&mut self, item: &Value, _ctx: &mut ComponentContext) -> Result<Vec<String>, BodyError> {
    let value = match &item[self.config.field.as_str()] {
      Value::String(value) => value.clone(),
      other => other.to_string(),
    };
    self
      .config
      .routes
      .get(&value)
      .or(self.config.default.as_ref())
      .map(Targets::ports)
      .ok_or_else(|| BodyError::validation(format!("no route for {}={value}", self.config.field)))
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BroadcastConfig {
  outputs: Vec<String>,
  #[serde(default = "default_in_items")]
  input: String,
}

/// Sends every item to every output.
struct Broadcast {
  config: BroadcastConfig,
}

impl Broadcast {
  fn build(config: &Value) -> Result<Primitive, BodyError> {
    Ok(Primitive::splitter(Self {
      config: parse(config)?,
    }))
  }
}

#[async_trait]
impl ComponentBody for Broadcast {
  fn configure_ports(&self) -> Vec<PortSpec> {
    let mut ports = vec![PortSpec::input(&self.config.input)];
    ports.extend(self.config.outputs.iter().map(PortSpec::output));
    ports
  }
}

#[async_trait]
impl SplitterBody for Broadcast {
  async fn route(&mut self, _item: &Value, _ctx: &mut ComponentContext) -> Result<Vec<String>, BodyError> {
    Ok(self.config.outputs.clone())
  }
}

// ============================================================================
// Mergers
// ============================================================================

fn default_merge_inputs() -> Vec<String> {
  vec!["in_0".to_string(), "in_1".to_string()]
}

fn default_merged() -> String {
  "out_merged".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MergeConfig {
  #[serde(default = "default_merge_inputs")]
  inputs: Vec<String>,
  #[serde(default = "default_merged")]
  output: String,
  // Consumed by the expander when the recipe is `windowed`.
  #[serde(default)]
  #[allow(dead_code)]
  window_size: Option<u64>,
}

/// Forwards every item; the runtime window, when attached, batches them.
struct Merge {
  config: MergeConfig,
}

impl Merge {
  fn build(config: &Value) -> Result<Primitive, BodyError> {
    Ok(Primitive::merger(Self {
      config: parse(config)?,
    }))
  }
}

#[async_trait]
impl ComponentBody for Merge {
  fn configure_ports(&self) -> Vec<PortSpec> {
    let mut ports: Vec<PortSpec> = self.config.inputs.iter().map(PortSpec::input).collect();
    ports.push(PortSpec::output(&self.config.output));
    ports
  }
}

#[async_trait]
impl MergerBody for Merge {
  async fn merge(
    &mut self,
    _port: &str,
    item: Value,
    _ctx: &mut ComponentContext,
  ) -> Result<Option<Value>, BodyError> {
    Ok(Some(item))
  }
}
