//! Tests for the recipe library, expansion rules and built-in templates.

use super::*;
use crate::checkpoint::{MemoryIdempotencyStore, PauseController};
use crate::component::{
  Component, ComponentBody, ComponentContext, ComponentOutcome, SinkBody, SplitterBody,
  WindowBuffer,
};
use crate::error::ComponentError;
use crate::metrics::ComponentMetrics;
use crate::port::{InputPort, PortSpec, Received, connect, ingress};
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct Noop(Vec<PortSpec>);

#[async_trait]
impl ComponentBody for Noop {
  fn configure_ports(&self) -> Vec<PortSpec> {
    self.0.clone()
  }
}

#[async_trait]
impl SinkBody for Noop {
  async fn consume(&mut self, _port: &str, _item: Value, _ctx: &mut ComponentContext) -> Result<(), BodyError> {
    Ok(())
  }
}

#[async_trait]
impl SplitterBody for Noop {
  async fn route(&mut self, _item: &Value, _ctx: &mut ComponentContext) -> Result<Vec<String>, BodyError> {
    Ok(Vec::new())
  }
}

fn noop_sink(_config: &Value) -> Result<Primitive, BodyError> {
  Ok(Primitive::sink(Noop(vec![PortSpec::input("in_items")])))
}

fn noop_splitter(_config: &Value) -> Result<Primitive, BodyError> {
  Ok(Primitive::splitter(Noop(vec![
    PortSpec::input("in_items"),
    PortSpec::output("out_a"),
    PortSpec::output("out_b"),
  ])))
}

fn library_with(recipe: Recipe) -> RecipeLibrary {
  let mut library = RecipeLibrary::new();
  library.register(recipe).unwrap();
  library
}

async fn run(component: Component) -> ComponentOutcome {
  let participant = Arc::new(PauseController::new()).register(component.name(), CancellationToken::new());
  component.run(participant).await
}

// ============================================================================
// Library
// ============================================================================

#[test]
fn builtins_are_registered_at_one_version() {
  let library = RecipeLibrary::with_builtins();
  let names: Vec<&str> = library.names().collect();
  assert_eq!(
    names,
    vec![
      "broadcast",
      "counting_sink",
      "field_router",
      "jsonl_sink",
      "kv_store",
      "passthrough",
      "range_source",
      "round_robin_merge",
      "sequence_source",
      "windowed_merge",
    ]
  );
  assert!(library.names().all(|name| library.get(name).unwrap().version() == BUILTIN_VERSION));
}

#[test]
fn duplicate_registration_fails() {
  let mut library = RecipeLibrary::with_builtins();
  let again = Recipe::new("passthrough", "2.0.0", Shape::Sink, BodyTemplate::Builtin(noop_sink));
  assert!(matches!(
    library.register(again),
    Err(ExpansionError::DuplicateRecipe(name)) if name == "passthrough"
  ));
}

// ============================================================================
// Expansion rules
// ============================================================================

#[test]
fn expansion_adds_error_port_and_provenance() {
  let library = RecipeLibrary::with_builtins();
  let component = RecipeExpander::new(&library)
    .expand("numbers", "range_source", &json!({"end": 3}))
    .unwrap();
  assert_eq!(component.shape(), Shape::Source);
  assert_eq!(component.error_ports().map(|p| p.name()).collect::<Vec<_>>(), vec!["err_out"]);
  assert_eq!(component.provenance().unwrap().to_string(), "range_source@1.0.0");
  assert_eq!(component.config(), &json!({"end": 3}));
}

#[test]
fn unknown_recipe_fails() {
  let library = RecipeLibrary::with_builtins();
  let err = RecipeExpander::new(&library).expand("x", "nope", &Value::Null).unwrap_err();
  assert!(matches!(err, ExpansionError::UnknownRecipe(name) if name == "nope"));
}

#[test]
fn merger_recipe_with_one_input_fails() {
  let library = RecipeLibrary::with_builtins();
  let err = RecipeExpander::new(&library)
    .expand("merge", "round_robin_merge", &json!({"inputs": ["in_only"]}))
    .unwrap_err();
  assert!(matches!(
    err,
    ExpansionError::Component(ComponentError::ShapeViolation { inputs: 1, .. })
  ));
}

#[test]
fn bad_config_is_reported_per_recipe() {
  let library = RecipeLibrary::with_builtins();
  let expander = RecipeExpander::new(&library);
  assert!(matches!(
    expander.expand("numbers", "range_source", &json!({"start": 1})),
    Err(ExpansionError::InvalidConfig { recipe, .. }) if recipe == "range_source"
  ));
  assert!(matches!(
    expander.expand("numbers", "range_source", &json!({"end": 3, "colour": "red"})),
    Err(ExpansionError::InvalidConfig { .. })
  ));
}

#[test]
fn persistent_only_applies_to_transformers() {
  let recipe = Recipe::new("store_sink", "0.1.0", Shape::Sink, BodyTemplate::Builtin(noop_sink))
    .with_trait(RecipeTrait::Persistent);
  let library = library_with(recipe);
  let err = RecipeExpander::new(&library)
    .expand("s", "store_sink", &Value::Null)
    .unwrap_err();
  assert!(matches!(
    err,
    ExpansionError::TraitNotApplicable {
      recipe_trait: RecipeTrait::Persistent,
      shape: Shape::Sink,
      ..
    }
  ));
}

#[test]
fn splitters_must_be_deterministic() {
  let recipe = Recipe::new("router", "0.1.0", Shape::Splitter, BodyTemplate::Builtin(noop_splitter));
  let library = library_with(recipe.clone().with_contract(Contract::AtLeastOnce));
  assert!(matches!(
    RecipeExpander::new(&library).expand("r", "router", &Value::Null),
    Err(ExpansionError::NonDeterministicRouting(_))
  ));

  let library = library_with(recipe.with_contract(Contract::Deterministic));
  assert!(RecipeExpander::new(&library).expand("r", "router", &Value::Null).is_ok());
}

#[test]
fn idempotent_recipes_need_a_store() {
  let library = RecipeLibrary::with_builtins();
  let config = json!({"path": "ledger.jsonl"});
  assert!(matches!(
    RecipeExpander::new(&library).expand("ledger", "jsonl_sink", &config),
    Err(ExpansionError::MissingIdempotencyStore(_))
  ));

  let store: Arc<dyn crate::checkpoint::IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
  let expander = RecipeExpander::new(&library).with_idempotency_store(store);
  assert!(expander.expand("ledger", "jsonl_sink", &config).is_ok());
}

#[test]
fn windowed_merge_needs_window_size() {
  let library = RecipeLibrary::with_builtins();
  let expander = RecipeExpander::new(&library);
  assert!(matches!(
    expander.expand("m", "windowed_merge", &json!({})),
    Err(ExpansionError::InvalidConfig { .. })
  ));
  assert!(matches!(
    expander.expand("m", "windowed_merge", &json!({"window_size": 0})),
    Err(ExpansionError::InvalidConfig { .. })
  ));

  let component = expander
    .expand("m", "windowed_merge", &json!({"window_size": 3}))
    .unwrap();
  assert_eq!(component.window().map(WindowBuffer::size), Some(3));
  let plain = expander.expand("m", "round_robin_merge", &Value::Null).unwrap();
  assert!(plain.window().is_none());
}

#[test]
fn generated_template_must_match_base_shape() {
  let recipe = Recipe::new(
    "liar",
    "0.1.0",
    Shape::Transformer,
    BodyTemplate::generated(|_config: &Value| {
      Ok::<_, BodyError>(Primitive::sink(Noop(vec![PortSpec::input("in_x")])))
    }),
  );
  let library = library_with(recipe);
  assert!(matches!(
    RecipeExpander::new(&library).expand("l", "liar", &Value::Null),
    Err(ExpansionError::ShapeMismatch {
      expected: Shape::Transformer,
      actual: Shape::Sink,
      ..
    })
  ));
}

// ============================================================================
// Built-in templates
// ============================================================================

fn tap(name: &str) -> InputPort {
  InputPort::new(PortSpec::input(name), Arc::new(ComponentMetrics::new("tap"))).unwrap()
}

async fn drain(port: &InputPort) -> Vec<Value> {
  let mut items = Vec::new();
  while let Received::Item(delivery) = port.receive().await.unwrap() {
    items.push(delivery.value);
  }
  items
}

#[tokio::test]
async fn kv_store_returns_what_was_added() {
  let library = RecipeLibrary::with_builtins();
  let mut component = RecipeExpander::new(&library)
    .expand("kv", "kv_store", &Value::Null)
    .unwrap();
  assert!(component.is_persistent());

  let mut results = tap("in_results");
  connect(component.output_mut("out_results").unwrap(), &mut results).unwrap();
  let commands = ingress(component.input_mut("in_commands").unwrap()).unwrap();
  commands.send(json!({"action": "add", "value": "x"})).await.unwrap();
  commands.send(json!({"action": "get"})).await.unwrap();
  commands.send(json!({"action": "remove"})).await.unwrap();
  commands.send(json!({"action": "get"})).await.unwrap();
  drop(commands);

  assert_eq!(run(component).await, ComponentOutcome::Completed);
  assert_eq!(drain(&results).await, vec![json!("x"), json!("x"), json!("x"), Value::Null]);
}

#[tokio::test]
async fn field_router_uses_routes_then_default() {
  let library = RecipeLibrary::with_builtins();
  let config = json!({
    "field": "kind",
    "routes": {"a": "out_a", "both": ["out_a", "out_b"]},
    "default": "out_b",
  });
  let mut component = RecipeExpander::new(&library)
    .expand("router", "field_router", &config)
    .unwrap();
  let mut a = tap("in_a");
  let mut b = tap("in_b");
  connect(component.output_mut("out_a").unwrap(), &mut a).unwrap();
  connect(component.output_mut("out_b").unwrap(), &mut b).unwrap();
  let input = ingress(component.input_mut("in_items").unwrap()).unwrap();
  for kind in ["a", "both", "other"] {
    input.send(json!({"kind": kind})).await.unwrap();
  }
  drop(input);

  assert_eq!(run(component).await, ComponentOutcome::Completed);
  assert_eq!(drain(&a).await, vec![json!({"kind": "a"}), json!({"kind": "both"})]);
  assert_eq!(drain(&b).await, vec![json!({"kind": "both"}), json!({"kind": "other"})]);
}

#[tokio::test]
async fn jsonl_sink_writes_each_key_once() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("out").join("ledger.jsonl");
  let store: Arc<dyn crate::checkpoint::IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
  let library = RecipeLibrary::with_builtins();
  let expander = RecipeExpander::new(&library).with_idempotency_store(Arc::clone(&store));
  let config = json!({"path": path, "key_field": "id"});

  let mut component = expander.expand("ledger", "jsonl_sink", &config).unwrap();
  let input = ingress(component.input_mut("in_items").unwrap()).unwrap();
  for id in [1, 2, 1] {
    input.send(json!({"id": id})).await.unwrap();
  }
  drop(input);
  assert_eq!(run(component).await, ComponentOutcome::Completed);

  let written = std::fs::read_to_string(&path).unwrap();
  assert_eq!(written.lines().count(), 2);
  assert_eq!(store.records().unwrap().len(), 2);
}

#[tokio::test]
async fn jsonl_sink_without_key_field_keys_by_delivery() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("ledger.jsonl");
  let store: Arc<dyn crate::checkpoint::IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
  let library = RecipeLibrary::with_builtins();
  let expander = RecipeExpander::new(&library).with_idempotency_store(Arc::clone(&store));
  let config = json!({"path": path});

  // Equal payloads are distinct deliveries.
  let mut component = expander.expand("ledger", "jsonl_sink", &config).unwrap();
  let input = ingress(component.input_mut("in_items").unwrap()).unwrap();
  for _ in 0..3 {
    input.send(json!({"amount": 5})).await.unwrap();
  }
  drop(input);
  assert_eq!(run(component).await, ComponentOutcome::Completed);
  assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
  let keys: Vec<_> = store.records().unwrap().into_iter().map(|r| r.key).collect();
  assert_eq!(keys, vec!["ledger.in_items#1", "ledger.in_items#2", "ledger.in_items#3"]);

  // Replaying the same sequence numbers writes nothing new.
  let mut replay = expander.expand("ledger", "jsonl_sink", &config).unwrap();
  let input = ingress(replay.input_mut("in_items").unwrap()).unwrap();
  for _ in 0..2 {
    input.send(json!({"amount": 5})).await.unwrap();
  }
  drop(input);
  assert_eq!(run(replay).await, ComponentOutcome::Completed);
  assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
  assert_eq!(store.records().unwrap().len(), 3);
}
