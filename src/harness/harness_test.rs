//! Tests for wiring, running, checkpointing and restoring graphs.

use super::*;
use crate::checkpoint::{Checkpoint, Epoch, FileCheckpointStorage, MemoryIdempotencyStore};
use crate::component::{ComponentBody, ComponentContext, ComponentOutcome, Primitive, Shape, SinkBody};
use crate::envelope::ErrorEnvelope;
use crate::error::{BodyError, ErrorCategory, RestoreError};
use crate::port::{OverflowPolicy, PortSpec};
use crate::recipe::{BodyTemplate, Recipe};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

fn config(root: &std::path::Path) -> RuntimeConfig {
  RuntimeConfig {
    root: root.to_path_buf(),
    checkpoint_interval_secs: 0,
    ..RuntimeConfig::default()
  }
}

fn harness(root: &std::path::Path) -> Harness {
  Harness::new(config(root), RecipeLibrary::with_builtins())
}

fn counting() -> Topology {
  Topology::new("counting")
    .component("relay", "passthrough", json!({}))
    .component("count", "counting_sink", json!({}))
    .bind(("relay", "out_items"), ("count", "in_items"))
    .with_ingress("relay", "in_items")
}

async fn until(graph: &RunningGraph, component: &str, messages_in: u64) {
  tokio::time::timeout(Duration::from_secs(5), async {
    while graph.status().component(component).map(|c| c.metrics.messages_in) != Some(messages_in) {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("component never caught up");
}

fn count_of(report: &RunReport) -> u64 {
  report.final_state("count").unwrap()["body"]["count"].as_u64().unwrap()
}

// ============================================================================
// Wiring
// ============================================================================

#[test]
fn wiring_rejects_broken_topologies() {
  let dir = tempfile::tempdir().unwrap();
  let harness = harness(dir.path());
  let range = || Topology::new("t").component("numbers", "range_source", json!({"end": 3}));

  let err = harness
    .wire(&range().component("numbers", "counting_sink", json!({})))
    .unwrap_err();
  assert!(matches!(err, WiringError::DuplicateComponent(name) if name == "numbers"));

  let err = harness
    .wire(&range().bind(("numbers", "out_items"), ("ghost", "in_items")))
    .unwrap_err();
  assert!(matches!(err, WiringError::UnknownComponent(name) if name == "ghost"));

  let err = harness
    .wire(
      &range()
        .component("count", "counting_sink", json!({}))
        .bind(("numbers", "out_nope"), ("count", "in_items")),
    )
    .unwrap_err();
  assert!(matches!(err, WiringError::UnknownPort { direction: "output", .. }));

  let err = harness.wire(&range()).unwrap_err();
  assert!(matches!(err, WiringError::UnboundOutput(key) if key == "numbers.out_items"));

  let err = harness
    .wire(&Topology::new("t").component("count", "counting_sink", json!({})))
    .unwrap_err();
  assert!(matches!(err, WiringError::UnboundInput(key) if key == "count.in_items"));

  let err = harness
    .wire(
      &range()
        .component("kv", "kv_store", json!({}))
        .component("count", "counting_sink", json!({}))
        .bind(("numbers", "out_items"), ("kv", "in_commands"))
        .bind(("kv", "out_results"), ("count", "in_items")),
    )
    .unwrap_err();
  assert!(matches!(err, WiringError::IncompatibleSchema { .. }));

  let err = harness
    .wire(
      &range()
        .component("count", "counting_sink", json!({}))
        .bind(("numbers", "out_items"), ("count", "in_items"))
        .with_ingress("count", "in_items"),
    )
    .unwrap_err();
  assert!(matches!(err, WiringError::AlreadyBound(key) if key == "count.in_items"));
}

#[test]
fn wiring_rechecks_the_generation_layer() {
  let dir = tempfile::tempdir().unwrap();
  let harness = harness(dir.path());

  let mut topology = counting();
  topology.components[1].primitive = Some(Shape::Transformer);
  let err = harness.wire(&topology).unwrap_err();
  assert!(matches!(
    err,
    WiringError::PrimitiveMismatch {
      expected: Shape::Transformer,
      actual: Shape::Sink,
      ..
    }
  ));

  let mut topology = counting();
  topology.components[1].ports = Some(vec!["in_items".into(), "in_other".into()]);
  assert!(matches!(
    harness.wire(&topology),
    Err(WiringError::DeclaredPortsMismatch { .. })
  ));

  let mut topology = counting();
  topology.components[1].ports = Some(vec!["in_items".into()]);
  topology.components[1].primitive = Some(Shape::Sink);
  assert!(harness.wire(&topology).is_ok());
}

struct Slow;

#[async_trait]
impl ComponentBody for Slow {
  fn configure_ports(&self) -> Vec<PortSpec> {
    vec![PortSpec::input("in_items").with_policy(OverflowPolicy::BlockWithTimeout(Duration::from_millis(10)))]
  }
}

#[async_trait]
impl SinkBody for Slow {
  async fn consume(&mut self, _port: &str, _item: Value, _ctx: &mut ComponentContext) -> Result<(), BodyError> {
    Ok(())
  }
}

#[test]
fn timeout_policy_is_only_for_ingress() {
  let dir = tempfile::tempdir().unwrap();
  let mut library = RecipeLibrary::with_builtins();
  library
    .register(Recipe::new(
      "slow_sink",
      "0.1.0",
      Shape::Sink,
      BodyTemplate::generated(|_: &Value| Ok::<_, BodyError>(Primitive::sink(Slow))),
    ))
    .unwrap();
  let harness = Harness::new(config(dir.path()), library);

  let internal = Topology::new("t")
    .component("numbers", "range_source", json!({"end": 3}))
    .component("slow", "slow_sink", json!({}))
    .bind(("numbers", "out_items"), ("slow", "in_items"));
  assert!(matches!(
    harness.wire(&internal),
    Err(WiringError::TimeoutOnInternalPort(key)) if key == "slow.in_items"
  ));

  let external = Topology::new("t")
    .component("slow", "slow_sink", json!({}))
    .with_ingress("slow", "in_items");
  assert!(harness.wire(&external).is_ok());
}

#[test]
fn idempotent_recipes_get_a_store_under_the_root() {
  let dir = tempfile::tempdir().unwrap();
  let harness = harness(dir.path());
  let ledger = dir.path().join("ledger.jsonl");
  let topology = Topology::new("ledger")
    .component("ledger", "jsonl_sink", json!({"path": ledger}))
    .with_ingress("ledger", "in_items");

  let graph = harness.wire(&topology).unwrap();
  assert!(graph.idempotency_store().is_some());
  assert!(harness.config().idempotency_path("ledger").exists());
  assert!(harness.wire(&counting()).unwrap().idempotency_store().is_none());
}

// ============================================================================
// Running
// ============================================================================

#[tokio::test]
async fn range_into_counting_sink_completes() {
  let dir = tempfile::tempdir().unwrap();
  let topology = Topology::new("numbers")
    .component("numbers", "range_source", json!({"start": 1, "end": 100}))
    .component("count", "counting_sink", json!({}))
    .bind(("numbers", "out_items"), ("count", "in_items"));

  let graph = harness(dir.path()).wire(&topology).unwrap();
  let running = graph.start();
  let report = running.wait().await;

  assert!(report.is_success());
  assert_eq!(count_of(&report), 100);
  assert!(report.errors.is_empty());

  let status = SystemStatus::read(&config(dir.path()).status_path("numbers")).unwrap();
  let numbers = status.component("numbers").unwrap();
  assert_eq!(numbers.state, RunState::Completed);
  assert_eq!(numbers.ports["out_items"].messages, 100);
  assert_eq!(status.component("count").unwrap().metrics.messages_in, 100);
}

#[tokio::test]
async fn unbound_error_ports_reach_the_collector() {
  let dir = tempfile::tempdir().unwrap();
  let topology = Topology::new("routing")
    .component(
      "router",
      "field_router",
      json!({"field": "kind", "routes": {"a": "out_a", "b": "out_b"}}),
    )
    .component("count", "counting_sink", json!({}))
    .component("other", "counting_sink", json!({}))
    .bind(("router", "out_a"), ("count", "in_items"))
    .bind(("router", "out_b"), ("other", "in_items"))
    .with_ingress("router", "in_items");

  let mut graph = harness(dir.path()).wire(&topology).unwrap();
  let input = graph.ingress("router.in_items").unwrap();
  let running = graph.start();
  input.send(json!({"kind": "a"})).await.unwrap();
  input.send(json!({"kind": "z"})).await.unwrap();
  input.send(json!({"kind": "a"})).await.unwrap();
  drop(input);

  let report = running.wait().await;
  assert!(report.is_success());
  assert_eq!(count_of(&report), 2);
  assert_eq!(report.errors.len(), 1);
  let envelope = &report.errors[0];
  assert_eq!(envelope.system, "routing");
  assert_eq!(envelope.component, "router");
  assert_eq!(envelope.category, ErrorCategory::Validation);
  assert_eq!(envelope.input_offset, Some(2));
  assert_eq!(envelope.port.as_deref(), Some("in_items"));
  assert_eq!(envelope.payload, json!({"kind": "z"}));

  let status = SystemStatus::read(&config(dir.path()).status_path("routing")).unwrap();
  assert_eq!(status.collected_errors, 1);
}

struct Exploding;

#[async_trait]
impl ComponentBody for Exploding {
  fn configure_ports(&self) -> Vec<PortSpec> {
    vec![PortSpec::input("in_items")]
  }
}

#[async_trait]
impl SinkBody for Exploding {
  async fn consume(&mut self, _port: &str, _item: Value, _ctx: &mut ComponentContext) -> Result<(), BodyError> {
    panic!("boom");
  }
}

fn exploding_library() -> RecipeLibrary {
  let mut library = RecipeLibrary::with_builtins();
  library
    .register(Recipe::new(
      "exploding_sink",
      "0.1.0",
      Shape::Sink,
      BodyTemplate::generated(|_: &Value| Ok::<_, BodyError>(Primitive::sink(Exploding))),
    ))
    .unwrap();
  library
}

#[tokio::test]
async fn a_panicking_body_is_reported_as_a_crash() {
  let dir = tempfile::tempdir().unwrap();
  let library = exploding_library();
  let topology = Topology::new("boom")
    .component("boom", "exploding_sink", json!({}))
    .with_ingress("boom", "in_items");

  let mut graph = Harness::new(config(dir.path()), library).wire(&topology).unwrap();
  let input = graph.ingress("boom.in_items").unwrap();
  let running = graph.start();
  input.send(json!(1)).await.unwrap();
  drop(input);

  let report = running.wait().await;
  assert!(!report.is_success());
  let crashed: Vec<_> = report.crashed().collect();
  assert_eq!(crashed.len(), 1);
  assert_eq!(crashed[0].0, "boom");
  assert!(crashed[0].1.contains("boom"));
  assert_eq!(report.final_state("boom"), Some(&json!({"crashed": "panicked: boom"})));
}

#[tokio::test]
async fn checkpoints_continue_after_a_component_panics() {
  let dir = tempfile::tempdir().unwrap();
  let topology = counting()
    .component("boom", "exploding_sink", json!({}))
    .with_ingress("boom", "in_items");
  let harness = Harness::new(config(dir.path()), exploding_library());

  let mut graph = harness.wire(&topology).unwrap();
  let items = graph.ingress("relay.in_items").unwrap();
  let trigger = graph.ingress("boom.in_items").unwrap();
  let running = graph.start();
  items.send(json!(1)).await.unwrap();
  trigger.send(json!("go")).await.unwrap();
  until(&running, "count", 1).await;
  tokio::time::timeout(Duration::from_secs(5), async {
    while !matches!(
      running.status().component("boom").map(|c| &c.state),
      Some(RunState::Crashed(_))
    ) {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("component never crashed");

  let epoch = running.checkpoint_now().await.unwrap();
  let saved = FileCheckpointStorage::new(harness.config().checkpoint_dir("counting"))
    .load(epoch)
    .unwrap();
  assert_eq!(saved.component_states["boom"], json!({"crashed": "panicked: boom"}));
  assert_eq!(saved.component_states["count"]["body"]["count"], json!(1));
  running.abort().await;

  let mut graph = harness.wire(&topology).unwrap();
  assert_eq!(graph.restore(None).unwrap(), epoch);
}

#[tokio::test]
async fn cancel_stops_waiting_components() {
  let dir = tempfile::tempdir().unwrap();
  let mut graph = harness(dir.path()).wire(&counting()).unwrap();
  let _input = graph.ingress("relay.in_items").unwrap();
  let running = graph.start();
  running.cancel();
  let report = running.wait().await;
  assert!(report.outcomes.values().all(|o| *o == ComponentOutcome::Cancelled));
}

// ============================================================================
// Checkpoint and restore
// ============================================================================

#[tokio::test]
async fn checkpoint_then_restore_resumes_counting() {
  let dir = tempfile::tempdir().unwrap();
  let harness = harness(dir.path());

  let mut graph = harness.wire(&counting()).unwrap();
  let input = graph.ingress("relay.in_items").unwrap();
  let running = graph.start();
  for n in 0..3 {
    input.send(json!(n)).await.unwrap();
  }
  until(&running, "count", 3).await;
  let epoch = running.checkpoint_now().await.unwrap();
  assert_eq!(epoch, Epoch::new(1));
  assert_eq!(running.last_checkpoint(), Some(epoch));
  running.abort().await;
  drop(input);

  let checkpoint = FileCheckpointStorage::new(harness.config().checkpoint_dir("counting"))
    .load(epoch)
    .unwrap();
  assert_eq!(checkpoint.component_states["count"]["body"]["count"], json!(3));
  assert_eq!(checkpoint.port_offsets["count.in_items"], 3);
  assert_eq!(checkpoint.port_offsets["relay.out_items"], 3);
  assert_eq!(checkpoint.provenance["relay"].to_string(), "passthrough@1.0.0");

  let mut graph = harness.wire(&counting()).unwrap();
  assert_eq!(graph.restore(None).unwrap(), epoch);
  assert!(matches!(graph.restore(None), Err(RestoreError::AlreadyRestored)));
  let input = graph.ingress("relay.in_items").unwrap();
  let running = graph.start();
  input.send(json!(3)).await.unwrap();
  input.send(json!(4)).await.unwrap();
  drop(input);
  let report = running.wait().await;

  assert_eq!(count_of(&report), 5);
  assert_eq!(report.last_checkpoint, Some(epoch));
}

#[tokio::test]
async fn restore_refills_in_flight_items() {
  let dir = tempfile::tempdir().unwrap();
  let harness = harness(dir.path());
  let graph = harness.wire(&counting()).unwrap();

  let mut checkpoint = Checkpoint::new(Epoch::new(7), "counting");
  for component in graph.components() {
    checkpoint
      .component_states
      .insert(component.name().to_string(), component.snapshot().unwrap());
  }
  checkpoint.in_flight.insert("count.in_items".into(), vec![json!("a"), json!("b")]);
  checkpoint.port_offsets.insert("count.in_items".into(), 40);
  graph.storage().save(&checkpoint).unwrap();
  drop(graph);

  let mut graph = harness.wire(&counting()).unwrap();
  assert_eq!(graph.restore(Some(Epoch::new(7))).unwrap(), Epoch::new(7));
  let report = graph.start().wait().await;

  assert_eq!(count_of(&report), 2);
  let status = SystemStatus::read(&harness.config().status_path("counting")).unwrap();
  assert_eq!(status.component("count").unwrap().ports["in_items"].sequence, 42);
}

#[tokio::test]
async fn restore_refills_envelopes_bound_for_the_collector() {
  let dir = tempfile::tempdir().unwrap();
  let harness = harness(dir.path());
  let graph = harness.wire(&counting()).unwrap();

  let mut checkpoint = Checkpoint::new(Epoch::new(3), "counting");
  for component in graph.components() {
    checkpoint
      .component_states
      .insert(component.name().to_string(), component.snapshot().unwrap());
  }
  let pending = ErrorEnvelope::new("counting", "relay", ErrorCategory::Runtime, "lost in transit", json!(9))
    .with_offset(Some(4));
  checkpoint.in_flight.insert("relay.err_out".into(), vec![pending.to_value()]);
  graph.storage().save(&checkpoint).unwrap();
  drop(graph);

  let mut graph = harness.wire(&counting()).unwrap();
  graph.restore(Some(Epoch::new(3))).unwrap();
  let report = graph.start().wait().await;

  assert!(report.is_success());
  assert_eq!(report.errors.len(), 1);
  assert_eq!(report.errors[0].component, "relay");
  assert_eq!(report.errors[0].message, "lost in transit");
  assert_eq!(report.errors[0].input_offset, Some(4));
}

#[tokio::test]
async fn restore_is_strict_about_the_topology() {
  let dir = tempfile::tempdir().unwrap();
  let harness = harness(dir.path());

  let mut graph = harness.wire(&counting()).unwrap();
  assert!(matches!(graph.restore(None), Err(RestoreError::NoCheckpoint(system)) if system == "counting"));

  let foreign = Checkpoint::new(Epoch::new(1), "someone_else");
  graph.storage().save(&foreign).unwrap();
  assert!(matches!(
    graph.restore(Some(Epoch::new(1))),
    Err(RestoreError::SystemMismatch { .. })
  ));

  let mut partial = Checkpoint::new(Epoch::new(2), "counting");
  partial.component_states.insert("count".into(), json!({"body": {"count": 1}}));
  graph.storage().save(&partial).unwrap();
  assert!(matches!(
    graph.restore(Some(Epoch::new(2))),
    Err(RestoreError::TopologyMismatch(_))
  ));

  let mut stray = Checkpoint::new(Epoch::new(3), "counting");
  for component in graph.components() {
    stray
      .component_states
      .insert(component.name().to_string(), component.snapshot().unwrap());
  }
  stray.port_offsets.insert("count.in_elsewhere".into(), 1);
  graph.storage().save(&stray).unwrap();
  assert!(matches!(
    graph.restore(Some(Epoch::new(3))),
    Err(RestoreError::TopologyMismatch(message)) if message.contains("in_elsewhere")
  ));
  assert!(graph.restored_from().is_none());
}

#[tokio::test]
async fn periodic_checkpoints_are_pruned_to_retention() {
  let dir = tempfile::tempdir().unwrap();
  let config = RuntimeConfig {
    checkpoint_interval_secs: 1,
    checkpoint_retention: 1,
    ..config(dir.path())
  };
  let store: Arc<dyn IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
  let harness = Harness::new(config, RecipeLibrary::with_builtins()).with_idempotency_store(store);

  let mut graph = harness.wire(&counting()).unwrap();
  let storage = Arc::clone(graph.storage());
  let input = graph.ingress("relay.in_items").unwrap();
  let running = graph.start();
  input.send(json!(1)).await.unwrap();

  tokio::time::timeout(Duration::from_secs(10), async {
    while running.last_checkpoint().is_none_or(|epoch| epoch < Epoch::new(2)) {
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
  })
  .await
  .expect("ticker never checkpointed twice");
  assert_eq!(storage.list().unwrap().len(), 1);

  drop(input);
  assert!(running.wait().await.is_success());
}
