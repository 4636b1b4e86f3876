//! A started graph: component tasks, the checkpoint coordinator and run
//! reports.

use super::collector::{self, ErrorLog};
use super::graph::Graph;
use super::status::{ComponentStatus, RunState, SystemStatus};
use super::topology::port_key;
use crate::checkpoint::{Checkpoint, CheckpointStorage, Epoch, IdempotencyStore, PauseController};
use crate::component::{ComponentOutcome, Shape};
use crate::config::RuntimeConfig;
use crate::envelope::ErrorEnvelope;
use crate::error::CheckpointError;
use crate::metrics::{ComponentMetrics, PortMetrics};
use crate::port::Channel;
use crate::recipe::Provenance;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct PortInfo {
  name: String,
  metrics: Arc<PortMetrics>,
  /// Feeding channel, for inputs.
  channel: Option<Arc<Channel>>,
}

struct ComponentInfo {
  name: String,
  shape: Shape,
  provenance: Option<Provenance>,
  metrics: Arc<ComponentMetrics>,
  ports: Vec<PortInfo>,
}

impl ComponentInfo {
  fn queue_depth(&self) -> usize {
    self.ports.iter().filter_map(|p| p.channel.as_ref()).map(|c| c.len()).sum()
  }
}

/// State shared by the handle, the component tasks and the ticker.
struct Shared {
  system: String,
  config: RuntimeConfig,
  pause: Arc<PauseController>,
  storage: Arc<dyn CheckpointStorage>,
  idempotency: Option<Arc<dyn IdempotencyStore>>,
  components: Vec<ComponentInfo>,
  /// Channels from unbound `err_` ports to the collector.
  collector_channels: Vec<(String, Arc<Channel>)>,
  states: Mutex<BTreeMap<String, RunState>>,
  errors: Arc<ErrorLog>,
  last_epoch: Mutex<Option<Epoch>>,
  checkpointing: tokio::sync::Mutex<()>,
  /// Number of component tasks that have exited.
  exited: watch::Sender<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
  async fn checkpoint(&self) -> Result<Epoch, CheckpointError> {
    let _serial = self.checkpointing.lock().await;
    let started = Instant::now();
    let guard = self.pause.pause(self.config.pause_timeout()).await?;
    let deposits = guard.snapshots();

    let mut epoch = self.storage.next_epoch()?;
    if let Some(last) = *lock(&self.last_epoch) {
      epoch = epoch.max(last.next());
    }
    let mut checkpoint = Checkpoint::new(epoch, &self.system);
    for info in &self.components {
      let state = match deposits.get(&info.name) {
        Some(Ok(state)) => state.clone(),
        Some(Err(message)) => {
          return Err(CheckpointError::Snapshot {
            component: info.name.clone(),
            message: message.clone(),
          });
        }
        None => {
          return Err(CheckpointError::Snapshot {
            component: info.name.clone(),
            message: "component exited without a final state".into(),
          });
        }
      };
      checkpoint.component_states.insert(info.name.clone(), state);
      if let Some(provenance) = &info.provenance {
        checkpoint.provenance.insert(info.name.clone(), provenance.clone());
      }
      for port in &info.ports {
        let key = port_key(&info.name, &port.name);
        checkpoint.port_offsets.insert(key.clone(), port.metrics.sequence());
        if let Some(channel) = &port.channel {
          let pending = channel.snapshot();
          if !pending.is_empty() {
            checkpoint.in_flight.insert(key, pending);
          }
        }
      }
    }

    for (key, channel) in &self.collector_channels {
      let pending = channel.snapshot();
      if !pending.is_empty() {
        checkpoint.in_flight.insert(key.clone(), pending);
      }
    }

    let storage = Arc::clone(&self.storage);
    let in_flight = checkpoint.in_flight_len();
    tokio::task::spawn_blocking(move || storage.save(&checkpoint))
      .await
      .map_err(|e| CheckpointError::Writer(e.to_string()))??;
    drop(guard);

    self.housekeeping();
    *lock(&self.last_epoch) = Some(epoch);
    info!(
      system = %self.system,
      epoch = epoch.as_u64(),
      in_flight,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "checkpoint written"
    );
    self.publish_status();
    Ok(epoch)
  }

  fn housekeeping(&self) {
    match self.storage.prune(self.config.checkpoint_retention) {
      Ok(removed) if !removed.is_empty() => debug!(removed = removed.len(), "pruned checkpoints"),
      Ok(_) => {}
      Err(e) => warn!(system = %self.system, error = %e, "checkpoint pruning failed"),
    }
    if let Some(store) = &self.idempotency {
      let retention = chrono::Duration::from_std(self.config.idempotency_retention())
        .unwrap_or(chrono::Duration::MAX);
      let cutoff = Utc::now().checked_sub_signed(retention).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
      match store.prune_before(cutoff) {
        Ok(removed) if removed > 0 => debug!(removed, "pruned idempotency records"),
        Ok(_) => {}
        Err(e) => warn!(system = %self.system, error = %e, "idempotency pruning failed"),
      }
    }
  }

  fn status(&self) -> SystemStatus {
    let states = lock(&self.states);
    let components = self
      .components
      .iter()
      .map(|info| ComponentStatus {
        name: info.name.clone(),
        shape: info.shape,
        provenance: info.provenance.clone(),
        state: states.get(&info.name).cloned().unwrap_or(RunState::Running),
        metrics: info.metrics.snapshot(info.queue_depth()),
        ports: info
          .ports
          .iter()
          .map(|port| {
            let depth = port.channel.as_ref().map_or(0, |c| c.len());
            (port.name.clone(), port.metrics.snapshot(depth))
          })
          .collect(),
      })
      .collect();
    SystemStatus {
      system: self.system.clone(),
      taken_at: Utc::now(),
      last_checkpoint: *lock(&self.last_epoch),
      components,
      collected_errors: self.errors.total(),
    }
  }

  fn publish_status(&self) {
    let path = self.config.status_path(&self.system);
    if let Err(e) = self.status().write(&path) {
      warn!(path = %path.display(), error = %e, "cannot write status file");
    }
  }
}

/// Handle on a started graph.
pub struct RunningGraph {
  shared: Arc<Shared>,
  cancel: CancellationToken,
  tasks: Vec<(String, JoinHandle<ComponentOutcome>)>,
  collectors: Vec<JoinHandle<()>>,
  ticker: Option<(CancellationToken, JoinHandle<()>)>,
}

impl RunningGraph {
  pub(super) fn start(graph: Graph) -> Self {
    let Graph {
      system,
      config,
      components,
      channels,
      senders,
      collectors,
      pause,
      storage,
      idempotency,
      restored,
    } = graph;
    // Ingress nobody took sees end-of-stream.
    drop(senders);

    let infos = components
      .iter()
      .map(|component| {
        let inputs = component.inputs().iter().map(|port| PortInfo {
          name: port.name().to_string(),
          metrics: Arc::clone(port.metrics()),
          channel: channels.get(&port_key(component.name(), port.name())).cloned(),
        });
        let outputs = component.outputs().iter().map(|port| PortInfo {
          name: port.name().to_string(),
          metrics: Arc::clone(port.metrics()),
          channel: None,
        });
        ComponentInfo {
          name: component.name().to_string(),
          shape: component.shape(),
          provenance: component.provenance().cloned(),
          metrics: Arc::clone(component.metrics()),
          ports: inputs.chain(outputs).collect(),
        }
      })
      .collect();

    let collector_channels = collectors
      .iter()
      .filter_map(|(origin, input)| input.channel().map(|channel| (origin.clone(), Arc::clone(channel))))
      .collect();
    let errors = Arc::new(ErrorLog::new(config.error_log_capacity));
    let shared = Arc::new(Shared {
      system,
      config,
      pause,
      storage,
      idempotency,
      components: infos,
      collector_channels,
      states: Mutex::new(BTreeMap::new()),
      errors: Arc::clone(&errors),
      last_epoch: Mutex::new(restored),
      checkpointing: tokio::sync::Mutex::new(()),
      exited: watch::channel(0).0,
    });

    let cancel = CancellationToken::new();
    let tasks = components
      .into_iter()
      .map(|component| {
        let name = component.name().to_string();
        let participant = shared.pause.register(name.clone(), cancel.child_token());
        let task_shared = Arc::clone(&shared);
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
          let outcome = match AssertUnwindSafe(component.run(participant)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
              let reason = format!("panicked: {}", panic_message(panic.as_ref()));
              error!(component = %task_name, %reason, "component crashed");
              task_shared.pause.record_crash(&task_name, &reason);
              ComponentOutcome::Crashed { reason }
            }
          };
          lock(&task_shared.states).insert(task_name, outcome.clone().into());
          task_shared.exited.send_modify(|n| *n += 1);
          outcome
        });
        (name, handle)
      })
      .collect();

    let collectors = collectors
      .into_iter()
      .map(|(origin, input)| collector::spawn(origin, input, Arc::clone(&errors)))
      .collect();

    let ticker = shared.config.checkpoint_interval().map(|every| {
      let stop = CancellationToken::new();
      (stop.clone(), spawn_ticker(Arc::clone(&shared), every, stop))
    });

    info!(system = %shared.system, components = shared.components.len(), "graph started");
    Self {
      shared,
      cancel,
      tasks,
      collectors,
      ticker,
    }
  }

  /// System id.
  pub fn system(&self) -> &str {
    &self.shared.system
  }

  /// Pauses the graph at a consistent cut and writes a checkpoint.
  ///
  /// Concurrent calls (and the periodic ticker) are serialized. A failed
  /// checkpoint leaves the graph running and writes nothing.
  pub async fn checkpoint_now(&self) -> Result<Epoch, CheckpointError> {
    self.shared.checkpoint().await.inspect_err(|e| {
      warn!(system = %self.shared.system, error = %e, "checkpoint failed");
    })
  }

  /// Newest checkpoint written or restored by this graph.
  pub fn last_checkpoint(&self) -> Option<Epoch> {
    *lock(&self.shared.last_epoch)
  }

  /// Current status of every component.
  pub fn status(&self) -> SystemStatus {
    self.shared.status()
  }

  /// Envelopes received by the error collector, oldest first.
  pub fn errors(&self) -> Vec<ErrorEnvelope> {
    self.shared.errors.snapshot()
  }

  /// Completes once every component has exited, without consuming the
  /// handle.
  pub async fn finished(&self) {
    let total = self.shared.components.len();
    let mut exited = self.shared.exited.subscribe();
    let _ = exited.wait_for(|n| *n >= total).await;
  }

  /// Asks every component to stop at its next safe point.
  pub fn cancel(&self) {
    info!(system = %self.shared.system, "cancelling graph");
    self.cancel.cancel();
  }

  /// Waits for every component to exit.
  pub async fn wait(mut self) -> RunReport {
    let mut outcomes = BTreeMap::new();
    for (name, handle) in self.tasks.drain(..) {
      let outcome = handle.await.unwrap_or_else(|e| ComponentOutcome::Crashed {
        reason: format!("task failed: {e}"),
      });
      outcomes.insert(name, outcome);
    }
    if let Some((stop, handle)) = self.ticker.take() {
      stop.cancel();
      let _ = handle.await;
    }
    for handle in self.collectors.drain(..) {
      let _ = handle.await;
    }

    let final_states = self
      .shared
      .pause
      .finished()
      .into_iter()
      .filter_map(|(name, deposit)| deposit.ok().map(|state| (name, state)))
      .collect();
    self.shared.publish_status();
    let report = RunReport {
      system: self.shared.system.clone(),
      outcomes,
      final_states,
      last_checkpoint: *lock(&self.shared.last_epoch),
      errors: self.shared.errors.snapshot(),
    };
    info!(
      system = %report.system,
      crashed = report.crashed().count(),
      errors = report.errors.len(),
      "graph finished"
    );
    report
  }

  /// Stops every task immediately, without cleanup or a final status. For
  /// simulating a process crash.
  pub async fn abort(mut self) {
    warn!(system = %self.shared.system, "aborting graph");
    if let Some((stop, handle)) = self.ticker.take() {
      stop.cancel();
      handle.abort();
      let _ = handle.await;
    }
    for (_, handle) in self.tasks.drain(..) {
      handle.abort();
      let _ = handle.await;
    }
    for handle in self.collectors.drain(..) {
      handle.abort();
      let _ = handle.await;
    }
  }
}

fn spawn_ticker(shared: Arc<Shared>, every: Duration, stop: CancellationToken) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = stop.cancelled() => break,
        _ = ticker.tick() => {
          if let Err(e) = shared.checkpoint().await {
            warn!(system = %shared.system, error = %e, "periodic checkpoint failed, retrying next interval");
          }
        }
      }
    }
  })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(message) = panic.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = panic.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub struct RunReport {
  /// System id.
  pub system: String,
  /// Outcome of each component.
  pub outcomes: BTreeMap<String, ComponentOutcome>,
  /// State each component deposited on exit.
  pub final_states: BTreeMap<String, Value>,
  /// Newest checkpoint of the run.
  pub last_checkpoint: Option<Epoch>,
  /// Envelopes retained by the error collector.
  pub errors: Vec<ErrorEnvelope>,
}

impl RunReport {
  /// Components that crashed, with their reasons.
  pub fn crashed(&self) -> impl Iterator<Item = (&str, &str)> {
    self.outcomes.iter().filter_map(|(name, outcome)| match outcome {
      ComponentOutcome::Crashed { reason } => Some((name.as_str(), reason.as_str())),
      _ => None,
    })
  }

  /// Whether every component completed.
  pub fn is_success(&self) -> bool {
    self.outcomes.values().all(|o| *o == ComponentOutcome::Completed)
  }

  /// Final state of one component.
  pub fn final_state(&self, component: &str) -> Option<&Value> {
    self.final_states.get(component)
  }
}
