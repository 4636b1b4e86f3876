//! Stop-the-world pause used by checkpoints.
//!
//! The coordinator raises a flag; every running component notices it at its
//! next safe point (between items), deposits a snapshot of its state and
//! parks. Once every live component is parked the coordinator reads the
//! deposited snapshots together with the channel contents, writes the
//! checkpoint and lowers the flag.
//!
//! Components that already finished leave their final state behind so a
//! checkpoint taken after they exit still covers them.

use crate::error::CheckpointError;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Snapshot deposited by a component: its state or the reason it could not
/// produce one.
pub type Deposit = Result<Value, String>;

/// Key of the state recorded for a component that died without depositing
/// one.
pub const CRASHED_KEY: &str = "crashed";

/// State standing in for a component that crashed before its final deposit.
pub fn crashed_state(reason: &str) -> Value {
  json!({ CRASHED_KEY: reason })
}

#[derive(Default)]
struct BarrierState {
  live: BTreeSet<String>,
  parked: BTreeMap<String, Deposit>,
  finished: BTreeMap<String, Deposit>,
}

/// Coordinator side of the pause barrier.
pub struct PauseController {
  requested: watch::Sender<bool>,
  state: Mutex<BarrierState>,
  changed: Notify,
}

impl Default for PauseController {
  fn default() -> Self {
    Self::new()
  }
}

impl PauseController {
  /// Creates a controller with no participants and the flag lowered.
  pub fn new() -> Self {
    let (requested, _) = watch::channel(false);
    Self {
      requested,
      state: Mutex::new(BarrierState::default()),
      changed: Notify::new(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, BarrierState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Read-only view of the flag, handed to ports so blocked sends can
  /// complete while a pause is pending.
  pub fn signal(&self) -> PauseSignal {
    PauseSignal {
      rx: self.requested.subscribe(),
    }
  }

  /// Registers a running component. The returned participant deregisters
  /// itself when dropped.
  pub fn register(
    self: &Arc<Self>,
    name: impl Into<String>,
    cancel: CancellationToken,
  ) -> Participant {
    let name = name.into();
    self.lock().live.insert(name.clone());
    Participant {
      controller: Arc::clone(self),
      signal: self.signal(),
      name,
      cancel,
      left: false,
    }
  }

  /// Number of components still running.
  pub fn live(&self) -> usize {
    self.lock().live.len()
  }

  /// Final states deposited by components that already exited.
  pub fn finished(&self) -> BTreeMap<String, Deposit> {
    self.lock().finished.clone()
  }

  /// Raises the flag and waits until every live component has parked.
  ///
  /// On timeout the flag is lowered again and the components keep running.
  pub async fn pause(self: &Arc<Self>, timeout: Duration) -> Result<PauseGuard, CheckpointError> {
    self.requested.send_replace(true);
    debug!("pause requested");

    let all_parked = async {
      loop {
        let notified = self.changed.notified();
        {
          let state = self.lock();
          if state.live.iter().all(|name| state.parked.contains_key(name)) {
            return;
          }
        }
        notified.await;
      }
    };

    match tokio::time::timeout(timeout, all_parked).await {
      Ok(()) => Ok(PauseGuard {
        controller: Arc::clone(self),
      }),
      Err(_) => {
        let busy = {
          let state = self.lock();
          state
            .live
            .iter()
            .filter(|name| !state.parked.contains_key(*name))
            .count()
        };
        self.resume();
        Err(CheckpointError::PauseTimeout(timeout, busy))
      }
    }
  }

  fn resume(&self) {
    self.requested.send_replace(false);
    debug!("pause lifted");
  }

  fn park(&self, name: &str, deposit: Deposit) {
    self.lock().parked.insert(name.to_string(), deposit);
    self.changed.notify_waiters();
    trace!(component = name, "parked");
  }

  fn unpark(&self, name: &str) {
    self.lock().parked.remove(name);
  }

  /// Records that `name` crashed with `reason`, replacing any state it left.
  pub fn record_crash(&self, name: &str, reason: &str) {
    self.leave(name, Some(Ok(crashed_state(reason))));
  }

  fn leave(&self, name: &str, deposit: Option<Deposit>) {
    {
      let mut state = self.lock();
      state.live.remove(name);
      state.parked.remove(name);
      match deposit {
        Some(deposit) => {
          state.finished.insert(name.to_string(), deposit);
        }
        None => {
          state
            .finished
            .entry(name.to_string())
            .or_insert_with(|| Ok(crashed_state("exited without a final state")));
        }
      }
    }
    self.changed.notify_waiters();
  }
}

/// Held by the coordinator while the graph is paused; lowers the flag when
/// dropped.
pub struct PauseGuard {
  controller: Arc<PauseController>,
}

impl PauseGuard {
  /// Snapshots of every component: parked ones and those that already
  /// finished.
  pub fn snapshots(&self) -> BTreeMap<String, Deposit> {
    let state = self.controller.lock();
    let mut all = state.finished.clone();
    for (name, deposit) in &state.parked {
      all.insert(name.clone(), deposit.clone());
    }
    all
  }
}

impl Drop for PauseGuard {
  fn drop(&mut self) {
    self.controller.resume();
  }
}

/// Read-only view of the pause flag.
#[derive(Clone)]
pub struct PauseSignal {
  rx: watch::Receiver<bool>,
}

impl PauseSignal {
  /// A signal that is never raised, for ports used outside a graph.
  pub fn never() -> Self {
    let (_tx, rx) = watch::channel(false);
    Self { rx }
  }

  /// Whether a pause is currently requested.
  pub fn is_requested(&self) -> bool {
    *self.rx.borrow()
  }

  /// Completes once a pause is requested.
  pub async fn requested(&self) {
    let mut rx = self.rx.clone();
    if rx.wait_for(|requested| *requested).await.is_err() {
      // Controller gone: no pause will ever come.
      std::future::pending::<()>().await;
    }
  }

  async fn lifted(&self) {
    let mut rx = self.rx.clone();
    let _ = rx.wait_for(|requested| !*requested).await;
  }
}

/// What a component does after a safe point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafePoint {
  /// Keep processing.
  Continue,
  /// Cancellation was observed; shut down.
  Stop,
}

/// Component side of the pause barrier.
pub struct Participant {
  controller: Arc<PauseController>,
  signal: PauseSignal,
  name: String,
  cancel: CancellationToken,
  left: bool,
}

impl Participant {
  /// The pause flag, for use in `select!` while waiting on inputs.
  pub fn signal(&self) -> &PauseSignal {
    &self.signal
  }

  /// Cancellation token of this component.
  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  /// Completes when either a pause is requested or the component is
  /// cancelled.
  pub async fn interrupted(&self) {
    tokio::select! {
      _ = self.signal.requested() => {}
      _ = self.cancel.cancelled() => {}
    }
  }

  /// Whether the next safe point will park, so the caller should capture
  /// its state first.
  pub fn wants_snapshot(&self) -> bool {
    !self.cancel.is_cancelled() && self.signal.is_requested()
  }

  /// Between-items suspension point.
  ///
  /// With a pause pending and a `deposit` captured, parks until the pause
  /// lifts. Returns [`SafePoint::Stop`] once cancellation is observed.
  pub async fn safe_point(&self, deposit: Option<Deposit>) -> SafePoint {
    if self.cancel.is_cancelled() {
      return SafePoint::Stop;
    }
    let deposit = match deposit {
      Some(deposit) if self.signal.is_requested() => deposit,
      _ => return SafePoint::Continue,
    };

    self.controller.park(&self.name, deposit);
    let outcome = tokio::select! {
      _ = self.signal.lifted() => SafePoint::Continue,
      _ = self.cancel.cancelled() => SafePoint::Stop,
    };
    self.controller.unpark(&self.name);
    outcome
  }

  /// Deregisters with the component's final state.
  pub fn finish(mut self, deposit: Deposit) {
    self.controller.leave(&self.name, Some(deposit));
    self.left = true;
  }
}

impl Drop for Participant {
  fn drop(&mut self) {
    if !self.left {
      self.controller.leave(&self.name, None);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn pause_waits_for_every_participant() {
    let controller = Arc::new(PauseController::new());
    let a = controller.register("a", CancellationToken::new());
    let b = controller.register("b", CancellationToken::new());

    let pausing = {
      let controller = Arc::clone(&controller);
      tokio::spawn(async move { controller.pause(Duration::from_secs(5)).await })
    };
    tokio::task::yield_now().await;
    while !a.signal().is_requested() {
      tokio::task::yield_now().await;
    }

    let parked_a = tokio::spawn(async move {
      let outcome = a.safe_point(Some(Ok(json!(1)))).await;
      (a, outcome)
    });
    let parked_b = tokio::spawn(async move {
      let outcome = b.safe_point(Some(Ok(json!(2)))).await;
      (b, outcome)
    });

    let guard = pausing.await.unwrap().unwrap();
    let snapshots = guard.snapshots();
    assert_eq!(snapshots["a"], Ok(json!(1)));
    assert_eq!(snapshots["b"], Ok(json!(2)));
    drop(guard);

    let (_a, outcome) = parked_a.await.unwrap();
    assert_eq!(outcome, SafePoint::Continue);
    let (_b, outcome) = parked_b.await.unwrap();
    assert_eq!(outcome, SafePoint::Continue);
  }

  #[tokio::test(start_paused = true)]
  async fn pause_times_out_and_lifts_flag() {
    let controller = Arc::new(PauseController::new());
    let busy = controller.register("busy", CancellationToken::new());

    let result = controller.pause(Duration::from_secs(1)).await;
    assert!(matches!(result, Err(CheckpointError::PauseTimeout(_, 1))));
    assert!(!busy.signal().is_requested());
  }

  #[tokio::test]
  async fn finished_components_keep_their_final_state() {
    let controller = Arc::new(PauseController::new());
    let done = controller.register("done", CancellationToken::new());
    done.finish(Ok(json!({"count": 3})));
    assert_eq!(controller.live(), 0);

    let guard = controller.pause(Duration::from_secs(1)).await.unwrap();
    assert_eq!(guard.snapshots()["done"], Ok(json!({"count": 3})));
  }

  #[tokio::test]
  async fn dropped_participant_leaves_a_crashed_state() {
    let controller = Arc::new(PauseController::new());
    let lost = controller.register("lost", CancellationToken::new());
    drop(lost);
    assert_eq!(controller.live(), 0);

    let guard = controller.pause(Duration::from_secs(1)).await.unwrap();
    assert_eq!(
      guard.snapshots()["lost"],
      Ok(json!({"crashed": "exited without a final state"}))
    );
  }

  #[tokio::test]
  async fn recorded_crash_reason_wins_over_the_drop() {
    let controller = Arc::new(PauseController::new());
    let first = controller.register("a", CancellationToken::new());
    controller.record_crash("a", "panicked: boom");
    drop(first);
    let second = controller.register("b", CancellationToken::new());
    drop(second);
    controller.record_crash("b", "panicked: bang");

    let finished = controller.finished();
    assert_eq!(finished["a"], Ok(crashed_state("panicked: boom")));
    assert_eq!(finished["b"], Ok(crashed_state("panicked: bang")));
  }

  #[tokio::test]
  async fn cancellation_stops_at_safe_point() {
    let controller = Arc::new(PauseController::new());
    let token = CancellationToken::new();
    let participant = controller.register("c", token.clone());
    token.cancel();
    assert_eq!(participant.safe_point(Some(Ok(Value::Null))).await, SafePoint::Stop);
  }
}
