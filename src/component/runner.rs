//! Pieces shared by the five primitive loops.

use super::body::{ComponentBody, ComponentContext};
use super::state::WindowBuffer;
use crate::checkpoint::{Deposit, Participant};
use crate::envelope::ErrorEnvelope;
use crate::error::{BodyError, ComponentCrash, ErrorCategory, PortError};
use crate::metrics::ComponentMetrics;
use crate::port::{Delivery, InputPort, OutputPort, Received};
use futures::future::{FutureExt, select_all};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Why a loop returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Exit {
  Completed,
  Cancelled,
}

pub(super) type LoopResult = Result<Exit, ComponentCrash>;

/// Everything a running loop owns besides the body.
pub(super) struct Frame {
  pub(super) name: String,
  pub(super) inputs: Vec<InputPort>,
  pub(super) data: Vec<OutputPort>,
  pub(super) errors: Vec<OutputPort>,
  pub(super) metrics: Arc<ComponentMetrics>,
  pub(super) ctx: ComponentContext,
  pub(super) window: Option<WindowBuffer>,
  pub(super) cursor: usize,
  pub(super) participant: Participant,
}

/// A per-item failure on its way to the `err_` port.
pub(super) struct ItemFailure {
  category: ErrorCategory,
  message: String,
  port: Option<String>,
  offset: Option<u64>,
  payload: Value,
}

impl ItemFailure {
  /// A body method failed while processing `payload`.
  pub(super) fn body(error: BodyError, port: Option<&str>, offset: Option<u64>, payload: Value) -> Self {
    Self {
      category: error.category(),
      message: error.to_string(),
      port: port.map(str::to_string),
      offset,
      payload,
    }
  }

  /// A send or receive failed.
  pub(super) fn port(error: PortError) -> Self {
    let category = error.category();
    let message = error.to_string();
    match error {
      PortError::Validation {
        port,
        offset,
        payload,
        ..
      } => Self {
        category,
        message,
        port: Some(port),
        offset,
        payload,
      },
      PortError::Closed { port, payload } => Self {
        category,
        message,
        port: Some(port),
        offset: None,
        payload: payload.unwrap_or(Value::Null),
      },
      PortError::BackpressureTimeout { port, .. } => Self {
        category,
        message,
        port: Some(port),
        offset: None,
        payload: Value::Null,
      },
      _ => Self {
        category,
        message,
        port: None,
        offset: None,
        payload: Value::Null,
      },
    }
  }
}

impl Frame {
  pub(super) fn crash(&self, reason: impl Into<String>) -> ComponentCrash {
    ComponentCrash {
      component: self.name.clone(),
      reason: reason.into(),
    }
  }

  /// Checkpointable state around a body snapshot.
  pub(super) fn state(&self, body: Result<Value, BodyError>) -> Deposit {
    super::capture(body, self.ctx.store_ref(), self.window.as_ref(), self.cursor)
  }

  /// State to deposit at the next safe point, captured only when a pause is
  /// pending.
  pub(super) fn deposit<B>(&self, body: &B) -> Option<Deposit>
  where
    B: ComponentBody + ?Sized,
  {
    self
      .participant
      .wants_snapshot()
      .then(|| self.state(body.snapshot()))
  }

  /// Routes a failure to the first `err_` port. Without one, or if the
  /// envelope cannot be delivered, the component crashes.
  pub(super) async fn fail(&self, failure: ItemFailure) -> Result<(), ComponentCrash> {
    self.metrics.record_error();
    let Some(port) = self.errors.first() else {
      return Err(self.crash(failure.message));
    };

    let mut envelope = ErrorEnvelope::new(
      self.ctx.system_id(),
      &self.name,
      failure.category,
      failure.message,
      failure.payload,
    )
    .with_offset(failure.offset);
    if let Some(origin) = failure.port {
      envelope = envelope.with_port(origin);
    }
    debug!(component = %self.name, category = %envelope.category, "item failed");

    port
      .send(envelope.to_value())
      .await
      .map(|_| ())
      .map_err(|e| self.crash(format!("cannot deliver error envelope: {e}")))
  }

  /// Sends `value` to every port in `targets`, awaiting each send
  /// independently, and routes every failed send to `err_`.
  pub(super) async fn broadcast(&self, targets: &[&OutputPort], value: &Value) -> Result<(), ComponentCrash> {
    let sends = targets.iter().map(|port| port.send(value.clone()));
    for result in futures::future::join_all(sends).await {
      if let Err(e) = result {
        self.fail(ItemFailure::port(e)).await?;
      }
    }
    Ok(())
  }
}

/// Result of polling a set of inputs.
pub(super) enum Selected {
  /// An item (or a failed receive) from input `index`.
  Item {
    index: usize,
    result: Result<Delivery, PortError>,
  },
  /// Pause or cancellation; go back to the safe point.
  Interrupted,
  /// Every input reached end-of-stream.
  Exhausted,
}

/// Round-robin selection over `inputs`.
///
/// Scans from `cursor`, takes the first ready item and moves the cursor past
/// that input. With nothing ready, waits on every open input.
pub(super) async fn select_input(
  inputs: &[InputPort],
  cursor: &mut usize,
  participant: &Participant,
) -> Selected {
  let count = inputs.len();
  loop {
    for step in 0..count {
      let index = (*cursor + step) % count;
      let port = &inputs[index];
      if port.is_finished() {
        continue;
      }
      let result = match port.try_receive() {
        Ok(Some(Received::Item(delivery))) => Ok(delivery),
        Ok(Some(Received::EndOfStream)) | Ok(None) => continue,
        Err(e) => Err(e),
      };
      *cursor = (index + 1) % count;
      return Selected::Item { index, result };
    }

    let open: Vec<_> = inputs
      .iter()
      .filter(|port| !port.is_finished())
      .map(|port| port.readable().boxed())
      .collect();
    if open.is_empty() {
      return Selected::Exhausted;
    }

    tokio::select! {
      biased;
      _ = participant.interrupted() => return Selected::Interrupted,
      _ = select_all(open) => {}
    }
  }
}

/// Receives from a single input, giving way to pause and cancellation.
pub(super) async fn receive_one(input: &InputPort, participant: &Participant) -> Selected {
  tokio::select! {
    biased;
    _ = participant.interrupted() => Selected::Interrupted,
    received = input.receive() => match received {
      Ok(Received::Item(delivery)) => Selected::Item { index: 0, result: Ok(delivery) },
      Ok(Received::EndOfStream) => Selected::Exhausted,
      Err(e) => Selected::Item { index: 0, result: Err(e) },
    },
  }
}
