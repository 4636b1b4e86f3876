//! Bounded single-producer single-consumer channel between two ports.
//!
//! The buffer is a plain `VecDeque` behind a mutex so the checkpoint path can
//! read (and restore) its contents while the graph is paused. Two `Notify`s
//! wake the consumer when an item arrives and the producer when space frees.

use crate::checkpoint::PauseSignal;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Outcome of a non-blocking receive.
#[derive(Debug, PartialEq)]
pub(crate) enum TryRecv {
  Item(Value),
  Empty,
  Closed,
}

#[derive(Default)]
struct ChannelState {
  queue: VecDeque<Value>,
  sender_closed: bool,
  receiver_closed: bool,
}

pub(crate) struct Channel {
  capacity: usize,
  state: Mutex<ChannelState>,
  items: Notify,
  space: Notify,
}

impl Channel {
  pub(crate) fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      state: Mutex::new(ChannelState::default()),
      items: Notify::new(),
      space: Notify::new(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, ChannelState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }

  /// Waits for space and enqueues `value`.
  ///
  /// With `overrun` set, a send blocked on a full buffer completes beyond
  /// capacity once a pause is requested. Returns `Ok(true)` if the send had
  /// to wait, and gives the value back if the receiver is gone.
  pub(crate) async fn send(&self, value: Value, overrun: Option<&PauseSignal>) -> Result<bool, Value> {
    let mut waited = false;
    loop {
      let space = self.space.notified();
      {
        let mut state = self.lock();
        if state.receiver_closed {
          return Err(value);
        }
        let paused = overrun.is_some_and(PauseSignal::is_requested);
        if state.queue.len() < self.capacity || paused {
          state.queue.push_back(value);
          drop(state);
          self.items.notify_one();
          return Ok(waited);
        }
      }
      waited = true;
      match overrun {
        Some(pause) => {
          tokio::select! {
            _ = space => {}
            _ = pause.requested() => {}
          }
        }
        None => space.await,
      }
    }
  }

  /// Dequeues the next value; `None` once the sender closed and the buffer
  /// drained.
  pub(crate) async fn recv(&self) -> Option<Value> {
    loop {
      let items = self.items.notified();
      match self.try_recv() {
        TryRecv::Item(value) => return Some(value),
        TryRecv::Closed => return None,
        TryRecv::Empty => items.await,
      }
    }
  }

  pub(crate) fn try_recv(&self) -> TryRecv {
    let mut state = self.lock();
    match state.queue.pop_front() {
      Some(value) => {
        drop(state);
        self.space.notify_one();
        TryRecv::Item(value)
      }
      None if state.sender_closed => TryRecv::Closed,
      None => TryRecv::Empty,
    }
  }

  /// Completes when an item is buffered or the sender closed.
  pub(crate) async fn readable(&self) {
    loop {
      let items = self.items.notified();
      {
        let state = self.lock();
        if !state.queue.is_empty() || state.sender_closed {
          return;
        }
      }
      items.await;
    }
  }

  pub(crate) fn close_sender(&self) {
    self.lock().sender_closed = true;
    self.items.notify_waiters();
  }

  pub(crate) fn close_receiver(&self) {
    self.lock().receiver_closed = true;
    self.space.notify_waiters();
  }

  pub(crate) fn is_receiver_closed(&self) -> bool {
    self.lock().receiver_closed
  }

  pub(crate) fn is_drained(&self) -> bool {
    let state = self.lock();
    state.sender_closed && state.queue.is_empty()
  }

  pub(crate) fn len(&self) -> usize {
    self.lock().queue.len()
  }

  /// Copy of the buffered values, oldest first.
  pub(crate) fn snapshot(&self) -> Vec<Value> {
    self.lock().queue.iter().cloned().collect()
  }

  /// Puts restored values back into the buffer, ahead of anything sent later.
  pub(crate) fn preload(&self, values: Vec<Value>) {
    {
      let mut state = self.lock();
      for value in values.into_iter().rev() {
        state.queue.push_front(value);
      }
    }
    self.items.notify_one();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Arc;

  #[tokio::test]
  async fn fifo_then_end_of_stream() {
    let channel = Channel::new(4);
    channel.send(json!(1), None).await.unwrap();
    channel.send(json!(2), None).await.unwrap();
    channel.close_sender();
    assert_eq!(channel.recv().await, Some(json!(1)));
    assert_eq!(channel.recv().await, Some(json!(2)));
    assert_eq!(channel.recv().await, None);
  }

  #[tokio::test]
  async fn send_after_receiver_closed_returns_value() {
    let channel = Channel::new(1);
    channel.close_receiver();
    assert_eq!(channel.send(json!("x"), None).await, Err(json!("x")));
  }

  #[tokio::test]
  async fn preload_goes_ahead_of_new_items() {
    let channel = Arc::new(Channel::new(8));
    channel.send(json!(3), None).await.unwrap();
    channel.preload(vec![json!(1), json!(2)]);
    assert_eq!(channel.snapshot(), vec![json!(1), json!(2), json!(3)]);
    assert_eq!(channel.try_recv(), TryRecv::Item(json!(1)));
  }

  #[tokio::test]
  async fn readable_wakes_on_close() {
    let channel = Arc::new(Channel::new(1));
    let waiter = {
      let channel = Arc::clone(&channel);
      tokio::spawn(async move { channel.readable().await })
    };
    tokio::task::yield_now().await;
    channel.close_sender();
    waiter.await.unwrap();
    assert_eq!(channel.try_recv(), TryRecv::Closed);
    assert!(channel.is_drained());
  }
}
