//! Bound port endpoints: the sending side ([`OutputPort`], [`IngressSender`])
//! and the receiving side ([`InputPort`]).

use super::channel::{Channel, TryRecv};
use super::schema::PortSchema;
use super::spec::{DEFAULT_INGRESS_TIMEOUT, OverflowPolicy, PortKind, PortSpec};
use crate::checkpoint::PauseSignal;
use crate::error::PortError;
use crate::metrics::{ComponentMetrics, PortMetrics};
use async_stream::stream;
use futures::Stream;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// One received item and its sequence number on the port.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
  /// Absolute sequence number (1-based, continues across restores).
  pub seq: u64,
  /// The value.
  pub value: Value,
}

/// Result of a successful receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
  /// An item.
  Item(Delivery),
  /// The channel is closed and drained.
  EndOfStream,
}

/// Sending endpoint, either a data output (`out_*`) or an error output
/// (`err_*`).
pub struct OutputPort {
  spec: PortSpec,
  kind: PortKind,
  component: String,
  link: Option<(Arc<Channel>, PauseSignal)>,
  metrics: Arc<PortMetrics>,
  component_metrics: Arc<ComponentMetrics>,
}

impl OutputPort {
  /// Creates an unbound output port owned by `component_metrics`'
  /// component.
  pub fn new(spec: PortSpec, component_metrics: Arc<ComponentMetrics>) -> Result<Self, PortError> {
    let kind = spec.kind()?;
    if !kind.is_outbound() {
      return Err(PortError::InvalidName(spec.name));
    }
    let component = component_metrics.component().to_string();
    Ok(Self {
      metrics: Arc::new(PortMetrics::output(&component, &spec.name)),
      spec,
      kind,
      component,
      link: None,
      component_metrics,
    })
  }

  /// Port name.
  pub fn name(&self) -> &str {
    &self.spec.name
  }

  /// Declaration.
  pub fn spec(&self) -> &PortSpec {
    &self.spec
  }

  /// Whether this is an `err_` port.
  pub fn is_error(&self) -> bool {
    self.kind == PortKind::Error
  }

  /// Whether the port is bound to a channel.
  pub fn is_connected(&self) -> bool {
    self.link.is_some()
  }

  /// Whether the receiving side has gone away.
  pub fn is_closed(&self) -> bool {
    self
      .link
      .as_ref()
      .is_some_and(|(channel, _)| channel.is_receiver_closed())
  }

  /// Port counters.
  pub fn metrics(&self) -> &Arc<PortMetrics> {
    &self.metrics
  }

  pub(crate) fn bind(&mut self, channel: Arc<Channel>, pause: PauseSignal) -> Result<(), PortError> {
    if self.link.is_some() {
      return Err(PortError::AlreadyConnected(self.qualified()));
    }
    self.link = Some((channel, pause));
    Ok(())
  }

  fn qualified(&self) -> String {
    format!("{}.{}", self.component, self.spec.name)
  }

  /// Checks `value` against the port schema, counting a failure as a port
  /// error.
  pub fn validate(&self, value: &Value) -> Result<(), PortError> {
    self.spec.schema.check(value).map_err(|message| {
      self.metrics.record_error();
      PortError::Validation {
        port: self.spec.name.clone(),
        offset: None,
        message,
        payload: value.clone(),
      }
    })
  }

  /// Validates `value` and places it in the channel according to the port's
  /// overflow policy. Returns the item's sequence number.
  pub async fn send(&self, value: Value) -> Result<u64, PortError> {
    self.validate(&value)?;
    let (channel, pause) = self
      .link
      .as_ref()
      .ok_or_else(|| PortError::NotConnected(self.qualified()))?;

    let started = Instant::now();
    let sent = match self.spec.overflow_policy {
      OverflowPolicy::Block => channel.send(value, Some(pause)).await,
      OverflowPolicy::BlockWithTimeout(bound) => {
        match tokio::time::timeout(bound, channel.send(value, None)).await {
          Ok(sent) => sent,
          Err(_) => {
            self.metrics.record_dropped();
            self.component_metrics.record_dropped();
            return Err(PortError::BackpressureTimeout {
              port: self.spec.name.clone(),
              waited: started.elapsed(),
            });
          }
        }
      }
    };

    match sent {
      Ok(waited) => {
        if waited {
          self.component_metrics.record_blocked(started.elapsed());
        }
        if self.kind == PortKind::Output {
          self.component_metrics.record_out();
        }
        let seq = self.metrics.record_message();
        trace!(component = %self.component, port = %self.spec.name, seq, "sent");
        Ok(seq)
      }
      Err(value) => Err(PortError::Closed {
        port: self.spec.name.clone(),
        payload: Some(value),
      }),
    }
  }
}

impl Drop for OutputPort {
  fn drop(&mut self) {
    if let Some((channel, _)) = &self.link {
      channel.close_sender();
    }
  }
}

/// Receiving endpoint (`in_*`).
pub struct InputPort {
  spec: PortSpec,
  component: String,
  channel: Option<Arc<Channel>>,
  metrics: Arc<PortMetrics>,
  component_metrics: Arc<ComponentMetrics>,
}

impl InputPort {
  /// Creates an unbound input port.
  pub fn new(spec: PortSpec, component_metrics: Arc<ComponentMetrics>) -> Result<Self, PortError> {
    if spec.kind()? != PortKind::Input {
      return Err(PortError::InvalidName(spec.name));
    }
    let component = component_metrics.component().to_string();
    Ok(Self {
      metrics: Arc::new(PortMetrics::input(&component, &spec.name)),
      spec,
      component,
      channel: None,
      component_metrics,
    })
  }

  /// Port name.
  pub fn name(&self) -> &str {
    &self.spec.name
  }

  /// Declaration.
  pub fn spec(&self) -> &PortSpec {
    &self.spec
  }

  /// Whether the port is bound to a channel.
  pub fn is_connected(&self) -> bool {
    self.channel.is_some()
  }

  /// Port counters.
  pub fn metrics(&self) -> &Arc<PortMetrics> {
    &self.metrics
  }

  /// Items currently buffered.
  pub fn queue_depth(&self) -> usize {
    self.channel.as_ref().map_or(0, |channel| channel.len())
  }

  /// Whether the channel is closed and drained (or was never bound).
  pub fn is_finished(&self) -> bool {
    self.channel.as_ref().is_none_or(|channel| channel.is_drained())
  }

  pub(crate) fn bind(&mut self, channel: Arc<Channel>) -> Result<(), PortError> {
    if self.channel.is_some() {
      return Err(PortError::AlreadyConnected(format!(
        "{}.{}",
        self.component, self.spec.name
      )));
    }
    self.channel = Some(channel);
    Ok(())
  }

  pub(crate) fn channel(&self) -> Option<&Arc<Channel>> {
    self.channel.as_ref()
  }

  fn connected(&self) -> Result<&Arc<Channel>, PortError> {
    self
      .channel
      .as_ref()
      .ok_or_else(|| PortError::NotConnected(format!("{}.{}", self.component, self.spec.name)))
  }

  fn accept(&self, value: Value, depth: usize) -> Result<Received, PortError> {
    let seq = self.metrics.record_message();
    self.metrics.set_queue_depth(depth);
    self.component_metrics.record_in();
    if let Err(message) = self.spec.schema.check(&value) {
      self.metrics.record_error();
      return Err(PortError::Validation {
        port: self.spec.name.clone(),
        offset: Some(seq),
        message,
        payload: value,
      });
    }
    Ok(Received::Item(Delivery { seq, value }))
  }

  /// Waits for the next item. Returns [`Received::EndOfStream`] once the
  /// sender closed and the buffer drained.
  ///
  /// A value failing the schema is consumed and returned as
  /// [`PortError::Validation`] carrying its sequence number.
  pub async fn receive(&self) -> Result<Received, PortError> {
    let channel = self.connected()?;
    match channel.recv().await {
      Some(value) => self.accept(value, channel.len()),
      None => Ok(Received::EndOfStream),
    }
  }

  /// Non-blocking receive; `Ok(None)` when nothing is buffered yet.
  pub fn try_receive(&self) -> Result<Option<Received>, PortError> {
    let channel = self.connected()?;
    match channel.try_recv() {
      TryRecv::Item(value) => self.accept(value, channel.len()).map(Some),
      TryRecv::Closed => Ok(Some(Received::EndOfStream)),
      TryRecv::Empty => Ok(None),
    }
  }

  /// Completes when [`try_receive`](Self::try_receive) would return
  /// something.
  pub async fn readable(&self) {
    match &self.channel {
      Some(channel) => channel.readable().await,
      None => std::future::pending().await,
    }
  }

  /// Lazy sequence of deliveries, ending at end-of-stream.
  pub fn stream(&self) -> impl Stream<Item = Result<Delivery, PortError>> + '_ {
    stream! {
      loop {
        match self.receive().await {
          Ok(Received::Item(delivery)) => yield Ok(delivery),
          Ok(Received::EndOfStream) => break,
          Err(e @ PortError::NotConnected(_)) => {
            yield Err(e);
            break;
          }
          Err(e) => yield Err(e),
        }
      }
    }
  }
}

impl Drop for InputPort {
  fn drop(&mut self) {
    if let Some(channel) = &self.channel {
      channel.close_receiver();
    }
  }
}

/// Sending handle for an ingress port, held by the collaborator at the system
/// boundary.
///
/// Values are checked against the port's schema before they are buffered.
/// Sends are always bounded: a full buffer makes the send wait up to the
/// port's timeout, then the value is dropped and
/// [`PortError::BackpressureTimeout`] returned. Dropping the sender closes
/// the port.
pub struct IngressSender {
  port: String,
  schema: PortSchema,
  channel: Arc<Channel>,
  timeout: Duration,
  metrics: Arc<PortMetrics>,
  component_metrics: Arc<ComponentMetrics>,
}

impl IngressSender {
  pub(crate) fn new(input: &InputPort, channel: Arc<Channel>) -> Self {
    let timeout = match input.spec.overflow_policy {
      OverflowPolicy::BlockWithTimeout(bound) => bound,
      OverflowPolicy::Block => DEFAULT_INGRESS_TIMEOUT,
    };
    Self {
      port: format!("{}.{}", input.component, input.spec.name),
      schema: input.spec.schema.clone(),
      channel,
      timeout,
      metrics: Arc::clone(&input.metrics),
      component_metrics: Arc::clone(&input.component_metrics),
    }
  }

  /// Qualified `component.port` name of the destination.
  pub fn port(&self) -> &str {
    &self.port
  }

  /// Bound on a single send.
  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Sends one value into the graph.
  ///
  /// A value failing the port's schema is rejected with
  /// [`PortError::Validation`] and never enters the graph.
  pub async fn send(&self, value: Value) -> Result<(), PortError> {
    if let Err(message) = self.schema.check(&value) {
      self.metrics.record_error();
      return Err(PortError::Validation {
        port: self.port.clone(),
        offset: None,
        message,
        payload: value,
      });
    }
    let started = Instant::now();
    match tokio::time::timeout(self.timeout, self.channel.send(value, None)).await {
      Ok(Ok(_)) => Ok(()),
      Ok(Err(value)) => Err(PortError::Closed {
        port: self.port.clone(),
        payload: Some(value),
      }),
      Err(_) => {
        self.metrics.record_dropped();
        self.component_metrics.record_dropped();
        Err(PortError::BackpressureTimeout {
          port: self.port.clone(),
          waited: started.elapsed(),
        })
      }
    }
  }
}

impl Drop for IngressSender {
  fn drop(&mut self) {
    self.channel.close_sender();
  }
}

/// Binds `output` to `input` through a fresh channel sized by the input's
/// buffer.
pub(crate) fn link(
  output: &mut OutputPort,
  input: &mut InputPort,
  pause: PauseSignal,
) -> Result<Arc<Channel>, PortError> {
  if output.is_connected() {
    return Err(PortError::AlreadyConnected(output.qualified()));
  }
  let channel = Arc::new(Channel::new(input.spec.buffer_size));
  input.bind(Arc::clone(&channel))?;
  output.bind(Arc::clone(&channel), pause)?;
  Ok(channel)
}

/// Connects two standalone ports with no pause coordination.
pub fn connect(output: &mut OutputPort, input: &mut InputPort) -> Result<(), PortError> {
  link(output, input, PauseSignal::never()).map(|_| ())
}

/// Gives `input` a channel fed by the returned ingress sender.
pub fn ingress(input: &mut InputPort) -> Result<IngressSender, PortError> {
  let channel = Arc::new(Channel::new(input.spec.buffer_size));
  input.bind(Arc::clone(&channel))?;
  Ok(IngressSender::new(input, channel))
}
