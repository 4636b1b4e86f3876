//! Telemetry surface every component exposes.
//!
//! Each component carries counters for messages in/out/dropped/errors, a
//! queue depth gauge and histograms for per-item latency and blocked send
//! duration. Values are kept in process (so `status` can snapshot them) and
//! mirrored into the [`metrics`] facade so an external recorder (Prometheus,
//! OpenTelemetry) can be installed by the embedding process:
//!
//! - `portweave_messages_in_total{component,port}`
//! - `portweave_messages_out_total{component,port}`
//! - `portweave_dropped_total{component,port}`
//! - `portweave_errors_total{component}`
//! - `portweave_queue_depth{component,port}`
//! - `portweave_item_latency_seconds{component}`
//! - `portweave_blocked_seconds{component}`
//!
//! If no recorder is installed the facade calls are no-ops.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds (inclusive, microseconds) of the histogram buckets. A final
/// overflow bucket catches everything above the last bound.
pub const BUCKET_BOUNDS_MICROS: [u64; 14] = [
  50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 2_000_000,
  5_000_000,
];

/// Fixed-bucket latency histogram.
pub struct Histogram {
  buckets: [AtomicU64; BUCKET_BOUNDS_MICROS.len() + 1],
  count: AtomicU64,
  sum_micros: AtomicU64,
  max_micros: AtomicU64,
  export: metrics::Histogram,
}

impl Histogram {
  fn new(name: &'static str, component: &str) -> Self {
    Self {
      buckets: std::array::from_fn(|_| AtomicU64::new(0)),
      count: AtomicU64::new(0),
      sum_micros: AtomicU64::new(0),
      max_micros: AtomicU64::new(0),
      export: metrics::histogram!(name, "component" => component.to_string()),
    }
  }

  /// Records one observation.
  pub fn record(&self, elapsed: Duration) {
    let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
    let index = BUCKET_BOUNDS_MICROS
      .iter()
      .position(|bound| micros <= *bound)
      .unwrap_or(BUCKET_BOUNDS_MICROS.len());
    self.buckets[index].fetch_add(1, Ordering::Relaxed);
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    self.max_micros.fetch_max(micros, Ordering::Relaxed);
    self.export.record(elapsed.as_secs_f64());
  }

  /// Point-in-time copy.
  pub fn snapshot(&self) -> HistogramSnapshot {
    let buckets = self
      .buckets
      .iter()
      .enumerate()
      .map(|(i, count)| BucketCount {
        le_micros: BUCKET_BOUNDS_MICROS.get(i).copied(),
        count: count.load(Ordering::Relaxed),
      })
      .collect();
    HistogramSnapshot {
      count: self.count.load(Ordering::Relaxed),
      sum_micros: self.sum_micros.load(Ordering::Relaxed),
      max_micros: self.max_micros.load(Ordering::Relaxed),
      buckets,
    }
  }
}

/// One histogram bucket. `le_micros == None` is the overflow bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCount {
  /// Inclusive upper bound in microseconds.
  pub le_micros: Option<u64>,
  /// Observations in this bucket (not cumulative).
  pub count: u64,
}

/// Snapshot of a [`Histogram`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
  /// Number of observations.
  pub count: u64,
  /// Sum of observations in microseconds.
  pub sum_micros: u64,
  /// Largest observation in microseconds.
  pub max_micros: u64,
  /// Per-bucket counts.
  pub buckets: Vec<BucketCount>,
}

/// Counters owned by a single port.
pub struct PortMetrics {
  messages: AtomicU64,
  dropped: AtomicU64,
  errors: AtomicU64,
  sequence: AtomicU64,
  export_messages: metrics::Counter,
  export_dropped: metrics::Counter,
  export_depth: metrics::Gauge,
}

impl PortMetrics {
  /// Creates metrics for an input port.
  pub fn input(component: &str, port: &str) -> Self {
    Self::new("portweave_messages_in_total", component, port)
  }

  /// Creates metrics for an output port.
  pub fn output(component: &str, port: &str) -> Self {
    Self::new("portweave_messages_out_total", component, port)
  }

  fn new(messages_name: &'static str, component: &str, port: &str) -> Self {
    let labels = [
      ("component", component.to_string()),
      ("port", port.to_string()),
    ];
    Self {
      messages: AtomicU64::new(0),
      dropped: AtomicU64::new(0),
      errors: AtomicU64::new(0),
      sequence: AtomicU64::new(0),
      export_messages: metrics::counter!(messages_name, &labels),
      export_dropped: metrics::counter!("portweave_dropped_total", &labels),
      export_depth: metrics::gauge!("portweave_queue_depth", &labels),
    }
  }

  /// Counts one message and returns its sequence number.
  pub(crate) fn record_message(&self) -> u64 {
    self.messages.fetch_add(1, Ordering::Relaxed);
    self.export_messages.increment(1);
    self.sequence.fetch_add(1, Ordering::AcqRel) + 1
  }

  pub(crate) fn record_dropped(&self) {
    self.dropped.fetch_add(1, Ordering::Relaxed);
    self.export_dropped.increment(1);
  }

  pub(crate) fn record_error(&self) {
    self.errors.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn set_queue_depth(&self, depth: usize) {
    self.export_depth.set(depth as f64);
  }

  /// Restores the absolute sequence number from a checkpoint.
  pub(crate) fn set_sequence(&self, sequence: u64) {
    self.sequence.store(sequence, Ordering::Release);
  }

  /// Last sequence number sent or received on this port.
  pub fn sequence(&self) -> u64 {
    self.sequence.load(Ordering::Acquire)
  }

  /// Messages counted in this run.
  pub fn messages(&self) -> u64 {
    self.messages.load(Ordering::Relaxed)
  }

  /// Items dropped on this port.
  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  /// Validation failures on this port.
  pub fn errors(&self) -> u64 {
    self.errors.load(Ordering::Relaxed)
  }

  /// Point-in-time copy; `queue_depth` is supplied by the caller that can see
  /// the channel.
  pub fn snapshot(&self, queue_depth: usize) -> PortMetricsSnapshot {
    PortMetricsSnapshot {
      messages: self.messages(),
      dropped: self.dropped(),
      errors: self.errors(),
      sequence: self.sequence(),
      queue_depth: queue_depth as u64,
    }
  }
}

/// Snapshot of [`PortMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMetricsSnapshot {
  /// Messages counted in this run.
  pub messages: u64,
  /// Items dropped.
  pub dropped: u64,
  /// Validation failures.
  pub errors: u64,
  /// Absolute sequence number.
  pub sequence: u64,
  /// Items buffered (inputs only).
  pub queue_depth: u64,
}

/// Counters and histograms owned by a component.
pub struct ComponentMetrics {
  component: String,
  messages_in: AtomicU64,
  messages_out: AtomicU64,
  dropped: AtomicU64,
  errors: AtomicU64,
  latency: Histogram,
  blocked: Histogram,
  export_errors: metrics::Counter,
}

impl ComponentMetrics {
  /// Creates the metric set for `component`.
  pub fn new(component: &str) -> Self {
    Self {
      component: component.to_string(),
      messages_in: AtomicU64::new(0),
      messages_out: AtomicU64::new(0),
      dropped: AtomicU64::new(0),
      errors: AtomicU64::new(0),
      latency: Histogram::new("portweave_item_latency_seconds", component),
      blocked: Histogram::new("portweave_blocked_seconds", component),
      export_errors: metrics::counter!(
        "portweave_errors_total",
        "component" => component.to_string()
      ),
    }
  }

  /// Component these metrics belong to.
  pub fn component(&self) -> &str {
    &self.component
  }

  pub(crate) fn record_in(&self) {
    self.messages_in.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_out(&self) {
    self.messages_out.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_dropped(&self) {
    self.dropped.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_error(&self) {
    self.errors.fetch_add(1, Ordering::Relaxed);
    self.export_errors.increment(1);
  }

  pub(crate) fn record_latency(&self, elapsed: Duration) {
    self.latency.record(elapsed);
  }

  pub(crate) fn record_blocked(&self, elapsed: Duration) {
    self.blocked.record(elapsed);
  }

  /// Messages received across all inputs.
  pub fn messages_in(&self) -> u64 {
    self.messages_in.load(Ordering::Relaxed)
  }

  /// Messages sent across all data outputs.
  pub fn messages_out(&self) -> u64 {
    self.messages_out.load(Ordering::Relaxed)
  }

  /// Items dropped at this component's ingress ports.
  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  /// Failures reported (envelopes emitted or crash).
  pub fn errors(&self) -> u64 {
    self.errors.load(Ordering::Relaxed)
  }

  /// Point-in-time copy; `queue_depth` is the sum over input buffers.
  pub fn snapshot(&self, queue_depth: usize) -> ComponentMetricsSnapshot {
    ComponentMetricsSnapshot {
      messages_in: self.messages_in(),
      messages_out: self.messages_out(),
      dropped: self.dropped(),
      errors: self.errors(),
      queue_depth: queue_depth as u64,
      latency: self.latency.snapshot(),
      blocked: self.blocked.snapshot(),
    }
  }
}

/// Snapshot of [`ComponentMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentMetricsSnapshot {
  /// Messages received.
  pub messages_in: u64,
  /// Messages sent on data outputs.
  pub messages_out: u64,
  /// Items dropped at ingress.
  pub dropped: u64,
  /// Failures reported.
  pub errors: u64,
  /// Items buffered across inputs.
  pub queue_depth: u64,
  /// Per-item processing latency.
  pub latency: HistogramSnapshot,
  /// Time spent blocked on full output buffers.
  pub blocked: HistogramSnapshot,
}
