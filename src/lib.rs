//! # portweave
//!
//! Runtime core for component graphs built from typed ports and a closed set
//! of primitives.
//!
//! Every component is one of five primitives (Source, Sink, Transformer,
//! Splitter, Merger). Behaviour beyond that comes from recipes: named,
//! versioned templates expanded once when a topology is wired. Components
//! exchange JSON values over bounded FIFO channels; every value is checked
//! against the port schema on both ends. The whole graph can be paused at a
//! consistent cut and checkpointed to disk, and sinks with external side
//! effects guard them with an idempotency store so a restore never repeats
//! them.
//!
//! ## Key Features
//!
//! - **Closed primitives**: port-count invariants are enforced at
//!   construction
//! - **Backpressure**: internal ports block, ingress ports block with a
//!   timeout and then drop
//! - **Error envelopes**: per-item failures are routed to `err_` ports
//! - **Checkpoints**: component states, port offsets and in-flight items,
//!   published atomically
//! - **Idempotency**: SQLite-backed action ledger for replay-safe side effects
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use portweave::config::RuntimeConfig;
//! use portweave::harness::{Harness, Topology};
//! use portweave::recipe::RecipeLibrary;
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let topology = Topology::new("demo")
//!   .component("numbers", "range_source", json!({"end": 10}))
//!   .component("count", "counting_sink", json!({}))
//!   .bind(("numbers", "out_items"), ("count", "in_items"));
//! let harness = Harness::new(RuntimeConfig::default(), RecipeLibrary::with_builtins());
//! let running = harness.wire(&topology)?.start();
//! let epoch = running.checkpoint_now().await?;
//! let report = running.wait().await;
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Checkpoints, the pause barrier and the idempotency store.
pub mod checkpoint;
/// The five primitives and the component run loops.
pub mod component;
/// Runtime configuration.
pub mod config;
/// Error envelopes emitted on `err_` ports.
pub mod envelope;
/// Error types.
pub mod error;
/// Wiring, running and restoring component graphs.
pub mod harness;
/// Structured logging setup.
pub mod logging;
/// Port and component metrics.
pub mod metrics;
/// Typed ports and channels.
pub mod port;
/// Recipes and their expansion into components.
pub mod recipe;
