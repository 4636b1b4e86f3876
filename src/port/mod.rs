//! # Ports
//!
//! Typed, named channel endpoints. A component declares [`PortSpec`]s; the
//! component turns them into [`InputPort`]s and [`OutputPort`]s, and the
//! harness binds each pair to one bounded channel for the lifetime of the
//! run.
//!
//! - Names carry the direction: `in_*` inputs, `out_*` data outputs, `err_*`
//!   error outputs.
//! - Every value is checked against the port's [`PortSchema`] on send and on
//!   receive. Nothing is coerced.
//! - A full buffer applies the port's [`OverflowPolicy`]: internal ports
//!   block indefinitely, ingress ports block for a bounded time and then drop
//!   the value with [`PortError::BackpressureTimeout`](crate::error::PortError::BackpressureTimeout).
//! - Each channel has one producer and one consumer and delivers FIFO.

pub(crate) mod channel;
mod endpoint;
mod schema;
mod spec;


pub(crate) use channel::Channel;
pub(crate) use endpoint::link;
pub use endpoint::{
  Delivery, IngressSender, InputPort, OutputPort, Received, connect, ingress,
};
pub use schema::PortSchema;
pub use spec::{DEFAULT_BUFFER_SIZE, DEFAULT_INGRESS_TIMEOUT, OverflowPolicy, PortKind, PortSpec};
