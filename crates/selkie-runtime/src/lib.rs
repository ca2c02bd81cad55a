//! Selkie Runtime
//!
//! The single-process, in-memory implementation of the Selkie runtime
//! contracts: one scheduler task over a bounded intake queue, per-agent
//! activations with FIFO mailboxes, intervention middleware applied before
//! routing, and an explicit run/idle/stop lifecycle.
//!
//! The scheduler is cooperative: handler bodies may suspend (nested sends
//! re-enter the intake queue), unrelated agents run concurrently, and each
//! instance processes its own mailbox strictly in order.

mod activation;
mod intake;
mod runtime;

pub use runtime::{LocalRuntime, LocalRuntimeBuilder, RuntimeConfig};
