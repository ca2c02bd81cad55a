//! Selkie Cluster
//!
//! The distributed form of the Selkie runtime: a routing host holding the
//! authoritative agent-type directory, and worker processes that register
//! local agent types, lazily instantiate instances on first addressed
//! message, and reach every other agent through the host. The worker
//! implements the same `AgentRuntime` contract as the in-process runtime;
//! only the process boundary serializes.

pub mod config;
pub mod host;
pub mod protocol;
pub mod worker;

pub use config::{HostConfig, WorkerConfig};
pub use host::{Host, HostHandle};
pub use protocol::{Frame, RequestId, WireError, WireErrorKind, WorkerId};
pub use worker::WorkerRuntime;
