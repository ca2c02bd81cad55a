//! The runtime contract
//!
//! Implemented by the in-process runtime and by the distributed worker;
//! agents and orchestration code hold an `Arc<dyn AgentRuntime>` and never
//! touch runtime state directly.

use crate::agent::{AgentFactory, AgentId};
use crate::cancellation::CancellationToken;
use crate::error::Result;
use crate::message::Message;
use crate::subscription::{Subscription, TopicId};
use async_trait::async_trait;

/// Runtime lifecycle state
///
/// `Running` and `Idle` are one internal mode: idleness is a liveness
/// observation (empty intake, no in-flight deliveries), not a distinct
/// state. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeState {
    /// Built but not started
    #[default]
    Created,
    /// Accepting and dispatching messages
    Running,
    /// Drained and closed (terminal)
    Stopped,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeState::Created => write!(f, "created"),
            RuntimeState::Running => write!(f, "running"),
            RuntimeState::Stopped => write!(f, "stopped"),
        }
    }
}

/// The agent runtime capability
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Register an agent type
    ///
    /// The factory is invoked lazily, at most once per `AgentId`. The
    /// subscriptions are added to the routing table (idempotent per
    /// subscription id). Fails with `DuplicateRegistration` if the type is
    /// already registered on this runtime instance.
    async fn register(
        &self,
        agent_type: &str,
        factory: Box<dyn AgentFactory>,
        subscriptions: Vec<Box<dyn Subscription>>,
    ) -> Result<()>;

    /// Point-to-point call
    ///
    /// Suspends the caller until the recipient returns a reply, raises, or
    /// the call is cancelled. Concurrent sends are permitted and tracked
    /// independently.
    async fn send(
        &self,
        message: Message,
        recipient: AgentId,
        sender: Option<AgentId>,
        cancellation: Option<CancellationToken>,
    ) -> Result<Option<Message>>;

    /// Fire-and-forget broadcast
    ///
    /// Resolves to zero or more deliveries computed by the routing table;
    /// handler return values are discarded, and per-recipient failures are
    /// not surfaced to the publisher.
    async fn publish(
        &self,
        message: Message,
        topic: TopicId,
        sender: Option<AgentId>,
        cancellation: Option<CancellationToken>,
    ) -> Result<()>;

    /// Resolve an id, instantiating the agent on first use
    ///
    /// Idempotent: subsequent calls with the same pair address the same
    /// instance for the lifetime of the runtime.
    async fn resolve_or_create(&self, agent_type: &str, key: &str) -> Result<AgentId>;
}
