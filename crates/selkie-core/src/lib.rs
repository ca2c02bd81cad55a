//! Selkie Core
//!
//! Core types and contracts for the Selkie agent messaging runtime: agent
//! identity, message envelopes, cooperative cancellation, the serialization
//! registry, the subscription/routing table, the intervention chain, and
//! the `Agent`/`AgentRuntime` capabilities implemented by the in-process
//! runtime and the distributed worker.
//!
//! The runtime is content-agnostic: it moves opaque typed payloads and
//! interprets nothing beyond routing metadata (sender, topic, logical
//! message type name).

pub mod agent;
pub mod cancellation;
pub mod constants;
pub mod error;
pub mod intervention;
pub mod message;
pub mod routed;
pub mod runtime;
pub mod serialization;
pub mod subscription;

pub use agent::{Agent, AgentFactory, AgentId, AgentMetadata};
pub use cancellation::CancellationToken;
pub use constants::*;
pub use error::{Error, Result};
pub use intervention::{
    Intervention, InterventionChain, InterventionHandler, NoopInterventionHandler,
};
pub use message::{Message, MessageBody, MessageContext};
pub use routed::{RoutedAgent, RoutedAgentBuilder};
pub use runtime::{AgentRuntime, RuntimeState};
pub use serialization::{SerializationRegistry, SerializedMessage};
pub use subscription::{
    default_subscription, Subscription, SubscriptionSpec, SubscriptionTable, TopicId,
    TypeSubscription, DEFAULT_TOPIC_TYPE,
};
