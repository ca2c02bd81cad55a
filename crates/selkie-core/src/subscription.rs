//! Topics and the subscription/routing table
//!
//! A subscription is a predicate plus a mapping: given a `TopicId` it either
//! declines or names the `AgentId` that should receive the broadcast. The
//! table is owned by one runtime and mutated only through it.

use crate::agent::AgentId;
use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// TopicId
// =============================================================================

/// Logical broadcast channel
///
/// The source commonly mirrors a conversation or session id, letting one
/// conversation fan out to one agent instance per participating type.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TopicId {
    topic_type: String,
    source: String,
}

/// Topic type of the default broadcast channel
pub const DEFAULT_TOPIC_TYPE: &str = "default";

impl TopicId {
    /// Create a new TopicId with validation
    ///
    /// # Errors
    /// Returns error if type or source is empty, exceeds length limits, or
    /// contains invalid characters.
    pub fn new(topic_type: impl Into<String>, source: impl Into<String>) -> Result<Self> {
        let topic_type = topic_type.into();
        let source = source.into();

        if topic_type.is_empty() {
            return Err(Error::invalid_identifier(topic_type, "topic type is empty"));
        }
        if source.is_empty() {
            return Err(Error::invalid_identifier(source, "topic source is empty"));
        }
        if topic_type.len() > TOPIC_TYPE_LENGTH_BYTES_MAX {
            return Err(Error::invalid_identifier(
                &topic_type,
                format!(
                    "topic type length {} exceeds limit {}",
                    topic_type.len(),
                    TOPIC_TYPE_LENGTH_BYTES_MAX
                ),
            ));
        }
        if source.len() > TOPIC_SOURCE_LENGTH_BYTES_MAX {
            return Err(Error::invalid_identifier(
                &source,
                format!(
                    "topic source length {} exceeds limit {}",
                    source.len(),
                    TOPIC_SOURCE_LENGTH_BYTES_MAX
                ),
            ));
        }

        let valid = |s: &str| {
            s.chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        };
        if !valid(&topic_type) {
            return Err(Error::invalid_identifier(
                &topic_type,
                "topic type contains invalid characters",
            ));
        }
        if !valid(&source) {
            return Err(Error::invalid_identifier(
                &source,
                "topic source contains invalid characters",
            ));
        }

        Ok(Self { topic_type, source })
    }

    /// The default broadcast channel scoped to `source`
    pub fn default_for(source: impl Into<String>) -> Result<Self> {
        Self::new(DEFAULT_TOPIC_TYPE, source)
    }

    /// Get the topic type
    pub fn topic_type(&self) -> &str {
        &self.topic_type
    }

    /// Get the source
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic_type, self.source)
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Serializable descriptor of a subscription
///
/// This is what a worker advertises to the routing host: enough for the
/// host to decide which workers a publish fans out to (topic-type match)
/// without evaluating predicates remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    /// Identity of the subscription, for idempotent registration
    pub id: String,
    /// Topic type this subscription matches
    pub topic_type: String,
    /// Agent type broadcasts are routed to
    pub agent_type: String,
}

/// Rule mapping a `TopicId` to the `AgentId` that should receive it
pub trait Subscription: Send + Sync + 'static {
    /// Identity of this subscription
    ///
    /// Registration is additive and idempotent per (runtime, id).
    fn id(&self) -> &str;

    /// Whether this subscription matches the topic
    fn is_match(&self, topic: &TopicId) -> bool;

    /// Map a matching topic to its recipient
    ///
    /// # Errors
    /// Returns an internal error if called with a non-matching topic.
    fn map(&self, topic: &TopicId) -> Result<AgentId>;

    /// The wire descriptor advertised to a routing host
    fn spec(&self) -> SubscriptionSpec;

    /// Box this subscription for registration
    fn boxed(self) -> Box<dyn Subscription>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

// =============================================================================
// TypeSubscription
// =============================================================================

/// Matches every topic of one type, routing to one agent type
///
/// The topic source becomes the agent key, so one conversation (`source`)
/// fans out to one instance per participating agent type.
#[derive(Debug, Clone)]
pub struct TypeSubscription {
    id: String,
    topic_type: String,
    agent_type: String,
}

impl TypeSubscription {
    /// Create a subscription from `topic_type` broadcasts to `agent_type`
    pub fn new(topic_type: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let topic_type = topic_type.into();
        let agent_type = agent_type.into();
        debug_assert!(!topic_type.is_empty(), "topic type must not be empty");
        debug_assert!(!agent_type.is_empty(), "agent type must not be empty");

        let id = format!("type:{}->{}", topic_type, agent_type);
        Self {
            id,
            topic_type,
            agent_type,
        }
    }

    /// Get the topic type this subscription matches
    pub fn topic_type(&self) -> &str {
        &self.topic_type
    }

    /// Get the agent type this subscription routes to
    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }
}

impl Subscription for TypeSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_match(&self, topic: &TopicId) -> bool {
        topic.topic_type() == self.topic_type
    }

    fn map(&self, topic: &TopicId) -> Result<AgentId> {
        if !self.is_match(topic) {
            return Err(Error::internal(format!(
                "subscription {} asked to map non-matching topic {}",
                self.id, topic
            )));
        }
        AgentId::new(self.agent_type.clone(), topic.source())
    }

    fn spec(&self) -> SubscriptionSpec {
        SubscriptionSpec {
            id: self.id.clone(),
            topic_type: self.topic_type.clone(),
            agent_type: self.agent_type.clone(),
        }
    }
}

/// Subscription to the default broadcast channel
///
/// Shorthand for `TypeSubscription("default", agent_type)`.
pub fn default_subscription(agent_type: impl Into<String>) -> TypeSubscription {
    TypeSubscription::new(DEFAULT_TOPIC_TYPE, agent_type)
}

// =============================================================================
// SubscriptionTable
// =============================================================================

/// The routing table consulted on every publish
///
/// Owned and mutated exclusively by the runtime that created it.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: Vec<Box<dyn Subscription>>,
}

impl SubscriptionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription
    ///
    /// Idempotent per subscription id: re-registering an id already in the
    /// table is a no-op.
    pub fn insert(&mut self, subscription: Box<dyn Subscription>) {
        if self.entries.iter().any(|s| s.id() == subscription.id()) {
            return;
        }
        self.entries.push(subscription);
    }

    /// Number of registered subscriptions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compute the deduplicated recipients for a topic
    pub fn recipients(&self, topic: &TopicId) -> Vec<AgentId> {
        let mut out: Vec<AgentId> = Vec::new();
        for sub in &self.entries {
            if !sub.is_match(topic) {
                continue;
            }
            match sub.map(topic) {
                Ok(id) => {
                    if !out.contains(&id) {
                        out.push(id);
                    }
                }
                Err(err) => {
                    tracing::warn!(subscription = sub.id(), %topic, error = %err, "subscription failed to map topic");
                }
            }
        }
        out
    }

    /// Wire descriptors for every registered subscription
    pub fn specs(&self) -> Vec<SubscriptionSpec> {
        self.entries.iter().map(|s| s.spec()).collect()
    }
}
