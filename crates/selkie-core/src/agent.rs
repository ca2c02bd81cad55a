//! Agent identity and the agent capability
//!
//! Explicit types, validated construction, immutable identity.

use crate::constants::*;
use crate::error::{Error, Result};
use crate::message::{Message, MessageContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// AgentId
// =============================================================================

/// Logical address of an agent instance
///
/// An `AgentId` consists of an agent type and a key. The type identifies a
/// registered agent kind; the key identifies a specific instance of that
/// kind (a tenant, a session, a shard). Two ids with the same type and key
/// address the same instance for the lifetime of the runtime that owns it.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct AgentId {
    agent_type: String,
    key: String,
}

fn valid_chars(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

impl AgentId {
    /// Create a new AgentId with validation
    ///
    /// # Errors
    /// Returns error if type or key is empty, exceeds length limits, or
    /// contains invalid characters.
    pub fn new(agent_type: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let agent_type = agent_type.into();
        let key = key.into();

        if agent_type.is_empty() {
            return Err(Error::invalid_identifier(agent_type, "agent type is empty"));
        }
        if key.is_empty() {
            return Err(Error::invalid_identifier(key, "agent key is empty"));
        }

        if agent_type.len() > AGENT_TYPE_LENGTH_BYTES_MAX {
            return Err(Error::invalid_identifier(
                &agent_type,
                format!(
                    "agent type length {} exceeds limit {}",
                    agent_type.len(),
                    AGENT_TYPE_LENGTH_BYTES_MAX
                ),
            ));
        }
        if key.len() > AGENT_KEY_LENGTH_BYTES_MAX {
            return Err(Error::invalid_identifier(
                &key,
                format!(
                    "agent key length {} exceeds limit {}",
                    key.len(),
                    AGENT_KEY_LENGTH_BYTES_MAX
                ),
            ));
        }

        if !valid_chars(&agent_type) {
            return Err(Error::invalid_identifier(
                &agent_type,
                "agent type contains invalid characters",
            ));
        }
        if !valid_chars(&key) {
            return Err(Error::invalid_identifier(
                &key,
                "agent key contains invalid characters",
            ));
        }

        Ok(Self { agent_type, key })
    }

    /// Create an AgentId without validation (for internal use only)
    ///
    /// # Safety
    /// Caller must ensure type and key are valid.
    #[doc(hidden)]
    pub fn new_unchecked(agent_type: String, key: String) -> Self {
        debug_assert!(agent_type.len() <= AGENT_TYPE_LENGTH_BYTES_MAX);
        debug_assert!(key.len() <= AGENT_KEY_LENGTH_BYTES_MAX);
        Self { agent_type, key }
    }

    /// Get the agent type
    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    /// Get the instance key
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_type, self.key)
    }
}

// =============================================================================
// AgentMetadata
// =============================================================================

/// Read-only self-description of an agent instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// The registered agent type
    pub agent_type: String,
    /// The instance key
    pub key: String,
    /// Human-readable description of what this agent does
    pub description: String,
}

impl AgentMetadata {
    /// Create metadata for the given id
    pub fn new(id: &AgentId, description: impl Into<String>) -> Self {
        Self {
            agent_type: id.agent_type().to_string(),
            key: id.key().to_string(),
            description: description.into(),
        }
    }

    /// The id this metadata describes
    pub fn id(&self) -> AgentId {
        AgentId::new_unchecked(self.agent_type.clone(), self.key.clone())
    }
}

// =============================================================================
// Agent Trait
// =============================================================================

/// Agent capability - implement to create agents
///
/// An agent instance is created by its registered factory the first time a
/// message targets its `AgentId`, is owned exclusively by the runtime that
/// created it, and processes its mailbox one message at a time (no
/// concurrent invocations of `on_message` on one instance).
#[async_trait]
pub trait Agent: Send + 'static {
    /// This agent's self-description
    fn metadata(&self) -> &AgentMetadata;

    /// Handle one message
    ///
    /// Called for each message delivered to this instance, in mailbox
    /// order. For a point-to-point send the return value is the reply
    /// delivered to the caller; for a broadcast delivery any return value
    /// is discarded.
    async fn on_message(
        &mut self,
        message: Message,
        context: &MessageContext,
    ) -> Result<Option<Message>>;
}

// =============================================================================
// AgentFactory
// =============================================================================

/// Factory for creating agent instances
///
/// Registered once per agent type; invoked by the runtime at most once per
/// `AgentId` (the at-most-one-factory-per-identity guarantee).
pub trait AgentFactory: Send + Sync + 'static {
    /// Create the instance for the given id
    fn create(&self, id: &AgentId) -> Result<Box<dyn Agent>>;
}

impl<F> AgentFactory for F
where
    F: Fn(&AgentId) -> Result<Box<dyn Agent>> + Send + Sync + 'static,
{
    fn create(&self, id: &AgentId) -> Result<Box<dyn Agent>> {
        (self)(id)
    }
}
