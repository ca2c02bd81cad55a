//! Error types for Selkie
//!
//! Explicit error types with context, using thiserror. Every failure is
//! returned on the specific call's result; none of these poison the
//! runtime or other pending calls.

use thiserror::Error;

/// Result type alias for Selkie operations
pub type Result<T> = std::result::Result<T, Error>;

/// Selkie error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Registration Errors
    // =========================================================================
    #[error("agent type already registered: {agent_type}")]
    DuplicateRegistration { agent_type: String },

    #[error("no agent type registered for recipient: {agent_type}")]
    UnknownRecipient { agent_type: String },

    // =========================================================================
    // Dispatch Errors
    // =========================================================================
    #[error("agent {agent} has no handler for message type: {type_name}")]
    HandlerNotFound { agent: String, type_name: String },

    #[error("agent {agent} cannot handle message type: {type_name}")]
    UnhandledMessage { agent: String, type_name: String },

    #[error("message dropped by intervention handler: {stage}")]
    MessageDropped { stage: String },

    #[error("call cancelled")]
    Cancelled,

    #[error("agent mailbox full: {agent}, depth: {depth}, limit: {limit}")]
    MailboxFull {
        agent: String,
        depth: usize,
        limit: usize,
    },

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    #[error("no codec registered for message type: {type_name}")]
    UnserializableType { type_name: String },

    #[error("failed to encode message type {type_name}: {reason}")]
    EncodeFailed { type_name: String, reason: String },

    #[error("failed to decode message type {type_name}: {reason}")]
    DecodeFailed { type_name: String, reason: String },

    // =========================================================================
    // Distributed Errors
    // =========================================================================
    #[error("peer unavailable: {peer}, reason: {reason}")]
    PeerUnavailable { peer: String, reason: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("invalid identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("runtime is not running")]
    RuntimeStopped,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    /// Create an unknown recipient error
    pub fn unknown_recipient(agent_type: impl Into<String>) -> Self {
        Self::UnknownRecipient {
            agent_type: agent_type.into(),
        }
    }

    /// Create a handler not found error
    pub fn handler_not_found(agent: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::HandlerNotFound {
            agent: agent.into(),
            type_name: type_name.into(),
        }
    }

    /// Create an unhandled message error
    pub fn unhandled_message(agent: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::UnhandledMessage {
            agent: agent.into(),
            type_name: type_name.into(),
        }
    }

    /// Create a message dropped error
    pub fn message_dropped(stage: impl Into<String>) -> Self {
        Self::MessageDropped {
            stage: stage.into(),
        }
    }

    /// Create an unserializable type error
    pub fn unserializable(type_name: impl Into<String>) -> Self {
        Self::UnserializableType {
            type_name: type_name.into(),
        }
    }

    /// Create a peer unavailable error
    pub fn peer_unavailable(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PeerUnavailable {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid identifier error
    pub fn invalid_identifier(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Check if this error is retriable
    ///
    /// Retriable errors reflect transient conditions (a lost peer, a full
    /// mailbox); the rest are contract violations that retrying cannot fix.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::PeerUnavailable { .. } | Self::MailboxFull { .. }
        )
    }
}
