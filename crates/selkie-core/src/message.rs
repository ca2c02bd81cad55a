//! Message payloads and delivery context
//!
//! The runtime is content-agnostic: a `Message` is an opaque typed body
//! plus the logical type name used for routing, dispatch, and (at process
//! boundaries only) codec lookup. In-process delivery never serializes.

use crate::agent::AgentId;
use crate::cancellation::CancellationToken;
use crate::subscription::TopicId;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// MessageBody
// =============================================================================

/// A value that can travel through the runtime as a message
///
/// The type name is the message's stable logical identity: handler dispatch
/// keys on it, intervention handlers inspect it, and the serialization
/// registry maps it to a codec. It must be stable across processes.
pub trait MessageBody: Send + Sync + 'static {
    /// Stable logical type name for this message type
    fn type_name() -> &'static str
    where
        Self: Sized;
}

// =============================================================================
// Message
// =============================================================================

/// An opaque typed payload
///
/// The body is shared, not cloned: fan-out to many recipients and
/// pass-through intervention stages hand around the same allocation.
/// Handlers read it via [`Message::downcast_ref`].
#[derive(Clone)]
pub struct Message {
    type_name: Arc<str>,
    body: Arc<dyn Any + Send + Sync>,
}

impl Message {
    /// Wrap a typed body
    pub fn new<T: MessageBody>(body: T) -> Self {
        Self {
            type_name: Arc::from(T::type_name()),
            body: Arc::new(body),
        }
    }

    /// The logical type name
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Borrow the body as a concrete type
    pub fn downcast_ref<T: MessageBody>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }

    /// Share the body as a concrete type
    ///
    /// Used by typed handlers that need to move the body into a future.
    pub fn downcast_arc<T: MessageBody>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.body).downcast::<T>().ok()
    }

    /// Check whether the body is of a concrete type
    pub fn is<T: MessageBody>(&self) -> bool {
        self.body.is::<T>()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// MessageContext
// =============================================================================

/// Delivery context accompanying every dispatched message
///
/// Exactly one of `sender`-is-direct-call or `topic`-is-broadcast is
/// meaningful per delivery; [`MessageContext::is_rpc`] tells them apart.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// The sending agent, if the message originated inside an agent
    pub sender: Option<AgentId>,
    /// The topic this delivery came from, for broadcast deliveries
    pub topic: Option<TopicId>,
    /// Cooperative cancellation for this delivery
    pub cancellation: CancellationToken,
    /// Unique id of this message dispatch
    pub message_id: String,
    /// Opaque trace context, propagated verbatim (including over the wire)
    pub trace: Option<String>,
}

impl MessageContext {
    /// Context for a point-to-point send
    pub fn direct(sender: Option<AgentId>, cancellation: CancellationToken) -> Self {
        Self {
            sender,
            topic: None,
            cancellation,
            message_id: uuid::Uuid::new_v4().to_string(),
            trace: None,
        }
    }

    /// Context for a broadcast delivery
    pub fn broadcast(
        topic: TopicId,
        sender: Option<AgentId>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            sender,
            topic: Some(topic),
            cancellation,
            message_id: uuid::Uuid::new_v4().to_string(),
            trace: None,
        }
    }

    /// Attach an opaque trace context
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Whether this delivery expects a reply
    pub fn is_rpc(&self) -> bool {
        self.topic.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping {
        text: String,
    }

    impl MessageBody for Ping {
        fn type_name() -> &'static str {
            "Ping"
        }
    }

    struct Pong;

    impl MessageBody for Pong {
        fn type_name() -> &'static str {
            "Pong"
        }
    }

    #[test]
    fn test_message_type_name() {
        let msg = Message::new(Ping {
            text: "hi".to_string(),
        });
        assert_eq!(msg.type_name(), "Ping");
    }

    #[test]
    fn test_message_downcast() {
        let msg = Message::new(Ping {
            text: "hi".to_string(),
        });
        assert!(msg.is::<Ping>());
        assert!(!msg.is::<Pong>());
        assert_eq!(msg.downcast_ref::<Ping>().unwrap().text, "hi");
        assert!(msg.downcast_ref::<Pong>().is_none());
    }

    #[test]
    fn test_message_clone_shares_body() {
        let msg = Message::new(Ping {
            text: "hi".to_string(),
        });
        let copy = msg.clone();
        let a: *const Ping = msg.downcast_ref::<Ping>().unwrap();
        let b: *const Ping = copy.downcast_ref::<Ping>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_context_direct_vs_broadcast() {
        let sender = AgentId::new("echo", "k1").unwrap();
        let ctx = MessageContext::direct(Some(sender.clone()), CancellationToken::new());
        assert!(ctx.is_rpc());
        assert!(ctx.topic.is_none());

        let topic = TopicId::new("default", "s1").unwrap();
        let ctx = MessageContext::broadcast(topic, Some(sender), CancellationToken::new());
        assert!(!ctx.is_rpc());
        assert!(ctx.topic.is_some());
    }

    #[test]
    fn test_context_message_ids_unique() {
        let a = MessageContext::direct(None, CancellationToken::new());
        let b = MessageContext::direct(None, CancellationToken::new());
        assert_ne!(a.message_id, b.message_id);
    }
}
