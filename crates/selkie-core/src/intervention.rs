//! Intervention middleware chain
//!
//! An ordered list of handlers invoked on every send, publish, and
//! response. Each stage receives the possibly-already-transformed output
//! of the previous stage (strict left-to-right composition) and may pass
//! the message through, rewrite it, or drop it. Drop halts the chain
//! immediately.

use crate::agent::AgentId;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;

/// Outcome of one intervention stage
///
/// `Drop` is a distinguished sentinel, not a message value: a stage that
/// returns it vetoes the delivery outright.
#[derive(Debug)]
pub enum Intervention {
    /// Continue the chain with this (possibly rewritten) message
    Continue(Message),
    /// Veto the delivery
    Drop,
}

/// Middleware invoked on every message before dispatch/return
///
/// All three hooks default to pass-through; implementations override the
/// ones they care about.
#[async_trait]
pub trait InterventionHandler: Send + Sync + 'static {
    /// Name used in logs and in `MessageDropped` errors
    fn name(&self) -> &str;

    /// Invoked before a point-to-point send is routed
    async fn on_send(
        &self,
        message: Message,
        _sender: Option<&AgentId>,
        _recipient: &AgentId,
    ) -> Intervention {
        Intervention::Continue(message)
    }

    /// Invoked before a publish is fanned out
    async fn on_publish(&self, message: Message, _sender: Option<&AgentId>) -> Intervention {
        Intervention::Continue(message)
    }

    /// Invoked on a reply before it resolves the caller's send
    ///
    /// `sender` is the agent that produced the reply; `recipient` is the
    /// original caller (absent for calls issued outside any agent).
    async fn on_response(
        &self,
        message: Message,
        _sender: &AgentId,
        _recipient: Option<&AgentId>,
    ) -> Intervention {
        Intervention::Continue(message)
    }
}

/// Built-in pass-through handler
///
/// Installed when no handlers are configured, so the chain is never empty.
pub struct NoopInterventionHandler;

#[async_trait]
impl InterventionHandler for NoopInterventionHandler {
    fn name(&self) -> &str {
        "noop"
    }
}

/// The ordered middleware chain
///
/// Applied before routing on sends and publishes, and before a reply is
/// returned to the original caller.
#[derive(Clone)]
pub struct InterventionChain {
    handlers: Arc<Vec<Arc<dyn InterventionHandler>>>,
}

/// Result of running a chain: the surviving message, or the name of the
/// stage that dropped it.
pub type ChainOutcome = std::result::Result<Message, String>;

impl InterventionChain {
    /// Build a chain, installing the no-op handler when none are given
    pub fn new(handlers: Vec<Arc<dyn InterventionHandler>>) -> Self {
        let handlers = if handlers.is_empty() {
            vec![Arc::new(NoopInterventionHandler) as Arc<dyn InterventionHandler>]
        } else {
            handlers
        };
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// The chain is never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Run the `on_send` hooks left to right
    pub async fn apply_send(
        &self,
        mut message: Message,
        sender: Option<&AgentId>,
        recipient: &AgentId,
    ) -> ChainOutcome {
        for handler in self.handlers.iter() {
            match handler.on_send(message, sender, recipient).await {
                Intervention::Continue(next) => message = next,
                Intervention::Drop => return Err(handler.name().to_string()),
            }
        }
        Ok(message)
    }

    /// Run the `on_publish` hooks left to right
    pub async fn apply_publish(
        &self,
        mut message: Message,
        sender: Option<&AgentId>,
    ) -> ChainOutcome {
        for handler in self.handlers.iter() {
            match handler.on_publish(message, sender).await {
                Intervention::Continue(next) => message = next,
                Intervention::Drop => return Err(handler.name().to_string()),
            }
        }
        Ok(message)
    }

    /// Run the `on_response` hooks left to right
    pub async fn apply_response(
        &self,
        mut message: Message,
        sender: &AgentId,
        recipient: Option<&AgentId>,
    ) -> ChainOutcome {
        for handler in self.handlers.iter() {
            match handler.on_response(message, sender, recipient).await {
                Intervention::Continue(next) => message = next,
                Intervention::Drop => return Err(handler.name().to_string()),
            }
        }
        Ok(message)
    }
}

impl Default for InterventionChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBody;

    struct Note(String);

    impl MessageBody for Note {
        fn type_name() -> &'static str {
            "Note"
        }
    }

    /// Rewrites every Note by appending a suffix
    struct Suffixer(&'static str);

    #[async_trait]
    impl InterventionHandler for Suffixer {
        fn name(&self) -> &str {
            self.0
        }

        async fn on_send(
            &self,
            message: Message,
            _sender: Option<&AgentId>,
            _recipient: &AgentId,
        ) -> Intervention {
            let text = message.downcast_ref::<Note>().unwrap().0.clone();
            Intervention::Continue(Message::new(Note(format!("{}+{}", text, self.0))))
        }
    }

    /// Drops everything on send
    struct DropAll;

    #[async_trait]
    impl InterventionHandler for DropAll {
        fn name(&self) -> &str {
            "drop-all"
        }

        async fn on_send(
            &self,
            _message: Message,
            _sender: Option<&AgentId>,
            _recipient: &AgentId,
        ) -> Intervention {
            Intervention::Drop
        }
    }

    fn recipient() -> AgentId {
        AgentId::new("echo", "k1").unwrap()
    }

    #[tokio::test]
    async fn test_empty_chain_gets_noop() {
        let chain = InterventionChain::default();
        assert_eq!(chain.len(), 1);

        let msg = Message::new(Note("hi".into()));
        let out = chain.apply_send(msg, None, &recipient()).await.unwrap();
        assert_eq!(out.downcast_ref::<Note>().unwrap().0, "hi");
    }

    #[tokio::test]
    async fn test_chain_composes_left_to_right() {
        let chain = InterventionChain::new(vec![Arc::new(Suffixer("a")), Arc::new(Suffixer("b"))]);
        let msg = Message::new(Note("x".into()));
        let out = chain.apply_send(msg, None, &recipient()).await.unwrap();
        assert_eq!(out.downcast_ref::<Note>().unwrap().0, "x+a+b");
    }

    #[tokio::test]
    async fn test_drop_halts_chain() {
        let chain = InterventionChain::new(vec![Arc::new(DropAll), Arc::new(Suffixer("never"))]);
        let msg = Message::new(Note("x".into()));
        let outcome = chain.apply_send(msg, None, &recipient()).await;
        assert_eq!(outcome.unwrap_err(), "drop-all");
    }

    #[tokio::test]
    async fn test_drop_on_send_does_not_affect_publish() {
        let chain = InterventionChain::new(vec![Arc::new(DropAll)]);
        let msg = Message::new(Note("x".into()));
        // DropAll only overrides on_send; publish passes through.
        let out = chain.apply_publish(msg, None).await.unwrap();
        assert_eq!(out.downcast_ref::<Note>().unwrap().0, "x");
    }
}
