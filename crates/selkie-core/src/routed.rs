//! Routed agents
//!
//! A `RoutedAgent` dispatches on the message's logical type name through a
//! table built at registration time: one typed handler per message type,
//! plus an explicit catch-all for everything else. A dispatch miss with no
//! catch-all fails the delivery with `UnhandledMessage`.

use crate::agent::{Agent, AgentId, AgentMetadata};
use crate::error::{Error, Result};
use crate::message::{Message, MessageBody, MessageContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by message handlers
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<Message>>> + Send>>;

type ErasedHandler =
    Box<dyn Fn(&AgentMetadata, Message, MessageContext) -> HandlerFuture + Send + Sync>;

/// Dispatch-table agent
///
/// Handlers capture whatever per-instance state they need (the factory
/// creates one table per instance, so captured state is instance-local).
pub struct RoutedAgent {
    metadata: AgentMetadata,
    handlers: HashMap<String, ErasedHandler>,
    catch_all: Option<ErasedHandler>,
}

impl RoutedAgent {
    /// Start building a routed agent
    pub fn builder(description: impl Into<String>) -> RoutedAgentBuilder {
        RoutedAgentBuilder {
            description: description.into(),
            handlers: HashMap::new(),
            catch_all: None,
        }
    }
}

#[async_trait]
impl Agent for RoutedAgent {
    fn metadata(&self) -> &AgentMetadata {
        &self.metadata
    }

    async fn on_message(
        &mut self,
        message: Message,
        context: &MessageContext,
    ) -> Result<Option<Message>> {
        if let Some(handler) = self.handlers.get(message.type_name()) {
            return handler(&self.metadata, message, context.clone()).await;
        }
        if let Some(catch_all) = &self.catch_all {
            return catch_all(&self.metadata, message, context.clone()).await;
        }
        Err(Error::unhandled_message(
            self.metadata.id().to_string(),
            message.type_name(),
        ))
    }
}

/// Builder for [`RoutedAgent`]
pub struct RoutedAgentBuilder {
    description: String,
    handlers: HashMap<String, ErasedHandler>,
    catch_all: Option<ErasedHandler>,
}

impl RoutedAgentBuilder {
    /// Register the handler for one message type
    ///
    /// The handler receives the shared body and the delivery context. A
    /// body that does not downcast to `T` (a type-name collision between
    /// two registrations) fails the delivery with `HandlerNotFound`.
    pub fn on<T, F, Fut>(mut self, handler: F) -> Self
    where
        T: MessageBody,
        F: Fn(Arc<T>, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
    {
        let erased: ErasedHandler = Box::new(move |metadata, message, context| {
            match message.downcast_arc::<T>() {
                Some(body) => Box::pin(handler(body, context)),
                None => {
                    let err = Error::handler_not_found(
                        format!("{}/{}", metadata.agent_type, metadata.key),
                        message.type_name(),
                    );
                    Box::pin(async move { Err(err) })
                }
            }
        });
        self.handlers.insert(T::type_name().to_string(), erased);
        self
    }

    /// Override the catch-all invoked on a dispatch miss
    pub fn catch_all<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Message, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
    {
        self.catch_all = Some(Box::new(move |_metadata, message, context| {
            Box::pin(handler(message, context))
        }));
        self
    }

    /// Finish building the agent for the given id
    pub fn build(self, id: &AgentId) -> RoutedAgent {
        RoutedAgent {
            metadata: AgentMetadata::new(id, self.description),
            handlers: self.handlers,
            catch_all: self.catch_all,
        }
    }
}
