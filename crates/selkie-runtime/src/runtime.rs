//! The single-process runtime
//!
//! One scheduler task owns the registration table, the subscription table,
//! and the activation map; every mutation arrives as a `Command` on the
//! bounded intake channel, so no locks guard scheduler state. Handler
//! bodies run on per-instance tasks and may themselves suspend (nested
//! sends re-enter the intake queue), giving cooperative interleaving
//! without data races between agents.

use crate::activation::{Activation, Delivery, DeliveryKind};
use crate::intake::{Command, IdleTracker};
use async_trait::async_trait;
use selkie_core::constants::{AGENT_TYPES_COUNT_MAX, INTAKE_DEPTH_MAX, MAILBOX_DEPTH_MAX};
use selkie_core::{
    AgentFactory, AgentId, AgentRuntime, CancellationToken, Error, InterventionChain,
    InterventionHandler, Message, MessageContext, Result, RuntimeState, SerializationRegistry,
    Subscription, SubscriptionTable, TopicId,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the local runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Depth of the intake queue; hand-off applies backpressure when full
    pub intake_depth: usize,
    /// Depth of each per-agent mailbox
    pub mailbox_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            intake_depth: INTAKE_DEPTH_MAX,
            mailbox_depth: MAILBOX_DEPTH_MAX,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`LocalRuntime`]
pub struct LocalRuntimeBuilder {
    config: RuntimeConfig,
    interventions: Vec<Arc<dyn InterventionHandler>>,
    serialization: SerializationRegistry,
}

impl LocalRuntimeBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            interventions: Vec::new(),
            serialization: SerializationRegistry::new(),
        }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Append an intervention handler to the chain
    pub fn with_intervention(mut self, handler: Arc<dyn InterventionHandler>) -> Self {
        self.interventions.push(handler);
        self
    }

    /// Use an existing serialization registry
    pub fn with_serialization(mut self, registry: SerializationRegistry) -> Self {
        self.serialization = registry;
        self
    }

    /// Build the runtime (state: Created; call `start` before use)
    pub fn build(self) -> LocalRuntime {
        debug_assert!(self.config.intake_depth > 0);
        debug_assert!(self.config.mailbox_depth > 0);

        LocalRuntime {
            shared: Arc::new(Shared {
                config: self.config,
                chain: InterventionChain::new(self.interventions),
                serialization: self.serialization,
                idle: IdleTracker::new(),
                cell: Mutex::new(StateCell {
                    state: RuntimeState::Created,
                    intake_tx: None,
                    scheduler: None,
                }),
            }),
        }
    }
}

impl Default for LocalRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// LocalRuntime
// =============================================================================

struct StateCell {
    state: RuntimeState,
    intake_tx: Option<mpsc::Sender<Command>>,
    scheduler: Option<JoinHandle<()>>,
}

struct Shared {
    config: RuntimeConfig,
    chain: InterventionChain,
    serialization: SerializationRegistry,
    idle: IdleTracker,
    cell: Mutex<StateCell>,
}

/// The in-memory agent runtime
///
/// Cloning produces another handle to the same runtime; agents hold one to
/// issue nested sends.
#[derive(Clone)]
pub struct LocalRuntime {
    shared: Arc<Shared>,
}

impl LocalRuntime {
    /// Builder entry point
    pub fn builder() -> LocalRuntimeBuilder {
        LocalRuntimeBuilder::new()
    }

    /// Build with defaults
    pub fn new() -> Self {
        LocalRuntimeBuilder::new().build()
    }

    /// Start the scheduler
    ///
    /// Transitions Created -> Running. Fails if already started or stopped.
    pub fn start(&self) -> Result<()> {
        let mut cell = self.shared.cell.lock().expect("state lock poisoned");
        match cell.state {
            RuntimeState::Created => {}
            RuntimeState::Running => {
                return Err(Error::internal("runtime already started"));
            }
            RuntimeState::Stopped => return Err(Error::RuntimeStopped),
        }

        let (intake_tx, intake_rx) = mpsc::channel(self.shared.config.intake_depth);
        let scheduler = Scheduler {
            intake_rx,
            chain: self.shared.chain.clone(),
            idle: self.shared.idle.clone(),
            mailbox_depth: self.shared.config.mailbox_depth,
            registrations: HashMap::new(),
            subscriptions: SubscriptionTable::new(),
            activations: HashMap::new(),
        };

        cell.intake_tx = Some(intake_tx);
        cell.scheduler = Some(tokio::spawn(scheduler.run()));
        cell.state = RuntimeState::Running;
        info!("runtime started");
        Ok(())
    }

    /// Stop the runtime
    ///
    /// Refuses new intake immediately, drains queued envelopes and
    /// in-flight deliveries, then joins the scheduler. Terminal; idempotent.
    pub async fn stop(&self) -> Result<()> {
        let (intake_tx, scheduler) = {
            let mut cell = self.shared.cell.lock().expect("state lock poisoned");
            let was_running = cell.state == RuntimeState::Running;
            cell.state = RuntimeState::Stopped;
            if !was_running {
                return Ok(());
            }
            (cell.intake_tx.take(), cell.scheduler.take())
        };

        if let Some(tx) = intake_tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            // Queued envelopes are ahead of Stop in FIFO order and drain first.
            if tx.send(Command::Stop { ack_tx }).await.is_ok() {
                let _ = ack_rx.await;
            }
        }

        self.shared.idle.wait_idle().await;

        if let Some(task) = scheduler {
            let _ = task.await;
        }
        info!("runtime stopped");
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> RuntimeState {
        self.shared.cell.lock().expect("state lock poisoned").state
    }

    /// Liveness observation: empty intake and no in-flight deliveries
    pub fn is_idle(&self) -> bool {
        self.shared.idle.is_idle()
    }

    /// Wait until the runtime is idle
    ///
    /// The deterministic way to drain a scenario in tests: every envelope
    /// accepted before this call, and every delivery transitively caused by
    /// one, completes before it returns.
    pub async fn run_until_idle(&self) {
        self.shared.idle.wait_idle().await;
    }

    /// This runtime's serialization registry
    pub fn serialization(&self) -> SerializationRegistry {
        self.shared.serialization.clone()
    }

    /// This runtime's intervention chain
    pub fn intervention_chain(&self) -> InterventionChain {
        self.shared.chain.clone()
    }

    fn intake(&self) -> Result<mpsc::Sender<Command>> {
        let cell = self.shared.cell.lock().expect("state lock poisoned");
        if cell.state != RuntimeState::Running {
            return Err(Error::RuntimeStopped);
        }
        cell.intake_tx.clone().ok_or(Error::RuntimeStopped)
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRuntime for LocalRuntime {
    async fn register(
        &self,
        agent_type: &str,
        factory: Box<dyn AgentFactory>,
        subscriptions: Vec<Box<dyn Subscription>>,
    ) -> Result<()> {
        let intake = self.intake()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        intake
            .send(Command::Register {
                agent_type: agent_type.to_string(),
                factory,
                subscriptions,
                ack_tx,
            })
            .await
            .map_err(|_| Error::RuntimeStopped)?;
        ack_rx.await.map_err(|_| Error::RuntimeStopped)?
    }

    async fn send(
        &self,
        message: Message,
        recipient: AgentId,
        sender: Option<AgentId>,
        cancellation: Option<CancellationToken>,
    ) -> Result<Option<Message>> {
        let intake = self.intake()?;
        let cancellation = cancellation.unwrap_or_default();
        let (reply_tx, reply_rx) = oneshot::channel();

        let work = self.shared.idle.begin();
        intake
            .send(Command::Send {
                message,
                recipient,
                sender,
                cancellation: cancellation.clone(),
                reply_tx,
                work,
            })
            .await
            .map_err(|_| Error::RuntimeStopped)?;

        tokio::select! {
            result = reply_rx => result.unwrap_or(Err(Error::RuntimeStopped)),
            _ = cancellation.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn publish(
        &self,
        message: Message,
        topic: TopicId,
        sender: Option<AgentId>,
        cancellation: Option<CancellationToken>,
    ) -> Result<()> {
        let intake = self.intake()?;
        let work = self.shared.idle.begin();
        intake
            .send(Command::Publish {
                message,
                topic,
                sender,
                cancellation: cancellation.unwrap_or_default(),
                work,
            })
            .await
            .map_err(|_| Error::RuntimeStopped)
    }

    async fn resolve_or_create(&self, agent_type: &str, key: &str) -> Result<AgentId> {
        let intake = self.intake()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        intake
            .send(Command::ResolveOrCreate {
                agent_type: agent_type.to_string(),
                key: key.to_string(),
                ack_tx,
            })
            .await
            .map_err(|_| Error::RuntimeStopped)?;
        ack_rx.await.map_err(|_| Error::RuntimeStopped)?
    }
}

// =============================================================================
// Scheduler
// =============================================================================

struct Registration {
    factory: Box<dyn AgentFactory>,
}

/// The task that owns all runtime state
struct Scheduler {
    intake_rx: mpsc::Receiver<Command>,
    chain: InterventionChain,
    idle: IdleTracker,
    mailbox_depth: usize,
    registrations: HashMap<String, Registration>,
    subscriptions: SubscriptionTable,
    activations: HashMap<AgentId, Activation>,
}

impl Scheduler {
    async fn run(mut self) {
        while let Some(command) = self.intake_rx.recv().await {
            match command {
                Command::Stop { ack_tx } => {
                    let _ = ack_tx.send(());
                    break;
                }
                other => self.process_next(other).await,
            }
        }
        // Dropping the activations closes their mailboxes; instance tasks
        // drain what is already queued and then exit.
        debug!("scheduler exited");
    }

    async fn process_next(&mut self, command: Command) {
        match command {
            Command::Send {
                message,
                recipient,
                sender,
                cancellation,
                reply_tx,
                work,
            } => {
                let message = match self
                    .chain
                    .apply_send(message, sender.as_ref(), &recipient)
                    .await
                {
                    Ok(message) => message,
                    Err(stage) => {
                        let _ = reply_tx.send(Err(Error::message_dropped(stage)));
                        return;
                    }
                };

                let activation = match self.activation(&recipient) {
                    Ok(activation) => activation,
                    Err(err) => {
                        let _ = reply_tx.send(Err(err));
                        return;
                    }
                };

                let context = MessageContext::direct(sender, cancellation);
                activation.deliver(Delivery {
                    message,
                    context,
                    kind: DeliveryKind::Call { reply_tx },
                    work,
                });
            }

            Command::Publish {
                message,
                topic,
                sender,
                cancellation,
                work,
            } => {
                let message = match self.chain.apply_publish(message, sender.as_ref()).await {
                    Ok(message) => message,
                    Err(stage) => {
                        debug!(%topic, stage = %stage, "publish dropped by intervention");
                        return;
                    }
                };

                let recipients = self.subscriptions.recipients(&topic);
                if recipients.is_empty() {
                    debug!(%topic, "publish matched no subscriptions");
                    return;
                }

                let idle = self.idle.clone();
                for recipient in recipients {
                    // An agent does not receive its own broadcasts.
                    if sender.as_ref() == Some(&recipient) {
                        continue;
                    }
                    let activation = match self.activation(&recipient) {
                        Ok(activation) => activation,
                        Err(err) => {
                            warn!(agent = %recipient, error = %err, "skipping broadcast recipient");
                            continue;
                        }
                    };
                    let context =
                        MessageContext::broadcast(topic.clone(), sender.clone(), cancellation.clone());
                    activation.deliver(Delivery {
                        message: message.clone(),
                        context,
                        kind: DeliveryKind::Event,
                        work: idle.begin(),
                    });
                }
                drop(work);
            }

            Command::Register {
                agent_type,
                factory,
                subscriptions,
                ack_tx,
            } => {
                let _ = ack_tx.send(self.register(agent_type, factory, subscriptions));
            }

            Command::ResolveOrCreate {
                agent_type,
                key,
                ack_tx,
            } => {
                let result = AgentId::new(agent_type, key)
                    .and_then(|id| self.activation(&id).map(|_| id));
                let _ = ack_tx.send(result);
            }

            Command::Stop { ack_tx } => {
                // Handled in run(); unreachable here.
                let _ = ack_tx.send(());
            }
        }
    }

    fn register(
        &mut self,
        agent_type: String,
        factory: Box<dyn AgentFactory>,
        subscriptions: Vec<Box<dyn Subscription>>,
    ) -> Result<()> {
        if self.registrations.contains_key(&agent_type) {
            return Err(Error::DuplicateRegistration { agent_type });
        }
        if self.registrations.len() >= AGENT_TYPES_COUNT_MAX {
            return Err(Error::internal(format!(
                "registered agent types exceed limit {}",
                AGENT_TYPES_COUNT_MAX
            )));
        }

        info!(agent_type = %agent_type, subscriptions = subscriptions.len(), "agent type registered");
        self.registrations
            .insert(agent_type, Registration { factory });
        for subscription in subscriptions {
            self.subscriptions.insert(subscription);
        }
        Ok(())
    }

    /// Resolve the activation for an id, instantiating it on first use
    fn activation(&mut self, id: &AgentId) -> Result<&Activation> {
        if !self.activations.contains_key(id) {
            let registration = self
                .registrations
                .get(id.agent_type())
                .ok_or_else(|| Error::unknown_recipient(id.agent_type()))?;
            let agent = registration.factory.create(id)?;
            debug!(agent = %id, "agent instance created");
            self.activations.insert(
                id.clone(),
                Activation::spawn(id.clone(), agent, self.chain.clone(), self.mailbox_depth),
            );
        }
        Ok(self
            .activations
            .get(id)
            .expect("activation present after insert"))
    }
}
