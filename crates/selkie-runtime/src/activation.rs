//! Agent activations
//!
//! An activation is a live agent instance: the boxed agent plus a bounded
//! mailbox drained by a dedicated task. The scheduler enqueues deliveries
//! in intake order, so each instance sees its mailbox in FIFO order while
//! distinct instances run concurrently. One activation exists per
//! `AgentId` for the lifetime of the runtime (no eviction).

use crate::intake::WorkGuard;
use selkie_core::{Agent, AgentId, Error, InterventionChain, Message, MessageContext, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// How a delivery resolves
pub(crate) enum DeliveryKind {
    /// Point-to-point call: the reply slot is resolved exactly once
    Call {
        reply_tx: oneshot::Sender<Result<Option<Message>>>,
    },
    /// Broadcast delivery: return values discarded, failures logged
    Event,
}

/// One message queued for an instance
pub(crate) struct Delivery {
    pub message: Message,
    pub context: MessageContext,
    pub kind: DeliveryKind,
    pub work: WorkGuard,
}

/// A live agent instance and its mailbox
///
/// Dropping the activation closes the mailbox; the instance task drains
/// what is already queued and exits.
pub(crate) struct Activation {
    id: AgentId,
    mailbox_tx: mpsc::Sender<Delivery>,
    mailbox_depth: usize,
}

impl Activation {
    /// Create the instance task and its mailbox
    pub fn spawn(
        id: AgentId,
        agent: Box<dyn Agent>,
        chain: InterventionChain,
        mailbox_depth: usize,
    ) -> Self {
        debug_assert!(mailbox_depth > 0, "mailbox depth must be positive");

        let (mailbox_tx, mailbox_rx) = mpsc::channel(mailbox_depth);
        tokio::spawn(run_instance(id.clone(), agent, chain, mailbox_rx));

        Self {
            id,
            mailbox_tx,
            mailbox_depth,
        }
    }

    /// Enqueue a delivery without blocking the scheduler
    ///
    /// A full mailbox resolves a call with `MailboxFull` and drops an
    /// event with a warning (broadcasts are best-effort).
    pub fn deliver(&self, delivery: Delivery) {
        match self.mailbox_tx.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(rejected)) => {
                warn!(
                    agent = %self.id,
                    limit = self.mailbox_depth,
                    "mailbox full, rejecting delivery"
                );
                if let DeliveryKind::Call { reply_tx } = rejected.kind {
                    let _ = reply_tx.send(Err(Error::MailboxFull {
                        agent: self.id.to_string(),
                        depth: self.mailbox_depth,
                        limit: self.mailbox_depth,
                    }));
                }
            }
            Err(mpsc::error::TrySendError::Closed(rejected)) => {
                // Instance task exited; only happens during teardown.
                if let DeliveryKind::Call { reply_tx } = rejected.kind {
                    let _ = reply_tx.send(Err(Error::RuntimeStopped));
                }
            }
        }
    }
}

/// Mailbox loop: one message at a time, in order
async fn run_instance(
    id: AgentId,
    mut agent: Box<dyn Agent>,
    chain: InterventionChain,
    mut mailbox_rx: mpsc::Receiver<Delivery>,
) {
    while let Some(delivery) = mailbox_rx.recv().await {
        let Delivery {
            message,
            context,
            kind,
            work,
        } = delivery;

        match kind {
            DeliveryKind::Call { reply_tx } => {
                let result = if context.cancellation.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    let type_name = message.type_name().to_string();
                    debug!(agent = %id, %type_name, "handling call");
                    match agent.on_message(message, &context).await {
                        Ok(Some(reply)) => {
                            match chain
                                .apply_response(reply, &id, context.sender.as_ref())
                                .await
                            {
                                Ok(reply) => Ok(Some(reply)),
                                Err(stage) => Err(Error::message_dropped(stage)),
                            }
                        }
                        other => other,
                    }
                };
                // Receiver may have given up (cancellation); that is fine.
                let _ = reply_tx.send(result);
            }
            DeliveryKind::Event => {
                if context.cancellation.is_cancelled() {
                    debug!(agent = %id, "skipping cancelled broadcast delivery");
                } else if let Err(err) = agent.on_message(message, &context).await {
                    // Broadcasts are best-effort: a recipient that cannot
                    // handle the message is not an error for the publisher.
                    warn!(agent = %id, error = %err, "broadcast delivery failed");
                }
            }
        }

        drop(work);
    }

    debug!(agent = %id, "instance task exited");
}
