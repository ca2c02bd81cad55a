//! The distributed worker runtime
//!
//! A worker embeds a `LocalRuntime` for the agents it registers and holds
//! exactly one connection, to the routing host. Sends consult the cached
//! directory (a host lookup on miss): the owner being this worker takes
//! the in-process path; anything else is encoded and proxied through the
//! host. Serialization happens at this boundary only. Intervention chains
//! run in the runtime that owns the recipient, so a veto is applied once
//! and carried back across the wire as `MessageDropped`.

use crate::config::WorkerConfig;
use crate::protocol::{read_frame, write_frame, Frame, RequestId, WireError, WorkerId};
use async_trait::async_trait;
use selkie_core::{
    AgentFactory, AgentId, AgentRuntime, CancellationToken, Error, Message, Result,
    RuntimeState, SerializationRegistry, SerializedMessage, Subscription, TopicId,
};
use selkie_runtime::LocalRuntime;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum PendingSlot {
    Call(oneshot::Sender<Result<Option<SerializedMessage>>>),
    Lookup(oneshot::Sender<Result<Option<WorkerId>>>),
}

struct WorkerInner {
    worker_id: WorkerId,
    local: LocalRuntime,
    serialization: SerializationRegistry,
    frame_tx: mpsc::Sender<Frame>,
    /// In-flight proxied calls and lookups, resolved exactly once each
    pending: Mutex<HashMap<RequestId, PendingSlot>>,
    next_request_id: AtomicU64,
    connected: AtomicBool,
    /// Cached placement answers from the host
    directory: Mutex<HashMap<AgentId, WorkerId>>,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Resolve every in-flight call with `PeerUnavailable`
///
/// Reconnection does not resurrect these; there is no replay.
fn drain_pending(inner: &WorkerInner, reason: &str) {
    inner.connected.store(false, Ordering::SeqCst);
    inner
        .directory
        .lock()
        .expect("directory lock poisoned")
        .clear();

    let drained: Vec<PendingSlot> = {
        let mut pending = inner.pending.lock().expect("pending lock poisoned");
        pending.drain().map(|(_, slot)| slot).collect()
    };
    for slot in drained {
        let err = Error::peer_unavailable("host", reason);
        match slot {
            PendingSlot::Call(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingSlot::Lookup(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Network-transparent implementation of the runtime contracts
///
/// Cloning produces another handle to the same worker.
#[derive(Clone)]
pub struct WorkerRuntime {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("worker_id", &self.inner.worker_id)
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    /// Connect to the host and hand it this worker's identity
    ///
    /// Starts the local runtime if it has not been started. Failing to
    /// connect is fatal to a worker process; callers surface the error and
    /// exit.
    pub async fn connect(config: WorkerConfig, local: LocalRuntime) -> Result<Self> {
        config.validate()?;
        let worker_id = WorkerId::new(&config.worker_id)?;

        if local.state() == RuntimeState::Created {
            local.start()?;
        }

        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect(&config.host_address),
        )
        .await
        .map_err(|_| Error::peer_unavailable(&config.host_address, "connect timed out"))?
        .map_err(|e| {
            Error::peer_unavailable(&config.host_address, format!("connect failed: {}", e))
        })?;
        let _ = stream.set_nodelay(true);

        let (mut read_half, mut write_half) = stream.into_split();

        // Handshake happens before the io tasks exist, so the ack is the
        // only thing on the stream.
        write_frame(
            &mut write_half,
            &Frame::Hello {
                worker_id: worker_id.clone(),
            },
        )
        .await?;
        match tokio::time::timeout(connect_timeout, read_frame(&mut read_half)).await {
            Ok(Ok(Some(Frame::HelloAck { accepted: true, .. }))) => {}
            Ok(Ok(Some(Frame::HelloAck {
                accepted: false,
                reason,
            }))) => {
                return Err(Error::peer_unavailable(
                    &config.host_address,
                    reason.unwrap_or_else(|| "rejected by host".into()),
                ));
            }
            Ok(Ok(Some(frame))) => {
                return Err(Error::internal(format!(
                    "unexpected handshake frame: {}",
                    frame.kind()
                )));
            }
            Ok(Ok(None)) => {
                return Err(Error::peer_unavailable(
                    &config.host_address,
                    "host closed during handshake",
                ));
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(Error::peer_unavailable(
                    &config.host_address,
                    "handshake timed out",
                ));
            }
        }

        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(256);
        let inner = Arc::new(WorkerInner {
            worker_id: worker_id.clone(),
            serialization: local.serialization(),
            local,
            frame_tx,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            directory: Mutex::new(HashMap::new()),
            io_tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if let Err(err) = write_frame(&mut write_half, &frame).await {
                    warn!(error = %err, "write to host failed");
                    break;
                }
            }
        });

        let reader_inner = Arc::clone(&inner);
        let reader = tokio::spawn(reader_loop(read_half, reader_inner));

        inner
            .io_tasks
            .lock()
            .expect("io tasks lock poisoned")
            .extend([writer, reader]);

        info!(worker = %worker_id, host = %config.host_address, "worker connected");
        Ok(Self { inner })
    }

    /// This worker's identity
    pub fn worker_id(&self) -> &WorkerId {
        &self.inner.worker_id
    }

    /// The embedded local runtime
    pub fn local(&self) -> &LocalRuntime {
        &self.inner.local
    }

    /// Whether the host connection is up
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Close the host connection, then stop the local runtime
    ///
    /// In-flight proxied calls resolve `PeerUnavailable`; local deliveries
    /// drain through the local runtime's stop.
    pub async fn shutdown(&self) -> Result<()> {
        let tasks: Vec<JoinHandle<()>> = {
            let mut io_tasks = self.inner.io_tasks.lock().expect("io tasks lock poisoned");
            io_tasks.drain(..).collect()
        };
        for task in &tasks {
            task.abort();
        }
        drain_pending(&self.inner, "worker shutting down");
        self.inner.local.stop().await?;
        info!(worker = %self.inner.worker_id, "worker stopped");
        Ok(())
    }

    fn next_request_id(&self) -> RequestId {
        self.inner.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::peer_unavailable("host", "not connected"));
        }
        self.inner
            .frame_tx
            .send(frame)
            .await
            .map_err(|_| Error::peer_unavailable("host", "connection closed"))
    }

    /// Which worker owns this id, per the host directory
    async fn owner_of(&self, id: &AgentId) -> Result<WorkerId> {
        if let Some(owner) = self
            .inner
            .directory
            .lock()
            .expect("directory lock poisoned")
            .get(id)
            .cloned()
        {
            return Ok(owner);
        }

        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(request_id, PendingSlot::Lookup(tx));

        if let Err(err) = self
            .send_frame(Frame::Lookup {
                request_id,
                agent_id: id.clone(),
            })
            .await
        {
            self.inner
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&request_id);
            return Err(err);
        }

        let owner = rx
            .await
            .map_err(|_| Error::peer_unavailable("host", "connection lost"))??;
        match owner {
            Some(owner) => {
                self.inner
                    .directory
                    .lock()
                    .expect("directory lock poisoned")
                    .insert(id.clone(), owner.clone());
                Ok(owner)
            }
            None => Err(Error::unknown_recipient(id.agent_type())),
        }
    }
}

#[async_trait]
impl AgentRuntime for WorkerRuntime {
    async fn register(
        &self,
        agent_type: &str,
        factory: Box<dyn AgentFactory>,
        subscriptions: Vec<Box<dyn Subscription>>,
    ) -> Result<()> {
        let specs = subscriptions.iter().map(|s| s.spec()).collect::<Vec<_>>();
        self.inner
            .local
            .register(agent_type, factory, subscriptions)
            .await?;
        self.send_frame(Frame::Register {
            agent_type: agent_type.to_string(),
            subscriptions: specs,
        })
        .await
    }

    async fn send(
        &self,
        message: Message,
        recipient: AgentId,
        sender: Option<AgentId>,
        cancellation: Option<CancellationToken>,
    ) -> Result<Option<Message>> {
        let owner = self.owner_of(&recipient).await?;
        if owner == self.inner.worker_id {
            return self
                .inner
                .local
                .send(message, recipient, sender, cancellation)
                .await;
        }

        // Remote path: serialize at the boundary, proxy through the host.
        let cancellation = cancellation.unwrap_or_default();
        let serialized = self.inner.serialization.encode(&message)?;

        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(request_id, PendingSlot::Call(tx));

        debug!(request_id, recipient = %recipient, owner = %owner, "proxying send");
        if let Err(err) = self
            .send_frame(Frame::Request {
                request_id,
                recipient,
                sender,
                message: serialized,
                trace: None,
            })
            .await
        {
            self.inner
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&request_id);
            return Err(err);
        }

        let raw = tokio::select! {
            result = rx => {
                result.map_err(|_| Error::peer_unavailable("host", "connection lost"))?
            }
            _ = cancellation.cancelled() => {
                // Abandon the pending entry; a late reply is discarded.
                self.inner
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&request_id);
                return Err(Error::Cancelled);
            }
        }?;

        match raw {
            Some(serialized) => Ok(Some(self.inner.serialization.decode(&serialized)?)),
            None => Ok(None),
        }
    }

    async fn publish(
        &self,
        message: Message,
        topic: TopicId,
        sender: Option<AgentId>,
        _cancellation: Option<CancellationToken>,
    ) -> Result<()> {
        // All publishes route through the host, which fans them back to
        // every worker with a matching subscription - including this one,
        // so local delivery shares the single code path.
        let serialized = self.inner.serialization.encode(&message)?;
        self.send_frame(Frame::Publish {
            topic,
            sender,
            message: serialized,
            trace: None,
        })
        .await
    }

    async fn resolve_or_create(&self, agent_type: &str, key: &str) -> Result<AgentId> {
        let id = AgentId::new(agent_type, key)?;
        let owner = self.owner_of(&id).await?;
        if owner == self.inner.worker_id {
            return self.inner.local.resolve_or_create(agent_type, key).await;
        }
        // The remote instance is created by its owner on first message.
        Ok(id)
    }
}

// =============================================================================
// Incoming frames
// =============================================================================

async fn reader_loop(mut read_half: OwnedReadHalf, inner: Arc<WorkerInner>) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(frame)) => handle_frame(frame, &inner).await,
            Ok(None) => {
                info!("host closed the connection");
                break;
            }
            Err(err) => {
                warn!(error = %err, "read from host failed");
                break;
            }
        }
    }
    drain_pending(&inner, "connection lost");
}

async fn handle_frame(frame: Frame, inner: &Arc<WorkerInner>) {
    match frame {
        Frame::Request {
            request_id,
            recipient,
            sender,
            message,
            trace: _,
        } => {
            // Handled on its own task so a slow agent does not stall the
            // reader.
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let result = handle_request(&inner, recipient, sender, message).await;
                let frame = Frame::Response {
                    request_id,
                    result: result.map_err(|e| WireError::from_error(&e)),
                };
                let _ = inner.frame_tx.send(frame).await;
            });
        }

        Frame::Publish {
            topic,
            sender,
            message,
            trace: _,
        } => match inner.serialization.decode(&message) {
            Ok(decoded) => {
                if let Err(err) = inner.local.publish(decoded, topic, sender, None).await {
                    warn!(error = %err, "incoming publish failed");
                }
            }
            Err(err) => {
                warn!(error = %err, type_name = %message.type_name, "cannot decode incoming publish");
            }
        },

        Frame::Response { request_id, result } => {
            let slot = inner
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&request_id);
            match slot {
                Some(PendingSlot::Call(tx)) => {
                    let _ = tx.send(result.map_err(WireError::into_error));
                }
                Some(PendingSlot::Lookup(tx)) => {
                    warn!(request_id, "response frame resolved a lookup slot");
                    let _ = tx.send(Err(Error::internal("protocol mismatch")));
                }
                None => debug!(request_id, "response for unknown request"),
            }
        }

        Frame::LookupAck { request_id, owner } => {
            let slot = inner
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&request_id);
            match slot {
                Some(PendingSlot::Lookup(tx)) => {
                    let _ = tx.send(Ok(owner));
                }
                Some(PendingSlot::Call(tx)) => {
                    warn!(request_id, "lookup ack resolved a call slot");
                    let _ = tx.send(Err(Error::internal("protocol mismatch")));
                }
                None => debug!(request_id, "lookup ack for unknown request"),
            }
        }

        other => {
            warn!(kind = other.kind(), "unexpected frame from host");
        }
    }
}

/// Resolve an incoming proxied send against the local runtime
async fn handle_request(
    inner: &Arc<WorkerInner>,
    recipient: AgentId,
    sender: Option<AgentId>,
    message: SerializedMessage,
) -> Result<Option<SerializedMessage>> {
    let decoded = inner.serialization.decode(&message)?;
    let reply = inner.local.send(decoded, recipient, sender, None).await?;
    match reply {
        Some(reply) => Ok(Some(inner.serialization.encode(&reply)?)),
        None => Ok(None),
    }
}
