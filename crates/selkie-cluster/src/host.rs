//! The routing host
//!
//! Holds the authoritative directory of which worker owns which agent
//! type, assigns per-key placement on first message (never migrated),
//! proxies RPC sends between workers, and fans publishes out to every
//! worker advertising a matching subscription. Workers connect to the
//! host; they never dial each other.

use crate::config::HostConfig;
use crate::protocol::{
    read_frame, write_frame, Frame, RequestId, WireError, WireErrorKind, WorkerId,
};
use selkie_core::{AgentId, Error, Result, SubscriptionSpec};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

// =============================================================================
// Shared state
// =============================================================================

struct WorkerHandle {
    frame_tx: mpsc::Sender<Frame>,
}

/// Directory of registrations and placements
///
/// Single source of truth for agent-type ownership: registration order per
/// type, plus the first-message-wins placement of each key.
#[derive(Default)]
struct Directory {
    /// Workers advertising each agent type, in registration order
    types: HashMap<String, Vec<WorkerId>>,
    /// Where each key lives; assigned at first message, never migrated
    placements: HashMap<AgentId, WorkerId>,
    /// Advertised subscriptions, used for publish fan-out
    subscriptions: Vec<(WorkerId, SubscriptionSpec)>,
}

struct Relay {
    origin: WorkerId,
    origin_request_id: RequestId,
    owner: WorkerId,
}

struct HostShared {
    workers: Mutex<HashMap<WorkerId, WorkerHandle>>,
    directory: Mutex<Directory>,
    relays: Mutex<HashMap<RequestId, Relay>>,
    next_relay_id: AtomicU64,
    workers_count_max: usize,
}

impl HostShared {
    fn worker_tx(&self, worker: &WorkerId) -> Option<mpsc::Sender<Frame>> {
        self.workers
            .lock()
            .expect("workers lock poisoned")
            .get(worker)
            .map(|handle| handle.frame_tx.clone())
    }

    /// Resolve the owner of an id, assigning placement on first use
    ///
    /// Lock order here and everywhere: workers before directory.
    fn place(&self, id: &AgentId) -> Option<WorkerId> {
        let workers = self.workers.lock().expect("workers lock poisoned");
        let mut directory = self.directory.lock().expect("directory lock poisoned");

        if let Some(owner) = directory.placements.get(id) {
            if workers.contains_key(owner) {
                return Some(owner.clone());
            }
            // Owner is gone; the key may be re-placed on a survivor as a
            // fresh instance.
            directory.placements.remove(id);
        }

        let owner = directory
            .types
            .get(id.agent_type())?
            .iter()
            .find(|candidate| workers.contains_key(*candidate))?
            .clone();
        directory.placements.insert(id.clone(), owner.clone());
        debug!(agent = %id, worker = %owner, "placement assigned");
        Some(owner)
    }
}

// =============================================================================
// Host
// =============================================================================

/// Handle for signalling host shutdown
#[derive(Clone)]
pub struct HostHandle {
    shutdown_tx: broadcast::Sender<()>,
}

impl HostHandle {
    /// Ask the host to drain in-flight relays and stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// The routing host process
pub struct Host {
    config: HostConfig,
    listener: TcpListener,
    shared: Arc<HostShared>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Host {
    /// Bind the host listener
    ///
    /// Failing to bind is fatal to the process; callers surface the error
    /// and exit rather than run without a listener.
    pub async fn bind(config: HostConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|e| {
                Error::internal(format!("failed to bind {}: {}", config.bind_address, e))
            })?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            shared: Arc::new(HostShared {
                workers: Mutex::new(HashMap::new()),
                directory: Mutex::new(Directory::default()),
                relays: Mutex::new(HashMap::new()),
                next_relay_id: AtomicU64::new(1),
                workers_count_max: config.workers_count_max,
            }),
            config,
            listener,
            shutdown_tx,
        })
    }

    /// The bound address (useful with a port-0 bind)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::internal(format!("local_addr failed: {}", e)))
    }

    /// Handle for triggering shutdown from elsewhere
    pub fn handle(&self) -> HostHandle {
        HostHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Accept worker connections until shutdown, then drain and close
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(addr = %self.local_addr()?, "host listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(handle_connection(stream, peer, shared));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Finish in-flight relays (bounded by the drain timeout), then close
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.drain_timeout_ms);

        loop {
            let in_flight = self.shared.relays.lock().expect("relays lock poisoned").len();
            if in_flight == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight, "drain timeout reached with relays in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Dropping the frame senders ends each writer task and closes the
        // connections.
        self.shared
            .workers
            .lock()
            .expect("workers lock poisoned")
            .clear();
        info!("host stopped");
    }
}

// =============================================================================
// Connection handling
// =============================================================================

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<HostShared>) {
    let (mut read_half, mut write_half) = stream.into_split();

    // Handshake: the first frame must identify the worker.
    let worker_id = match read_frame(&mut read_half).await {
        Ok(Some(Frame::Hello { worker_id })) => worker_id,
        Ok(Some(frame)) => {
            warn!(%peer, kind = frame.kind(), "connection did not start with hello");
            return;
        }
        Ok(None) => return,
        Err(err) => {
            warn!(%peer, error = %err, "handshake read failed");
            return;
        }
    };

    let rejection = {
        let workers = shared.workers.lock().expect("workers lock poisoned");
        if workers.len() >= shared.workers_count_max {
            Some(format!("worker limit {} reached", shared.workers_count_max))
        } else if workers.contains_key(&worker_id) {
            Some(format!("worker id {} already connected", worker_id))
        } else {
            None
        }
    };
    if let Some(reason) = rejection {
        warn!(worker = %worker_id, %peer, reason = %reason, "worker rejected");
        let _ = write_frame(
            &mut write_half,
            &Frame::HelloAck {
                accepted: false,
                reason: Some(reason.clone()),
            },
        )
        .await;
        return;
    }

    if write_frame(
        &mut write_half,
        &Frame::HelloAck {
            accepted: true,
            reason: None,
        },
    )
    .await
    .is_err()
    {
        return;
    }

    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(256);
    shared
        .workers
        .lock()
        .expect("workers lock poisoned")
        .insert(worker_id.clone(), WorkerHandle { frame_tx });
    info!(worker = %worker_id, %peer, "worker connected");

    let writer_worker = worker_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if let Err(err) = write_frame(&mut write_half, &frame).await {
                warn!(worker = %writer_worker, error = %err, "write failed");
                break;
            }
        }
    });

    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(frame)) => dispatch(&worker_id, frame, &shared).await,
            Ok(None) => break,
            Err(err) => {
                warn!(worker = %worker_id, error = %err, "read failed");
                break;
            }
        }
    }

    cleanup_worker(&worker_id, &shared).await;
    writer.abort();
    info!(worker = %worker_id, "worker disconnected");
}

async fn respond(shared: &HostShared, to: &WorkerId, frame: Frame) {
    if let Some(tx) = shared.worker_tx(to) {
        let _ = tx.send(frame).await;
    }
}

async fn dispatch(from: &WorkerId, frame: Frame, shared: &Arc<HostShared>) {
    match frame {
        Frame::Register {
            agent_type,
            subscriptions,
        } => {
            let mut directory = shared.directory.lock().expect("directory lock poisoned");
            let owners = directory.types.entry(agent_type.clone()).or_default();
            if !owners.contains(from) {
                owners.push(from.clone());
            }
            for spec in subscriptions {
                let already = directory
                    .subscriptions
                    .iter()
                    .any(|(worker, existing)| worker == from && existing.id == spec.id);
                if !already {
                    directory.subscriptions.push((from.clone(), spec));
                }
            }
            info!(worker = %from, agent_type = %agent_type, "registration advertised");
        }

        Frame::Request {
            request_id,
            recipient,
            sender,
            message,
            trace,
        } => {
            let Some(owner) = shared.place(&recipient) else {
                respond(
                    shared,
                    from,
                    Frame::Response {
                        request_id,
                        result: Err(WireError {
                            kind: WireErrorKind::UnknownRecipient,
                            detail: recipient.agent_type().to_string(),
                        }),
                    },
                )
                .await;
                return;
            };

            let relay_id = shared.next_relay_id.fetch_add(1, Ordering::SeqCst);
            shared.relays.lock().expect("relays lock poisoned").insert(
                relay_id,
                Relay {
                    origin: from.clone(),
                    origin_request_id: request_id,
                    owner: owner.clone(),
                },
            );

            let delivered = match shared.worker_tx(&owner) {
                Some(tx) => tx
                    .send(Frame::Request {
                        request_id: relay_id,
                        recipient,
                        sender,
                        message,
                        trace,
                    })
                    .await
                    .is_ok(),
                None => false,
            };

            if !delivered {
                shared
                    .relays
                    .lock()
                    .expect("relays lock poisoned")
                    .remove(&relay_id);
                respond(
                    shared,
                    from,
                    Frame::Response {
                        request_id,
                        result: Err(WireError {
                            kind: WireErrorKind::PeerUnavailable,
                            detail: format!("worker {} unavailable", owner),
                        }),
                    },
                )
                .await;
            }
        }

        Frame::Response { request_id, result } => {
            let relay = shared
                .relays
                .lock()
                .expect("relays lock poisoned")
                .remove(&request_id);
            match relay {
                Some(relay) if &relay.owner == from => {
                    respond(
                        shared,
                        &relay.origin,
                        Frame::Response {
                            request_id: relay.origin_request_id,
                            result,
                        },
                    )
                    .await;
                }
                Some(relay) => {
                    warn!(worker = %from, owner = %relay.owner, "response from wrong worker");
                    shared
                        .relays
                        .lock()
                        .expect("relays lock poisoned")
                        .insert(request_id, relay);
                }
                None => {
                    debug!(request_id, "response for unknown relay");
                }
            }
        }

        Frame::Publish {
            topic,
            sender,
            message,
            trace,
        } => {
            let targets: Vec<WorkerId> = {
                let directory = shared.directory.lock().expect("directory lock poisoned");
                let mut targets = Vec::new();
                for (worker, spec) in &directory.subscriptions {
                    if spec.topic_type == topic.topic_type() && !targets.contains(worker) {
                        targets.push(worker.clone());
                    }
                }
                targets
            };

            if targets.is_empty() {
                debug!(%topic, "publish matched no advertised subscriptions");
                return;
            }

            for worker in targets {
                if let Some(tx) = shared.worker_tx(&worker) {
                    let _ = tx
                        .send(Frame::Publish {
                            topic: topic.clone(),
                            sender: sender.clone(),
                            message: message.clone(),
                            trace: trace.clone(),
                        })
                        .await;
                }
            }
        }

        Frame::Lookup {
            request_id,
            agent_id,
        } => {
            let owner = shared.place(&agent_id);
            respond(shared, from, Frame::LookupAck { request_id, owner }).await;
        }

        Frame::Hello { .. } | Frame::HelloAck { .. } | Frame::LookupAck { .. } => {
            warn!(worker = %from, kind = frame.kind(), "unexpected frame");
        }
    }
}

/// Remove every trace of a disconnected worker
///
/// In-flight relays owned by it resolve `PeerUnavailable` at their origin;
/// relays it originated are dropped (no replay on reconnect).
async fn cleanup_worker(worker_id: &WorkerId, shared: &Arc<HostShared>) {
    shared
        .workers
        .lock()
        .expect("workers lock poisoned")
        .remove(worker_id);

    {
        let mut directory = shared.directory.lock().expect("directory lock poisoned");
        for owners in directory.types.values_mut() {
            owners.retain(|worker| worker != worker_id);
        }
        directory.types.retain(|_, owners| !owners.is_empty());
        directory.placements.retain(|_, owner| owner != worker_id);
        directory
            .subscriptions
            .retain(|(worker, _)| worker != worker_id);
    }

    let orphaned: Vec<(WorkerId, RequestId)> = {
        let mut relays = shared.relays.lock().expect("relays lock poisoned");
        let dead: Vec<RequestId> = relays
            .iter()
            .filter(|(_, relay)| &relay.owner == worker_id || &relay.origin == worker_id)
            .map(|(id, _)| *id)
            .collect();
        dead.into_iter()
            .filter_map(|id| {
                let relay = relays.remove(&id)?;
                (&relay.origin != worker_id)
                    .then_some((relay.origin, relay.origin_request_id))
            })
            .collect()
    };

    for (origin, origin_request_id) in orphaned {
        respond(
            shared,
            &origin,
            Frame::Response {
                request_id: origin_request_id,
                result: Err(WireError {
                    kind: WireErrorKind::PeerUnavailable,
                    detail: format!("worker {} disconnected", worker_id),
                }),
            },
        )
        .await;
    }
}
