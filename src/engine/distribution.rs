// src/engine/distribution.rs
use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::task::{PeerId, Task, TaskKind};
use crate::node::registry::{MembershipEvent, Peer, PeerRegistry};
use crate::node::transport::{PeerMessage, PeerTransport, SerializedTask};
use crate::utils::error::TaskError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OffloadError {
    /// Nothing was sent; the caller may still run the task locally.
    #[error("offload failed: {0}")]
    OffloadFailed(String),
    #[error("peer {0} was lost mid-flight")]
    PeerLost(PeerId),
    #[error("peer reported failure: {0}")]
    Remote(String),
}

impl From<OffloadError> for TaskError {
    fn from(err: OffloadError) -> Self {
        match err {
            OffloadError::OffloadFailed(msg) => TaskError::ResourceUnavailable(msg),
            OffloadError::PeerLost(peer) => TaskError::PeerLost(peer),
            OffloadError::Remote(msg) => TaskError::Executor(msg),
        }
    }
}

#[derive(Debug)]
struct PendingOffload {
    peer_id: PeerId,
    reply: oneshot::Sender<Result<Value, OffloadError>>,
}

/// Resolves with the peer's answer. A lost peer or a failed send resolves it
/// with an error. The distributor imposes no deadline of its own; the scheduler's
/// timer decides when to give up.
#[derive(Debug)]
pub struct OffloadTicket {
    pub task_id: Uuid,
    pub peer_id: PeerId,
    rx: oneshot::Receiver<Result<Value, OffloadError>>,
}

impl OffloadTicket {
    pub async fn result(self) -> Result<Value, OffloadError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // pending entry dropped without a reply: the distributor went away
            Err(_) => Err(OffloadError::PeerLost(self.peer_id)),
        }
    }
}

/// Ships tasks to remote peers and tracks the in-flight round trips.
#[derive(Debug)]
pub struct PeerDistributor {
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn PeerTransport>,
    pending: Arc<DashMap<Uuid, PendingOffload>>,
    inbound: flume::Receiver<(PeerId, PeerMessage)>,
}

impl PeerDistributor {
    pub fn new(registry: Arc<PeerRegistry>, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = flume::unbounded();
        transport.attach(inbound_tx);

        Arc::new(Self {
            registry,
            transport,
            pending: Arc::new(DashMap::new()),
            inbound: inbound_rx,
        })
    }

    /// Start the reply receiver and the membership watcher. Both stop when
    /// `shutdown` flips to true.
    pub fn spawn_listeners(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let receiver = {
            let distributor = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = distributor.inbound.recv_async() => match msg {
                            Ok((peer_id, message)) => distributor.handle_message(&peer_id, message),
                            Err(_) => break,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("peer reply receiver stopped");
            })
        };

        let watcher = {
            let distributor = Arc::clone(self);
            let events = self.registry.subscribe();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv_async() => match event {
                            Ok(event) => distributor.handle_membership(&event),
                            Err(_) => break,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("membership watcher stopped");
            })
        };

        vec![receiver, watcher]
    }

    /// Connected peer advertising `kind` with the lowest round-trip estimate.
    /// With `idle_only`, peers that already hold one of our tasks are skipped.
    pub fn select_peer(&self, kind: TaskKind, idle_only: bool) -> Option<Peer> {
        self.registry
            .connected_peers()
            .into_iter()
            .filter(|p| p.supports(kind))
            .filter(|p| !idle_only || self.in_flight(&p.id) == 0)
            .min_by(|a, b| {
                a.round_trip_estimate
                    .cmp(&b.round_trip_estimate)
                    .then_with(|| a.id.cmp(&b.id))
            })
    }

    /// Offload to the best connected peer for the task's kind.
    pub fn offload(&self, task: &Task) -> Result<OffloadTicket, OffloadError> {
        let peer = self.select_peer(task.kind(), false).ok_or_else(|| {
            OffloadError::OffloadFailed(format!("no connected peer advertises {}", task.kind()))
        })?;
        self.offload_to(task, &peer)
    }

    /// Register the task against `peer` and hand the assignment to the
    /// transport in the background. Never waits on the network: a send that
    /// fails later resolves the ticket with `OffloadFailed`.
    pub fn offload_to(&self, task: &Task, peer: &Peer) -> Result<OffloadTicket, OffloadError> {
        let task_id = task.id();
        let assignment = SerializedTask::from_task(task)
            .map_err(|e| OffloadError::OffloadFailed(e.to_string()))?;

        // register before checking membership so a disconnect is either seen
        // here or by the watcher, which then finds this entry
        let (reply, rx) = oneshot::channel();
        self.pending.insert(
            task_id,
            PendingOffload {
                peer_id: peer.id.clone(),
                reply,
            },
        );

        let connected = self.registry.get(&peer.id).map_or(false, |p| p.connected);
        if !connected {
            self.pending.remove(&task_id);
            return Err(OffloadError::OffloadFailed(format!("peer {} is not connected", peer.id)));
        }

        let transport = Arc::clone(&self.transport);
        let pending = Arc::clone(&self.pending);
        let peer_id = peer.id.clone();
        let kind = task.kind();
        tokio::spawn(async move {
            match transport.send(&peer_id, PeerMessage::TaskAssignment(assignment)).await {
                Ok(()) => {
                    counter!("taskmesh.distributor.offloads_total", 1);
                    info!(task = %task_id, %kind, peer = %peer_id, "task offloaded");
                }
                Err(e) => {
                    warn!(task = %task_id, peer = %peer_id, error = %e, "offload send failed");
                    if let Some((_, p)) = pending.remove_if(&task_id, |_, p| p.peer_id == peer_id) {
                        let _ = p.reply.send(Err(OffloadError::OffloadFailed(e.to_string())));
                    }
                }
            }
        });

        Ok(OffloadTicket {
            task_id,
            peer_id: peer.id.clone(),
            rx,
        })
    }

    /// Process a message pushed by the transport.
    pub fn handle_message(&self, peer_id: &str, message: PeerMessage) {
        match message {
            PeerMessage::TaskResult { task_id, outcome } => {
                let Some((_, pending)) = self.pending.remove_if(&task_id, |_, p| p.peer_id == peer_id) else {
                    debug!(task = %task_id, peer = peer_id, "result for unknown or foreign offload ignored");
                    return;
                };
                let outcome = outcome.map_err(OffloadError::Remote);
                let _ = pending.reply.send(outcome);
            }
            other => {
                debug!(peer = peer_id, message = ?other, "unexpected message from peer");
            }
        }
    }

    pub fn handle_membership(&self, event: &MembershipEvent) {
        let lost = match event {
            MembershipEvent::PeerDisconnected(id) | MembershipEvent::PeerRemoved(id) => id,
            MembershipEvent::PeerConnected(_) => return,
        };

        let task_ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| &entry.peer_id == lost)
            .map(|entry| *entry.key())
            .collect();

        for task_id in task_ids {
            if let Some((_, pending)) = self.pending.remove(&task_id) {
                warn!(task = %task_id, peer = %lost, "peer lost with task in flight");
                counter!("taskmesh.distributor.peer_lost_total", 1);
                let _ = pending.reply.send(Err(OffloadError::PeerLost(lost.clone())));
            }
        }
    }

    /// Stop waiting for a task and ask its peer to drop it. The cancel
    /// message goes out in the background.
    pub fn abandon(&self, task_id: Uuid) {
        let Some((_, pending)) = self.pending.remove(&task_id) else {
            return;
        };

        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(e) = transport
                .send(&pending.peer_id, PeerMessage::TaskCancel { task_id })
                .await
            {
                debug!(task = %task_id, peer = %pending.peer_id, error = %e, "cancel message not delivered");
            }
        });
    }

    /// Offloads currently waiting on `peer_id`.
    pub fn in_flight(&self, peer_id: &str) -> usize {
        self.pending.iter().filter(|p| p.peer_id == peer_id).count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }
}
