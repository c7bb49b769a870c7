use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::executor::{CancelSignal, Executor};
use crate::engine::task::{PeerId, Task, TaskKind, TaskOptions};
use crate::utils::error::TaskError;

/// Wire form of a task shipped to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedTask {
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub payload: Vec<u8>,
    pub options: TaskOptions,
}

impl SerializedTask {
    pub fn from_task(task: &Task) -> Result<Self, TaskError> {
        Ok(Self {
            task_id: task.id(),
            kind: task.kind(),
            payload: serde_json::to_vec(task.payload())?,
            options: task.options().clone(),
        })
    }

    pub fn to_task(&self) -> Result<Task, TaskError> {
        let payload: Value = serde_json::from_slice(&self.payload)?;
        Ok(Task::restore(self.task_id, self.kind, payload, self.options.clone()))
    }
}

/// Scheduler ↔ peer protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    TaskAssignment(SerializedTask),
    TaskCancel { task_id: Uuid },
    TaskResult {
        task_id: Uuid,
        outcome: Result<Value, String>,
    },
}

/// Inbound side of a transport: `(sender peer, message)`.
pub type InboundSender = flume::Sender<(PeerId, PeerMessage)>;

#[async_trait]
pub trait PeerTransport: Send + Sync + std::fmt::Debug {
    /// Deliver a message to a peer. An error means the message did not leave.
    async fn send(&self, peer_id: &str, message: PeerMessage) -> Result<()>;

    /// Hand the transport the channel replies should be pushed into.
    fn attach(&self, inbound: InboundSender);
}

/// In-process peers for tests, demos and single-host benchmarks. Every peer
/// id it is asked to reach runs the assignment on the shared executor.
#[derive(Debug)]
pub struct LoopbackTransport {
    executor: Arc<dyn Executor>,
    inbound: OnceLock<InboundSender>,
    running: Arc<DashMap<Uuid, watch::Sender<bool>>>,
    unreachable: DashSet<PeerId>,
    silenced: Arc<DashSet<PeerId>>,
}

impl LoopbackTransport {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            inbound: OnceLock::new(),
            running: Arc::new(DashMap::new()),
            unreachable: DashSet::new(),
            silenced: Arc::new(DashSet::new()),
        }
    }

    /// Sends to this peer fail from now on.
    pub fn set_unreachable(&self, peer_id: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(peer_id.to_string());
        } else {
            self.unreachable.remove(peer_id);
        }
    }

    /// The peer keeps accepting work but its replies are dropped, as if the
    /// link died after the assignment went out.
    pub fn silence(&self, peer_id: &str) {
        self.silenced.insert(peer_id.to_string());
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn run_assignment(&self, peer_id: &str, assignment: SerializedTask) -> Result<()> {
        let inbound = self
            .inbound
            .get()
            .cloned()
            .ok_or_else(|| anyhow!("loopback transport is not attached"))?;
        let task = assignment.to_task().map_err(|e| anyhow!(e))?;
        let (cancel_tx, cancel) = CancelSignal::new();
        self.running.insert(task.id(), cancel_tx);

        let executor = Arc::clone(&self.executor);
        let running = Arc::clone(&self.running);
        let silenced = Arc::clone(&self.silenced);
        let peer_id = peer_id.to_string();

        tokio::spawn(async move {
            let outcome = executor
                .execute(&task, cancel)
                .await
                .map_err(|e| e.message);
            running.remove(&task.id());

            if silenced.contains(&peer_id) {
                debug!(peer = %peer_id, task = %task.id(), "reply dropped on silenced peer");
                return;
            }

            let reply = PeerMessage::TaskResult { task_id: task.id(), outcome };
            if inbound.send_async((peer_id, reply)).await.is_err() {
                warn!(task = %task.id(), "distributor inbound channel closed");
            }
        });

        Ok(())
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn send(&self, peer_id: &str, message: PeerMessage) -> Result<()> {
        if self.unreachable.contains(peer_id) {
            return Err(anyhow!("peer {} is unreachable", peer_id));
        }

        match message {
            PeerMessage::TaskAssignment(assignment) => self.run_assignment(peer_id, assignment),
            PeerMessage::TaskCancel { task_id } => {
                if let Some(cancel) = self.running.get(&task_id) {
                    let _ = cancel.send(true);
                }
                Ok(())
            }
            PeerMessage::TaskResult { .. } => Err(anyhow!("peers do not accept results")),
        }
    }

    fn attach(&self, inbound: InboundSender) {
        if self.inbound.set(inbound).is_err() {
            warn!("loopback transport attached twice; keeping the first channel");
        }
    }
}
