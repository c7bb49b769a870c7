use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::serde_helpers::duration_ms;
use crate::engine::task::{PeerId, TaskKind};

/// A remote execution target as reported by the membership layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub connected: bool,
    pub capabilities: HashSet<TaskKind>,
    #[serde(with = "duration_ms")]
    pub round_trip_estimate: Duration,
}

impl Peer {
    pub fn new(id: impl Into<PeerId>, capabilities: impl IntoIterator<Item = TaskKind>, round_trip_estimate: Duration) -> Self {
        Self {
            id: id.into(),
            connected: true,
            capabilities: capabilities.into_iter().collect(),
            round_trip_estimate,
        }
    }

    pub fn supports(&self, kind: TaskKind) -> bool {
        self.capabilities.contains(&kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    PeerRemoved(PeerId),
}

impl fmt::Display for MembershipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipEvent::PeerConnected(id) => write!(f, "peer {} connected", id),
            MembershipEvent::PeerDisconnected(id) => write!(f, "peer {} disconnected", id),
            MembershipEvent::PeerRemoved(id) => write!(f, "peer {} removed", id),
        }
    }
}

/// Thread-safe peer table.
///
/// Written by the membership layer; the scheduler side only reads it and
/// listens to the change feed. Every subscriber gets its own copy of each
/// event.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: DashMap<PeerId, Peer>,
    subscribers: DashMap<usize, flume::Sender<MembershipEvent>>,
    next_subscriber: AtomicUsize,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscriber: AtomicUsize::new(0),
        }
    }

    /// Register a new peer or replace an existing record.
    pub fn upsert(&self, peer: Peer) {
        let id = peer.id.clone();
        let connected = peer.connected;
        let previous = self.peers.insert(id.clone(), peer);
        let was_connected = previous.map_or(false, |p| p.connected);

        info!(peer = %id, connected, "peer registered");
        self.emit_transition(&id, was_connected, connected);
        metrics::gauge!("taskmesh.peers.connected", self.connected_count() as f64);
    }

    /// Flip a peer's connection state. Returns false for unknown peers.
    pub fn set_connected(&self, id: &str, connected: bool) -> bool {
        let was_connected = match self.peers.get_mut(id) {
            Some(mut peer) => {
                let was = peer.connected;
                peer.connected = connected;
                was
            }
            None => return false,
        };

        self.emit_transition(id, was_connected, connected);
        metrics::gauge!("taskmesh.peers.connected", self.connected_count() as f64);
        true
    }

    pub fn update_round_trip(&self, id: &str, estimate: Duration) -> bool {
        match self.peers.get_mut(id) {
            Some(mut peer) => {
                peer.round_trip_estimate = estimate;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<Peer> {
        let (_, peer) = self.peers.remove(id)?;
        debug!(peer = id, "peer removed");
        self.publish(MembershipEvent::PeerRemoved(id.to_string()));
        metrics::gauge!("taskmesh.peers.connected", self.connected_count() as f64);
        Some(peer)
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers.get(id).map(|p| p.value().clone())
    }

    pub fn connected_peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|p| p.connected)
            .map(|p| p.value().clone())
            .collect()
    }

    pub fn all_peers(&self) -> Vec<Peer> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.iter().filter(|p| p.connected).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Change feed starting from the next event. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> flume::Receiver<MembershipEvent> {
        let (tx, rx) = flume::unbounded();
        let key = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(key, tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn publish(&self, event: MembershipEvent) {
        self.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn emit_transition(&self, id: &str, was_connected: bool, connected: bool) {
        let event = match (was_connected, connected) {
            (false, true) => MembershipEvent::PeerConnected(id.to_string()),
            (true, false) => MembershipEvent::PeerDisconnected(id.to_string()),
            _ => return,
        };
        debug!(%event, "membership change");
        self.publish(event);
    }
}
