//! Peer transport abstraction
//!
//! The node only needs to send to one peer, broadcast to all, and receive.
//! Inbound traffic and connection changes arrive as [`TransportEvent`]s on an
//! unbounded channel handed out when the transport is created.

use crate::error::TransportError;
use crate::message::PeerMessage;
use dashmap::{DashMap, DashSet};
use mesh_types::NodeId;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PeerConnected(NodeId),
    PeerDisconnected(NodeId),
    Message { from: NodeId, message: PeerMessage },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub trait Transport: Send + Sync {
    /// Send to a single connected peer
    fn send(&self, peer: &str, message: &PeerMessage) -> Result<(), TransportError>;

    /// Send to every connected peer except `except`, returns how many got it
    fn broadcast(&self, message: &PeerMessage, except: Option<&str>) -> usize {
        let mut delivered = 0;
        for peer in self.connected_peers() {
            if Some(peer.as_str()) == except {
                continue;
            }
            match self.send(&peer, message) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("Broadcast of {} to {} failed: {}", message.kind(), peer, e),
            }
        }
        delivered
    }

    fn connected_peers(&self) -> Vec<NodeId>;

    fn peer_count(&self) -> usize {
        self.connected_peers().len()
    }

    /// Ask the transport to dial `address`, no-op where addresses mean nothing
    fn connect(&self, _address: &str) {}

    /// Network announced to new peers after a switch
    fn set_network(&self, _network_id: &str) {}
}

/// In-process switchboard connecting every joined node to every other.
///
/// Links can be cut and restored to simulate partitions.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    nodes: DashMap<NodeId, EventSender>,
    /// Cut links, stored as ordered pairs
    cut: DashSet<(NodeId, NodeId)>,
}

impl HubInner {
    fn link_key(a: &str, b: &str) -> (NodeId, NodeId) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    fn linked(&self, a: &str, b: &str) -> bool {
        a != b && !self.cut.contains(&Self::link_key(a, b))
    }

    fn notify(&self, node: &str, event: TransportEvent) {
        if let Some(tx) = self.nodes.get(node) {
            let _ = tx.send(event);
        }
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node and connect it to everyone already attached
    pub fn join(&self, node_id: &str) -> (MemoryTransport, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let existing: Vec<NodeId> = self.inner.nodes.iter().map(|e| e.key().clone()).collect();
        self.inner.nodes.insert(node_id.to_string(), tx);

        for peer in existing {
            if self.inner.linked(node_id, &peer) {
                self.inner
                    .notify(&peer, TransportEvent::PeerConnected(node_id.to_string()));
                self.inner.notify(node_id, TransportEvent::PeerConnected(peer));
            }
        }

        let transport = MemoryTransport {
            node_id: node_id.to_string(),
            hub: self.inner.clone(),
        };
        (transport, rx)
    }

    /// Detach a node, its peers see it disconnect
    pub fn leave(&self, node_id: &str) {
        if self.inner.nodes.remove(node_id).is_none() {
            return;
        }
        let peers: Vec<NodeId> = self.inner.nodes.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            if self.inner.linked(node_id, &peer) {
                self.inner
                    .notify(&peer, TransportEvent::PeerDisconnected(node_id.to_string()));
            }
        }
    }

    /// Cut the link between two nodes
    pub fn partition(&self, a: &str, b: &str) {
        if self.inner.cut.insert(HubInner::link_key(a, b)) {
            self.inner.notify(a, TransportEvent::PeerDisconnected(b.to_string()));
            self.inner.notify(b, TransportEvent::PeerDisconnected(a.to_string()));
        }
    }

    /// Restore a cut link
    pub fn heal(&self, a: &str, b: &str) {
        if self.inner.cut.remove(&HubInner::link_key(a, b)).is_some() {
            self.inner.notify(a, TransportEvent::PeerConnected(b.to_string()));
            self.inner.notify(b, TransportEvent::PeerConnected(a.to_string()));
        }
    }
}

pub struct MemoryTransport {
    node_id: NodeId,
    hub: Arc<HubInner>,
}

impl Transport for MemoryTransport {
    fn send(&self, peer: &str, message: &PeerMessage) -> Result<(), TransportError> {
        if !self.hub.linked(&self.node_id, peer) {
            return Err(TransportError::UnknownPeer(peer.to_string()));
        }
        let tx = self
            .hub
            .nodes
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
        tx.send(TransportEvent::Message {
            from: self.node_id.clone(),
            message: message.clone(),
        })
        .map_err(|_| TransportError::ChannelClosed(peer.to_string()))
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.hub
            .nodes
            .iter()
            .map(|e| e.key().clone())
            .filter(|peer| self.hub.linked(&self.node_id, peer))
            .collect()
    }
}
