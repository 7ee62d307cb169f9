//! WebSocket peer transport
//!
//! Every node listens for peers and dials the addresses it is given. Both
//! sides open with a `hello` frame naming their node and network; peers on
//! another network are dropped. When two nodes dial each other at once, the
//! connection dialed by the lower node id wins on both ends, and the loser
//! is closed from both sides.

use crate::error::TransportError;
use crate::message::PeerMessage;
use crate::transport::{EventReceiver, EventSender, Transport, TransportEvent};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use mesh_types::NodeId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message, WebSocketStream};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<WsInner>,
}

struct PeerLink {
    conn_id: u64,
    outbound: bool,
    tx: mpsc::UnboundedSender<String>,
    /// Fired when another connection to the same peer replaces this one
    shutdown: oneshot::Sender<()>,
}

struct WsInner {
    node_id: NodeId,
    network_id: RwLock<String>,
    /// Live peers by node id
    peers: DashMap<NodeId, PeerLink>,
    /// Addresses with a dial in flight or connected
    dialing: DashSet<String>,
    next_conn_id: AtomicU64,
    /// Registered connections still running their read loop
    open: AtomicUsize,
    events: EventSender,
}

impl WsTransport {
    pub fn new(node_id: impl Into<String>, network_id: impl Into<String>) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(WsInner {
                node_id: node_id.into(),
                network_id: RwLock::new(network_id.into()),
                peers: DashMap::new(),
                dialing: DashSet::new(),
                next_conn_id: AtomicU64::new(1),
                open: AtomicUsize::new(0),
                events,
            }),
        };
        (transport, rx)
    }

    /// Start accepting peer connections, returns the bound address
    pub async fn listen(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!("Peer transport listening on {}", local);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!("Inbound peer connection from {}", peer_addr);
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws) => {
                                    if let Err(e) = run_connection(inner, ws, false).await {
                                        tracing::warn!("Peer connection from {} failed: {}", peer_addr, e);
                                    }
                                }
                                Err(e) => tracing::warn!("WebSocket upgrade from {} failed: {}", peer_addr, e),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY).await;
                    }
                }
            }
        });

        Ok(local)
    }

    /// Dial a peer in the background
    pub fn dial(&self, address: &str) {
        let url = if address.starts_with("ws://") || address.starts_with("wss://") {
            address.to_string()
        } else {
            format!("ws://{}", address)
        };
        if !self.inner.dialing.insert(url.clone()) {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    tracing::debug!("Connected to peer at {}", url);
                    if let Err(e) = run_connection(inner.clone(), ws, true).await {
                        tracing::warn!("Peer connection to {} failed: {}", url, e);
                    }
                }
                Err(e) => tracing::warn!("Failed to dial {}: {}", url, e),
            }
            inner.dialing.remove(&url);
        });
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Peer sockets currently open, including ones being torn down
    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }
}

impl Transport for WsTransport {
    fn send(&self, peer: &str, message: &PeerMessage) -> Result<(), TransportError> {
        let text = message.to_json()?;
        let failed = match self.inner.peers.get(peer) {
            Some(link) => link.tx.send(text).is_err().then_some(link.conn_id),
            None => return Err(TransportError::UnknownPeer(peer.to_string())),
        };
        match failed {
            None => Ok(()),
            Some(conn_id) => {
                // Writer is gone, drop the dead channel
                self.inner.drop_peer(peer, conn_id);
                Err(TransportError::ChannelClosed(peer.to_string()))
            }
        }
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.inner.peers.iter().map(|e| e.key().clone()).collect()
    }

    fn connect(&self, address: &str) {
        self.dial(address);
    }

    fn set_network(&self, network_id: &str) {
        *self.inner.network_id.write() = network_id.to_string();
    }
}

impl WsInner {
    /// Remove `peer` if `conn_id` is still its live connection
    fn drop_peer(&self, peer: &str, conn_id: u64) {
        if self
            .peers
            .remove_if(peer, |_, link| link.conn_id == conn_id)
            .is_some()
        {
            tracing::info!("Peer {} disconnected", peer);
            let _ = self.events.send(TransportEvent::PeerDisconnected(peer.to_string()));
        }
    }

    /// Whether a new connection should replace an existing one to `peer`
    fn prefers(&self, peer: &str, outbound: bool) -> bool {
        let dialer_is_self = outbound;
        let self_is_lower = self.node_id.as_str() < peer;
        dialer_is_self == self_is_lower
    }
}

async fn run_connection<S>(inner: Arc<WsInner>, ws: WebSocketStream<S>, outbound: bool) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let network_id = inner.network_id.read().clone();

    let hello = PeerMessage::Hello {
        node_id: inner.node_id.clone(),
        network_id: network_id.clone(),
    };
    sink.send(Message::Text(hello.to_json()?)).await?;

    let (peer_id, peer_network) = match tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(frame) = stream.next().await {
            match frame? {
                Message::Text(text) => match PeerMessage::from_json(&text) {
                    Ok(PeerMessage::Hello { node_id, network_id: net }) => return Ok(Some((node_id, net))),
                    Ok(other) => tracing::debug!("Expected hello, got {}", other.kind()),
                    Err(e) => tracing::debug!("Malformed handshake frame: {}", e),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok::<_, anyhow::Error>(None)
    })
    .await
    {
        Ok(Ok(Some(hello))) => hello,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => anyhow::bail!("handshake timed out"),
    };

    if peer_network != network_id {
        tracing::warn!(
            "Dropping peer {} from network {} (we are on {})",
            peer_id,
            peer_network,
            network_id
        );
        let _ = sink.send(Message::Close(None)).await;
        return Ok(());
    }
    if peer_id == inner.node_id {
        let _ = sink.send(Message::Close(None)).await;
        return Ok(());
    }

    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (shutdown, mut superseded) = oneshot::channel();
    let link = PeerLink {
        conn_id,
        outbound,
        tx,
        shutdown,
    };

    // None means an existing connection wins and this one is dropped
    let fresh = match inner.peers.entry(peer_id.clone()) {
        Entry::Vacant(slot) => {
            slot.insert(link);
            Some(true)
        }
        Entry::Occupied(mut slot) => {
            if slot.get().outbound != outbound && inner.prefers(&peer_id, outbound) {
                let old = slot.insert(link);
                let _ = old.shutdown.send(());
                Some(false)
            } else {
                None
            }
        }
    };
    let Some(fresh) = fresh else {
        tracing::debug!("Duplicate connection to {}, keeping the existing one", peer_id);
        let _ = sink.send(Message::Close(None)).await;
        return Ok(());
    };

    if fresh {
        tracing::info!("Peer {} connected", peer_id);
        let _ = inner.events.send(TransportEvent::PeerConnected(peer_id.clone()));
    }

    inner.open.fetch_add(1, Ordering::SeqCst);

    // Ends once the link leaves the peer map and its sender is dropped
    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            // Fires on replacement, or when the link leaves the map
            _ = &mut superseded => {
                tracing::debug!("Connection {} to {} superseded", conn_id, peer_id);
                break;
            }
        };
        let Some(frame) = frame else {
            break;
        };
        match frame {
            Ok(Message::Text(text)) => match PeerMessage::from_json(&text) {
                Ok(message) => {
                    let _ = inner.events.send(TransportEvent::Message {
                        from: peer_id.clone(),
                        message,
                    });
                }
                Err(e) => tracing::warn!("Dropping malformed message from {}: {}", peer_id, e),
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error from {}: {}", peer_id, e);
                break;
            }
            _ => {}
        }
    }

    inner.drop_peer(&peer_id, conn_id);
    if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    inner.open.fetch_sub(1, Ordering::SeqCst);
    Ok(())
}
