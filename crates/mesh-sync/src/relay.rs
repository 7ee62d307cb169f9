//! Relay (tracker) client
//!
//! A single outbound WebSocket to the relay. On connect it joins the node's
//! network and flushes anything queued while offline. Lost connections are
//! retried with exponential backoff until `max_attempts` consecutive
//! failures, after which the node carries on peer-to-peer only.

use crate::message::RelayMessage;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message, WebSocketStream};

/// Overall connectivity as reported by status endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    FullyConnected,
    P2pOnly,
    TrackerOnly,
    Offline,
}

impl ConnectionStatus {
    pub fn from_parts(relay_connected: bool, peers: usize) -> Self {
        match (relay_connected, peers > 0) {
            (true, true) => ConnectionStatus::FullyConnected,
            (false, true) => ConnectionStatus::P2pOnly,
            (true, false) => ConnectionStatus::TrackerOnly,
            (false, false) => ConnectionStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// `ws://` address of the relay, `None` disables it
    pub url: Option<String>,
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    /// Messages buffered while offline, oldest dropped first
    pub queue_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: None,
            base_delay_ms: 5_000,
            max_attempts: 5,
            queue_limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connected,
    Disconnected,
    Message(RelayMessage),
    /// Reconnect attempts exhausted
    GaveUp,
}

pub type RelayEventSender = mpsc::UnboundedSender<RelayEvent>;
pub type RelayEventReceiver = mpsc::UnboundedReceiver<RelayEvent>;

/// Delay before reconnect attempt `attempt` (1-based)
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exp))
}

/// Cheap handle the node uses to talk to the relay
#[derive(Clone)]
pub struct RelayHandle {
    outbound: Option<mpsc::UnboundedSender<RelayMessage>>,
    connected: Arc<AtomicBool>,
    /// Messages waiting for the relay to come back
    queued: Arc<AtomicUsize>,
}

impl RelayHandle {
    /// No relay configured
    pub fn disabled() -> Self {
        Self {
            outbound: None,
            connected: Arc::new(AtomicBool::new(false)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Handle wired straight to a receiver, reported as connected
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            outbound: Some(tx),
            connected: Arc::new(AtomicBool::new(true)),
            queued: Arc::new(AtomicUsize::new(0)),
        };
        (handle, rx)
    }

    /// Start the connection task, returns a disabled handle when no url is set
    pub fn spawn(config: RelayConfig, network_id: String, events: RelayEventSender) -> Self {
        let Some(url) = config.url.clone() else {
            tracing::info!("No relay configured, running peer-to-peer only");
            return Self::disabled();
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let queued = Arc::new(AtomicUsize::new(0));
        let link = Link {
            connected: connected.clone(),
            queued: queued.clone(),
            events,
        };
        tokio::spawn(connection_loop(url, config, network_id, rx, link));

        Self {
            outbound: Some(tx),
            connected,
            queued,
        }
    }

    /// Queue a message for the relay, false when there is no relay
    pub fn send(&self, message: RelayMessage) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.outbound.is_some()
    }

    /// Outbound messages held while the relay is unreachable
    pub fn pending_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

/// State the connection task shares with its handle
struct Link {
    connected: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
    events: RelayEventSender,
}

impl Link {
    fn set_queued(&self, pending: &VecDeque<RelayMessage>) {
        self.queued.store(pending.len(), Ordering::SeqCst);
    }
}

fn enqueue(pending: &mut VecDeque<RelayMessage>, message: RelayMessage, limit: usize) {
    if pending.len() >= limit {
        pending.pop_front();
        tracing::warn!("Relay queue full, dropping oldest message");
    }
    pending.push_back(message);
}

enum SessionEnd {
    Dropped,
    Shutdown,
}

async fn connection_loop(
    url: String,
    config: RelayConfig,
    network_id: String,
    mut outbound: mpsc::UnboundedReceiver<RelayMessage>,
    link: Link,
) {
    let mut pending = VecDeque::new();
    let mut attempts = 0u32;

    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                attempts = 0;
                tracing::info!("Connected to relay at {}", url);
                link.connected.store(true, Ordering::SeqCst);
                let _ = link.events.send(RelayEvent::Connected);

                let end = session(ws, &network_id, &mut outbound, &mut pending, &link).await;

                link.connected.store(false, Ordering::SeqCst);
                let _ = link.events.send(RelayEvent::Disconnected);
                if let SessionEnd::Shutdown = end {
                    return;
                }
                tracing::warn!("Relay connection lost");
            }
            Err(e) => tracing::warn!("Relay connection to {} failed: {}", url, e),
        }

        attempts += 1;
        if attempts > config.max_attempts {
            tracing::error!("Giving up on relay after {} attempts", config.max_attempts);
            let _ = link.events.send(RelayEvent::GaveUp);
            return;
        }

        let delay = backoff_delay(config.base_delay_ms, attempts);
        tracing::info!("Reconnecting to relay in {:?} (attempt {})", delay, attempts);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                message = outbound.recv() => match message {
                    Some(message) => {
                        enqueue(&mut pending, message, config.queue_limit);
                        link.set_queued(&pending);
                    }
                    None => return,
                },
            }
        }
    }
}

async fn session<S>(
    ws: WebSocketStream<S>,
    network_id: &str,
    outbound: &mut mpsc::UnboundedReceiver<RelayMessage>,
    pending: &mut VecDeque<RelayMessage>,
    link: &Link,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let join = RelayMessage::JoinNetwork {
        network_id: network_id.to_string(),
    };
    if write(&mut sink, &join).await.is_err() {
        return SessionEnd::Dropped;
    }

    if !pending.is_empty() {
        tracing::info!("Flushing {} queued relay messages", pending.len());
    }
    while let Some(message) = pending.pop_front() {
        if write(&mut sink, &message).await.is_err() {
            pending.push_front(message);
            link.set_queued(pending);
            return SessionEnd::Dropped;
        }
    }
    link.set_queued(pending);

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if write(&mut sink, &message).await.is_err() {
                        pending.push_front(message);
                        link.set_queued(pending);
                        return SessionEnd::Dropped;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match RelayMessage::from_json(&text) {
                    Ok(RelayMessage::Unknown) => {}
                    Ok(message) => {
                        let _ = link.events.send(RelayEvent::Message(message));
                    }
                    Err(e) => tracing::warn!("Malformed relay message: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                Some(Err(e)) => {
                    tracing::warn!("Relay socket error: {}", e);
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn write<K>(sink: &mut K, message: &RelayMessage) -> Result<(), tungstenite::Error>
where
    K: futures::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match message.to_json() {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            tracing::error!("Failed to encode relay message: {}", e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::Transaction;
    use tokio::net::TcpListener;

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay(5_000, 1), Duration::from_millis(5_000));
        assert_eq!(backoff_delay(5_000, 2), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(5_000, 5), Duration::from_millis(80_000));
    }

    #[test]
    fn test_connection_status() {
        assert_eq!(ConnectionStatus::from_parts(true, 2), ConnectionStatus::FullyConnected);
        assert_eq!(ConnectionStatus::from_parts(false, 1), ConnectionStatus::P2pOnly);
        assert_eq!(ConnectionStatus::from_parts(true, 0), ConnectionStatus::TrackerOnly);
        assert_eq!(ConnectionStatus::from_parts(false, 0), ConnectionStatus::Offline);
    }

    #[test]
    fn test_queue_drops_oldest() {
        let mut pending = VecDeque::new();
        for i in 0..3 {
            let net = RelayMessage::JoinNetwork {
                network_id: format!("n{}", i),
            };
            enqueue(&mut pending, net, 2);
        }
        assert_eq!(pending.len(), 2);
        assert_eq!(
            pending.front(),
            Some(&RelayMessage::JoinNetwork {
                network_id: "n1".into()
            })
        );
    }

    #[test]
    fn test_disabled_handle() {
        let relay = RelayHandle::disabled();
        assert!(!relay.is_enabled());
        assert!(!relay.is_connected());
        assert!(!relay.send(RelayMessage::Unknown));
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = RelayConfig {
            url: Some("ws://127.0.0.1:1".into()),
            base_delay_ms: 5,
            max_attempts: 2,
            queue_limit: 10,
        };
        let relay = RelayHandle::spawn(config, "net".into(), tx);
        assert!(relay.is_enabled());

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert_eq!(event, Some(RelayEvent::GaveUp));
        assert!(!relay.is_connected());
    }

    #[tokio::test]
    async fn test_joins_then_flushes_and_receives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut received = Vec::new();
            while received.len() < 2 {
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    received.push(RelayMessage::from_json(&text).unwrap());
                }
            }
            let peers = RelayMessage::Peers {
                peers: vec!["127.0.0.1:9000".into()],
            };
            ws.send(Message::Text(peers.to_json().unwrap())).await.unwrap();
            // keep the socket open until the client has read
            tokio::time::sleep(Duration::from_millis(500)).await;
            received
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = RelayConfig {
            url: Some(format!("ws://{}", addr)),
            ..RelayConfig::default()
        };
        let relay = RelayHandle::spawn(config, "net".into(), tx);
        let queued = RelayMessage::Transaction {
            transaction: Transaction::message("hi", "a"),
        };
        assert!(relay.send(queued.clone()));

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(first, Some(RelayEvent::Connected));
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(
            second,
            Some(RelayEvent::Message(RelayMessage::Peers {
                peers: vec!["127.0.0.1:9000".into()]
            }))
        );

        let received = server.await.unwrap();
        assert_eq!(
            received[0],
            RelayMessage::JoinNetwork {
                network_id: "net".into()
            }
        );
        assert_eq!(received[1], queued);
    }
}
