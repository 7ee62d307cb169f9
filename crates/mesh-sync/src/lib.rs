//! Mesh synchronization
//!
//! Ties the ledger, the exchange and leader election together:
//! - wire envelopes for peers and for the relay
//! - a [`Transport`] seam with in-memory and WebSocket implementations
//! - the relay client with offline queueing and backoff
//! - [`MeshNode`], the single owner of node state, and its JSON-RPC front

pub mod clock;
pub mod error;
pub mod http_server;
pub mod message;
pub mod node;
pub mod relay;
pub mod transport;
pub mod ws_transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{NodeError, RpcError, TransportError};
pub use http_server::{dispatch_method, HttpRpcServer, JsonRpcRequest, JsonRpcResponse};
pub use message::{OrderTransaction, PeerMessage, RelayMessage, SyncData};
pub use node::{MeshNode, MeshNodeConfig, NodeCommand, NodeHandle, NodeStatus};
pub use relay::{
    backoff_delay, ConnectionStatus, RelayConfig, RelayEvent, RelayEventReceiver, RelayEventSender,
    RelayHandle,
};
pub use transport::{EventReceiver, EventSender, MemoryHub, MemoryTransport, Transport, TransportEvent};
pub use ws_transport::WsTransport;
