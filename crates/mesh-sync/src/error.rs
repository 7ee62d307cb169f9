//! Sync, transport and API errors

use mesh_exchange::ExchangeError;
use mesh_ledger::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Channel to {0} is closed")]
    ChannelClosed(String),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Node has stopped")]
    Stopped,

    #[error("Order {0} was already applied")]
    DuplicateOrder(String),

    #[error("Order rejected: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// JSON-RPC errors
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),
}

impl From<NodeError> for RpcError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Exchange(e) => RpcError::InvalidParams(e.to_string()),
            NodeError::DuplicateOrder(id) => RpcError::InvalidParams(format!("duplicate order {}", id)),
            other => RpcError::InternalError(other.to_string()),
        }
    }
}
