//! Ledger storage errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metadata encoding error: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
