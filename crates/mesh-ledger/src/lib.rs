//! Mesh ledger
//!
//! Single linear chain of blocks plus the pool of accepted-but-unmined
//! transactions. Every transaction id that ever entered the pool or a block
//! is remembered so replays from any peer are dropped.

pub mod error;
pub mod ledger;
pub mod persistence;

pub use error::{StoreError, StoreResult};
pub use ledger::{Ledger, LedgerSnapshot, LedgerStats};
pub use persistence::{SnapshotMeta, SnapshotStore};
