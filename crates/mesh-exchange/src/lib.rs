//! Mesh exchange
//!
//! Continuous double auction over per-asset bid/ask books. Orders placed
//! locally and orders replayed from mined blocks go through the same engine,
//! and trades settled on the enterprise ledger are reconciled into the book
//! without being matched a second time.

pub mod engine;
pub mod error;
pub mod reconcile;

pub use engine::{BookView, EngineSnapshot, OrderMatchingEngine, Placement, DEFAULT_TRADE_CAPACITY};
pub use error::{ExchangeError, ExchangeResult};
pub use reconcile::{EnterpriseBook, Reconciliation};
