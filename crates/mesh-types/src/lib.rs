//! Shared types for the mesh ledger
//!
//! Every crate in the workspace speaks these types:
//! - [`Block`] and [`Transaction`] for the append-only ledger
//! - [`Order`] and [`Trade`] for the exchange
//! - fixed-point helpers (two implied decimals) and id/time helpers

pub mod block;
pub mod market;
pub mod transaction;

pub use block::Block;
pub use market::{Order, Side, Trade};
pub use transaction::{
    CrossNetworkTradeNotice, OrderCall, OrderFunction, Transaction, TransactionKind,
    TradeExecution, TRADING_CONTRACT_ID,
};

use rand::Rng;

/// Identifier of a peer (browser user or native node)
pub type NodeId = String;

/// Globally unique transaction identifier
pub type TxId = String;

/// Quantities and prices carry two implied decimal places
pub const FIXED_POINT_SCALE: u64 = 100;

/// Wall clock in unix milliseconds
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Build an id of the form `<prefix>_<millis>_<random suffix>`.
///
/// Uniqueness across peers relies on the 9-character random suffix.
pub fn unique_id(prefix: &str) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{}_{}_{}", prefix, now_millis(), suffix)
}

/// Render a fixed-point value for display, e.g. `1050` -> `"10.50"`
pub fn format_fixed(value: u64) -> String {
    format!("{}.{:02}", value / FIXED_POINT_SCALE, value % FIXED_POINT_SCALE)
}

/// First eight characters of an id, for log lines
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
