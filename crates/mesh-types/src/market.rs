//! Orders and trades

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// A resting order in the book
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub side: Side,
    pub asset: String,
    /// Remaining quantity, fixed point
    pub quantity: u64,
    /// Limit price, fixed point
    pub price: u64,
    pub trader: String,
    pub created_at: u64,
}

/// An executed trade, immutable once recorded
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Trade {
    pub id: String,
    pub asset: String,
    pub quantity: u64,
    pub price: u64,
    pub buyer: String,
    pub seller: String,
    pub timestamp: u64,
    /// Settled on the enterprise ledger rather than matched locally
    #[serde(default)]
    pub cross_network: bool,
}
