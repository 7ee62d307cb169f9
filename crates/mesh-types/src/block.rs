//! Ledger blocks

use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

/// Hash of the genesis block and its (nonexistent) parent
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A batch of transactions appended to the chain by the current leader
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Position in the chain, genesis is 0
    pub height: u64,
    /// Hex blake3 digest of the header fields
    pub hash: String,
    /// Hash of the block at `height - 1`
    pub prev_hash: String,
    /// Unix millis when the block was mined
    pub timestamp: u64,
    /// Transactions in insertion order
    pub transactions: Vec<Transaction>,
    /// Node that mined the block
    pub miner_id: String,
    pub nonce: u64,
}

impl Block {
    /// The fixed genesis block, identical on every peer
    pub fn genesis() -> Self {
        Self {
            height: 0,
            hash: GENESIS_HASH.to_string(),
            prev_hash: GENESIS_HASH.to_string(),
            timestamp: 0,
            transactions: Vec::new(),
            miner_id: "genesis".to_string(),
            nonce: 0,
        }
    }

    /// Build the successor of `parent` holding `transactions`
    pub fn next(
        parent: &Block,
        transactions: Vec<Transaction>,
        miner_id: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        let mut block = Self {
            height: parent.height + 1,
            hash: String::new(),
            prev_hash: parent.hash.clone(),
            timestamp,
            transactions,
            miner_id: miner_id.into(),
            nonce: 0,
        };
        block.hash = block.compute_hash();
        block
    }

    /// Digest over the header and the transaction ids
    pub fn compute_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.height.to_le_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(self.miner_id.as_bytes());
        hasher.update(&self.nonce.to_le_bytes());
        for tx in &self.transactions {
            hasher.update(tx.id.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Whether this block links directly onto `tip`
    pub fn extends(&self, tip: &Block) -> bool {
        self.height == tip.height + 1 && self.prev_hash == tip.hash
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }
}
