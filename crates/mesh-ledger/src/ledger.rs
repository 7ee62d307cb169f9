//! Block ledger and pending pool

use mesh_types::{short_id, Block, Transaction, TransactionKind, TxId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Full-state dump of a ledger.
///
/// Restoring replaces in-memory state wholesale, chain linkage is not
/// re-validated.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub chain: Vec<Block>,
    pub pending: Vec<Transaction>,
    #[serde(default)]
    pub contract_state: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub processed_transaction_ids: Vec<TxId>,
    /// Filled in by the node from its election state
    #[serde(default)]
    pub leadership_term: u64,
    /// Opaque order book state owned by the exchange
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_book: Option<serde_json::Value>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct LedgerStats {
    pub height: u64,
    pub chain_length: usize,
    pub pending_transactions: usize,
    pub processed_transactions: usize,
    pub blocks_mined: u64,
    pub blocks_accepted: u64,
    pub blocks_rejected: u64,
    pub duplicates_dropped: u64,
}

/// Append-only chain with a batched pending pool
pub struct Ledger {
    /// Node that signs mined blocks
    node_id: String,
    /// Blocks from genesis to tip, never branches
    chain: Vec<Block>,
    /// Accepted transactions awaiting the next block
    pending: Vec<Transaction>,
    /// Every id seen in the pool or in any block
    processed_ids: HashSet<TxId>,
    /// Latest state per contract id
    contract_state: HashMap<String, serde_json::Value>,
    /// Validator stake, informational only
    validators: HashMap<String, u64>,
    /// Flipped by leader election, sole gate for mining
    mining_authorized: bool,
    stats: LedgerStats,
}

impl Ledger {
    /// Create a ledger holding only the genesis block
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            chain: vec![Block::genesis()],
            pending: Vec::new(),
            processed_ids: HashSet::new(),
            contract_state: HashMap::new(),
            validators: HashMap::new(),
            mining_authorized: false,
            stats: LedgerStats::default(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Grant or revoke the right to mine
    pub fn set_mining_authorized(&mut self, authorized: bool) {
        if self.mining_authorized != authorized {
            tracing::debug!("Mining authorization for {} -> {}", self.node_id, authorized);
        }
        self.mining_authorized = authorized;
    }

    pub fn mining_authorized(&self) -> bool {
        self.mining_authorized
    }

    /// Queue a chat message from `sender`, returns the new transaction id
    pub fn add_message(&mut self, content: &str, sender: &str) -> Option<TxId> {
        let tx = Transaction::message(content, sender);
        let id = tx.id.clone();
        if self.enqueue(tx) {
            Some(id)
        } else {
            None
        }
    }

    /// Queue a transaction created on this node
    pub fn add_transaction(&mut self, tx: Transaction) -> bool {
        self.enqueue(tx)
    }

    /// Queue a transaction relayed by a peer.
    ///
    /// Returns false for any id already in the pool, in a block, or
    /// previously processed.
    pub fn add_transaction_from_peer(&mut self, tx: Transaction) -> bool {
        self.enqueue(tx)
    }

    fn enqueue(&mut self, tx: Transaction) -> bool {
        if self.contains(&tx.id) {
            self.stats.duplicates_dropped += 1;
            tracing::debug!("Dropping duplicate transaction {}", tx.id);
            return false;
        }

        self.apply_side_effects(&tx);
        self.processed_ids.insert(tx.id.clone());
        tracing::debug!("Queued {} transaction {}", tx.kind_name(), tx.id);
        self.pending.push(tx);
        true
    }

    /// Whether `id` has been seen anywhere on this ledger
    pub fn contains(&self, id: &str) -> bool {
        // Covers the pool and every block, see enqueue/add_block/restore
        self.processed_ids.contains(id)
    }

    /// Package the whole pending pool into a new block.
    ///
    /// No-op unless this node is authorized and the pool is non-empty.
    pub fn mine_block(&mut self, now_ms: u64) -> Option<Block> {
        if !self.mining_authorized {
            tracing::debug!("Mining rejected: {} is not the leader", self.node_id);
            return None;
        }
        if self.pending.is_empty() {
            return None;
        }

        let transactions = std::mem::take(&mut self.pending);
        let block = Block::next(self.tip(), transactions, self.node_id.clone(), now_ms);
        self.chain.push(block.clone());
        self.stats.blocks_mined += 1;

        tracing::info!(
            "Mined block {} ({} txs, hash {})",
            block.height,
            block.transactions.len(),
            short_id(&block.hash)
        );

        Some(block)
    }

    /// Append a block mined elsewhere if it links onto the tip
    pub fn add_block(&mut self, block: Block) -> bool {
        if !block.extends(self.tip()) {
            self.stats.blocks_rejected += 1;
            tracing::debug!(
                "Rejected block {} from {}: tip is {} ({})",
                block.height,
                block.miner_id,
                self.tip().height,
                short_id(&self.tip().hash)
            );
            return false;
        }

        let mut included = HashSet::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            self.apply_side_effects(tx);
            self.processed_ids.insert(tx.id.clone());
            included.insert(tx.id.as_str());
        }
        self.pending.retain(|tx| !included.contains(tx.id.as_str()));

        tracing::info!(
            "Accepted block {} from {} ({} txs)",
            block.height,
            block.miner_id,
            block.transactions.len()
        );

        self.stats.blocks_accepted += 1;
        self.chain.push(block);
        true
    }

    fn apply_side_effects(&mut self, tx: &Transaction) {
        if let TransactionKind::OrderCall(call) = &tx.kind {
            if let Some(changes) = &call.state_changes {
                self.contract_state
                    .insert(call.contract_id.clone(), changes.clone());
            }
        }
    }

    fn tip(&self) -> &Block {
        // The chain always holds at least genesis
        &self.chain[self.chain.len() - 1]
    }

    pub fn latest_block(&self) -> &Block {
        self.tip()
    }

    pub fn height(&self) -> u64 {
        self.tip().height
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn pending(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn block_at(&self, height: u64) -> Option<&Block> {
        self.chain.get(height as usize)
    }

    pub fn contract_state(&self, contract_id: &str) -> Option<&serde_json::Value> {
        self.contract_state.get(contract_id)
    }

    /// Register or update a validator's stake
    pub fn add_validator(&mut self, address: impl Into<String>, stake: u64) {
        let address = address.into();
        tracing::info!("Validator {} staked {}", address, stake);
        self.validators.insert(address, stake);
    }

    pub fn total_stake(&self) -> u64 {
        self.validators.values().sum()
    }

    /// Share of total stake held by `address`, in `0.0..=1.0`
    pub fn vote_weight(&self, address: &str) -> f64 {
        let total = self.total_stake();
        match self.validators.get(address) {
            Some(stake) if total > 0 => *stake as f64 / total as f64,
            _ => 0.0,
        }
    }

    pub fn stats(&self) -> LedgerStats {
        let mut stats = self.stats.clone();
        stats.height = self.height();
        stats.chain_length = self.chain.len();
        stats.pending_transactions = self.pending.len();
        stats.processed_transactions = self.processed_ids.len();
        stats
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut processed: Vec<TxId> = self.processed_ids.iter().cloned().collect();
        processed.sort();
        LedgerSnapshot {
            chain: self.chain.clone(),
            pending: self.pending.clone(),
            contract_state: self.contract_state.clone(),
            processed_transaction_ids: processed,
            leadership_term: 0,
            order_book: None,
        }
    }

    /// Replace in-memory state with `snapshot`
    pub fn restore(&mut self, snapshot: LedgerSnapshot) {
        let LedgerSnapshot {
            chain,
            pending,
            contract_state,
            processed_transaction_ids,
            ..
        } = snapshot;

        self.chain = if chain.is_empty() {
            vec![Block::genesis()]
        } else {
            chain
        };
        self.pending = pending;
        self.contract_state = contract_state;
        self.processed_ids = processed_transaction_ids.into_iter().collect();

        // Keep the dedup set a superset of everything we hold
        for block in &self.chain {
            for tx in &block.transactions {
                self.processed_ids.insert(tx.id.clone());
            }
        }
        for tx in &self.pending {
            self.processed_ids.insert(tx.id.clone());
        }

        tracing::info!(
            "Restored ledger at height {} with {} pending",
            self.height(),
            self.pending.len()
        );
    }
}
