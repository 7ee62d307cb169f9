//! Snapshot persistence
//!
//! Uses sled to keep one full-state snapshot per network across restarts.
//! The snapshot itself is JSON (the same shape peers and tooling read),
//! alongside a small bincode metadata record for quick inspection.

use crate::error::StoreResult;
use crate::ledger::LedgerSnapshot;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;

/// Summary of the last saved snapshot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotMeta {
    /// Chain height at save time
    pub height: u64,
    /// Hash of the chain tip
    pub tip_hash: String,
    /// Last save timestamp (unix seconds)
    pub saved_at: i64,
}

impl Default for SnapshotMeta {
    fn default() -> Self {
        Self {
            height: 0,
            tip_hash: mesh_types::block::GENESIS_HASH.to_string(),
            saved_at: 0,
        }
    }
}

/// Persistent storage for ledger snapshots
pub struct SnapshotStore {
    /// Sled database instance
    db: Db,
    /// Snapshot tree, keyed by network
    snapshots: sled::Tree,
    /// Metadata tree, keyed by network
    metadata: sled::Tree,
}

impl SnapshotStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(&path)?;
        let snapshots = db.open_tree("snapshots")?;
        let metadata = db.open_tree("metadata")?;

        tracing::info!("Opened snapshot store at {:?}", path.as_ref());

        Ok(Self {
            db,
            snapshots,
            metadata,
        })
    }

    fn key(network: &str) -> String {
        format!("snapshot/{}", network)
    }

    /// Save the snapshot for `network`, replacing any previous one
    pub fn save(&self, network: &str, snapshot: &LedgerSnapshot) -> StoreResult<SnapshotMeta> {
        let key = Self::key(network);
        let bytes = serde_json::to_vec(snapshot)?;
        self.snapshots.insert(key.as_bytes(), bytes)?;

        let meta = SnapshotMeta {
            height: snapshot.chain.last().map(|b| b.height).unwrap_or(0),
            tip_hash: snapshot
                .chain
                .last()
                .map(|b| b.hash.clone())
                .unwrap_or_else(|| SnapshotMeta::default().tip_hash),
            saved_at: chrono::Utc::now().timestamp(),
        };
        self.metadata
            .insert(key.as_bytes(), bincode::serialize(&meta)?)?;
        self.flush()?;

        tracing::debug!(
            "Saved snapshot for {} at height {} ({} pending)",
            network,
            meta.height,
            snapshot.pending.len()
        );

        Ok(meta)
    }

    /// Load the snapshot for `network`, if one was saved
    pub fn load(&self, network: &str) -> StoreResult<Option<LedgerSnapshot>> {
        match self.snapshots.get(Self::key(network).as_bytes())? {
            Some(bytes) => {
                let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes)?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    pub fn load_meta(&self, network: &str) -> StoreResult<Option<SnapshotMeta>> {
        match self.metadata.get(Self::key(network).as_bytes())? {
            Some(bytes) => {
                let meta: SnapshotMeta = bincode::deserialize(&bytes)?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// Drop the snapshot for `network`
    pub fn remove(&self, network: &str) -> StoreResult<()> {
        let key = Self::key(network);
        self.snapshots.remove(key.as_bytes())?;
        self.metadata.remove(key.as_bytes())?;
        Ok(())
    }

    /// Networks with a saved snapshot
    pub fn networks(&self) -> StoreResult<Vec<String>> {
        let mut networks = Vec::new();
        for result in self.snapshots.iter() {
            let (key, _) = result?;
            let key = String::from_utf8_lossy(&key);
            if let Some(network) = key.strip_prefix("snapshot/") {
                networks.push(network.to_string());
            }
        }
        Ok(networks)
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ledger;
    use mesh_types::{TradeExecution, Transaction};
    use tempfile::tempdir;

    fn populated_ledger() -> Ledger {
        let mut ledger = Ledger::new("node");
        ledger.set_mining_authorized(true);
        ledger.add_message("first", "node").unwrap();
        ledger.mine_block(100).unwrap();
        ledger.add_message("second", "node").unwrap();
        ledger
    }

    #[test]
    fn test_save_and_load_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let ledger = populated_ledger();

        let mut snapshot = ledger.snapshot();
        snapshot.leadership_term = 7;
        let meta = store.save("alpha", &snapshot).unwrap();
        assert_eq!(meta.height, 1);
        assert_eq!(meta.tip_hash, ledger.latest_block().hash);

        let loaded = store.load("alpha").unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(store.load_meta("alpha").unwrap(), Some(meta));
    }

    #[test]
    fn test_chain_with_trade_execution_reloads() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let mut ledger = Ledger::new("node");
        ledger.set_mining_authorized(true);
        let trade = TradeExecution {
            trade_id: "t1".into(),
            asset: "BTC".into(),
            quantity: 500,
            price: 10_000,
            buyer: "alice".into(),
            buyer_network: "east".into(),
            seller: "carol".into(),
            seller_network: "west".into(),
            timestamp: 42,
        };
        assert!(ledger.add_transaction(Transaction::trade_execution(trade)));
        ledger.mine_block(100).unwrap();

        store.save("east", &ledger.snapshot()).unwrap();
        let loaded = store.load("east").unwrap().unwrap();
        assert_eq!(loaded, ledger.snapshot());

        let mut restored = Ledger::new("other");
        restored.restore(loaded);
        assert!(restored.contains("exec_t1"));
        assert_eq!(restored.latest_block(), ledger.latest_block());
    }

    #[test]
    fn test_networks_are_isolated() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.save("alpha", &populated_ledger().snapshot()).unwrap();

        assert!(store.load("beta").unwrap().is_none());
        assert_eq!(store.networks().unwrap(), vec!["alpha".to_string()]);

        store.remove("alpha").unwrap();
        assert!(store.load("alpha").unwrap().is_none());
        assert!(store.load_meta("alpha").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SnapshotStore::open(dir.path()).unwrap();
            store.save("alpha", &populated_ledger().snapshot()).unwrap();
        }

        let store = SnapshotStore::open(dir.path()).unwrap();
        let mut ledger = Ledger::new("other");
        ledger.restore(store.load("alpha").unwrap().unwrap());
        assert_eq!(ledger.height(), 1);
        assert_eq!(ledger.pending_count(), 1);
    }
}
