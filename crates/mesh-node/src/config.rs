//! Node Configuration

use mesh_consensus::ElectionConfig;
use mesh_sync::{MeshNodeConfig, RelayConfig};
use mesh_types::unique_id;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Node configuration, read from a JSON file and overridden by flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Generated when unset
    pub node_id: Option<String>,
    pub network: String,
    /// Peer WebSocket bind address, `None` disables inbound peers
    pub listen: Option<String>,
    /// Peer addresses dialed on start
    pub peers: Vec<String>,
    pub relay: RelayConfig,
    /// HTTP JSON-RPC bind address
    pub rpc_addr: String,
    /// Directory of the snapshot database
    pub data_dir: PathBuf,
    pub log_level: String,
    /// Save state every N seconds (0 = only on shutdown)
    pub save_interval_secs: u64,
    pub tick_interval_ms: u64,
    pub trade_capacity: usize,
    pub election: ElectionConfig,
    pub election_seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            network: "default".to_string(),
            listen: Some("127.0.0.1:9000".to_string()),
            peers: Vec::new(),
            relay: RelayConfig::default(),
            rpc_addr: "127.0.0.1:8899".to_string(),
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            save_interval_secs: 30,
            tick_interval_ms: 250,
            trade_capacity: 100,
            election: ElectionConfig::default(),
            election_seed: None,
        }
    }
}

/// Command line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub node_id: Option<String>,
    pub network: Option<String>,
    pub listen: Option<String>,
    pub peers: Vec<String>,
    pub relay_url: Option<String>,
    pub rpc_addr: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub save_interval_secs: Option<u64>,
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply flags on top of this config. Peers given on the command line
    /// are added to the configured ones.
    pub fn merge(mut self, overrides: Overrides) -> Self {
        if let Some(node_id) = overrides.node_id {
            self.node_id = Some(node_id);
        }
        if let Some(network) = overrides.network {
            self.network = network;
        }
        if let Some(listen) = overrides.listen {
            self.listen = Some(listen);
        }
        for peer in overrides.peers {
            if !self.peers.contains(&peer) {
                self.peers.push(peer);
            }
        }
        if let Some(url) = overrides.relay_url {
            self.relay.url = Some(url);
        }
        if let Some(rpc_addr) = overrides.rpc_addr {
            self.rpc_addr = rpc_addr;
        }
        if let Some(data_dir) = overrides.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(log_level) = overrides.log_level {
            self.log_level = log_level;
        }
        if let Some(secs) = overrides.save_interval_secs {
            self.save_interval_secs = secs;
        }
        self
    }

    /// Settings for the node coordinator
    pub fn mesh_config(&self) -> MeshNodeConfig {
        MeshNodeConfig {
            node_id: self.node_id.clone().unwrap_or_else(|| unique_id("node")),
            network_id: self.network.clone(),
            election: self.election.clone(),
            election_seed: self.election_seed,
            tick_interval_ms: self.tick_interval_ms,
            save_interval_secs: self.save_interval_secs,
            trade_capacity: self.trade_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_protocol_timing() {
        let config = NodeConfig::default();
        assert_eq!(config.election.election_timeout_ms, 6_000);
        assert_eq!(config.election.heartbeat_interval_ms, 3_000);
        assert_eq!(config.election.leader_timeout_ms, 10_000);
        assert_eq!(config.relay.base_delay_ms, 5_000);
        assert_eq!(config.relay.max_attempts, 5);
        assert!(config.relay.url.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"network": "desk-a", "peers": ["10.0.0.2:9000"], "relay": {{"url": "ws://tracker:3030"}}}}"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.network, "desk-a");
        assert_eq!(config.peers, vec!["10.0.0.2:9000".to_string()]);
        assert_eq!(config.relay.url.as_deref(), Some("ws://tracker:3030"));
        assert_eq!(config.relay.max_attempts, 5);
        assert_eq!(config.rpc_addr, "127.0.0.1:8899");
    }

    #[test]
    fn test_flags_override_file() {
        let base = NodeConfig {
            network: "from-file".into(),
            peers: vec!["a:1".into()],
            ..NodeConfig::default()
        };
        let merged = base.merge(Overrides {
            network: Some("from-flag".into()),
            peers: vec!["a:1".into(), "b:2".into()],
            relay_url: Some("ws://relay".into()),
            save_interval_secs: Some(0),
            ..Overrides::default()
        });

        assert_eq!(merged.network, "from-flag");
        assert_eq!(merged.peers, vec!["a:1".to_string(), "b:2".to_string()]);
        assert_eq!(merged.relay.url.as_deref(), Some("ws://relay"));
        assert_eq!(merged.save_interval_secs, 0);
        assert_eq!(merged.log_level, "info");
    }

    #[test]
    fn test_mesh_config_generates_missing_id() {
        let config = NodeConfig::default();
        let first = config.mesh_config();
        assert!(first.node_id.starts_with("node"));
        assert_eq!(first.network_id, "default");

        let named = NodeConfig {
            node_id: Some("desk-1".into()),
            ..NodeConfig::default()
        };
        assert_eq!(named.mesh_config().node_id, "desk-1");
    }
}
