//! Wire envelopes
//!
//! Everything on the wire is a JSON object discriminated by `type`.
//! [`PeerMessage`] travels over direct peer channels, [`RelayMessage`]
//! over the tracker connection.

use mesh_consensus::{Announcement, ElectionRequest, Heartbeat, LeadershipMessage, Vote};
use mesh_exchange::EnterpriseBook;
use mesh_types::{Block, CrossNetworkTradeNotice, Side, TradeExecution, Transaction};
use serde::{Deserialize, Serialize};

/// Order placed on one peer, replicated to the others
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderTransaction {
    pub action: Side,
    pub trader: String,
    pub asset: String,
    pub quantity: u64,
    pub price: u64,
    pub order_id: String,
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// First frame on every connection
    Hello { node_id: String, network_id: String },
    LeadershipElection(ElectionRequest),
    LeadershipVote(Vote),
    LeadershipHeartbeat(Heartbeat),
    LeadershipAnnouncement(Announcement),
    BlockchainBlock { block: Block, sender: String },
    SyncRequest { current_height: u64, sender: String },
    OrderTransaction(OrderTransaction),
    TradeExecution { trade: TradeExecution, sender: String },
    /// Reconciled locally, never re-broadcast
    CrossNetworkTrade(CrossNetworkTradeNotice),
    Transaction { transaction: Transaction, sender: String },
}

impl PeerMessage {
    /// The election payload, if this is a leadership message
    pub fn into_leadership(self) -> Result<LeadershipMessage, PeerMessage> {
        match self {
            PeerMessage::LeadershipElection(m) => Ok(LeadershipMessage::Election(m)),
            PeerMessage::LeadershipVote(m) => Ok(LeadershipMessage::Vote(m)),
            PeerMessage::LeadershipHeartbeat(m) => Ok(LeadershipMessage::Heartbeat(m)),
            PeerMessage::LeadershipAnnouncement(m) => Ok(LeadershipMessage::Announcement(m)),
            other => Err(other),
        }
    }

    /// Type tag, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::LeadershipElection(_) => "leadership_election",
            PeerMessage::LeadershipVote(_) => "leadership_vote",
            PeerMessage::LeadershipHeartbeat(_) => "leadership_heartbeat",
            PeerMessage::LeadershipAnnouncement(_) => "leadership_announcement",
            PeerMessage::BlockchainBlock { .. } => "blockchain_block",
            PeerMessage::SyncRequest { .. } => "sync_request",
            PeerMessage::OrderTransaction(_) => "order_transaction",
            PeerMessage::TradeExecution { .. } => "trade_execution",
            PeerMessage::CrossNetworkTrade(_) => "cross_network_trade",
            PeerMessage::Transaction { .. } => "transaction",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl From<LeadershipMessage> for PeerMessage {
    fn from(message: LeadershipMessage) -> Self {
        match message {
            LeadershipMessage::Election(m) => PeerMessage::LeadershipElection(m),
            LeadershipMessage::Vote(m) => PeerMessage::LeadershipVote(m),
            LeadershipMessage::Heartbeat(m) => PeerMessage::LeadershipHeartbeat(m),
            LeadershipMessage::Announcement(m) => PeerMessage::LeadershipAnnouncement(m),
        }
    }
}

/// State pushed down by the enterprise ledger
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncData {
    OrderBookUpdate(EnterpriseBook),
    TradeExecution { trade: TradeExecution },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    JoinNetwork {
        network_id: String,
    },
    NetworkInfo {
        network_id: String,
        #[serde(default)]
        peer_count: usize,
    },
    NetworkListUpdate {
        #[serde(default)]
        networks: Vec<serde_json::Value>,
    },
    /// Peer addresses in the current network
    Peers {
        peers: Vec<String>,
    },
    /// Locally mined block pushed up, or a block relayed down
    Block {
        block: Block,
    },
    Transaction {
        transaction: Transaction,
    },
    EnterpriseSync {
        sync_data: SyncData,
    },
    CrossNetworkTrade(CrossNetworkTradeNotice),
    /// Signaling and other traffic this node does not act on
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_request_shape() {
        let msg = PeerMessage::SyncRequest {
            current_height: 4,
            sender: "a".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "sync_request", "current_height": 4, "sender": "a"}));
    }

    #[test]
    fn test_order_transaction_shape() {
        let value = json!({
            "type": "order_transaction",
            "action": "buy",
            "trader": "alice",
            "asset": "BTC",
            "quantity": 1000,
            "price": 10000,
            "orderId": "order_1"
        });
        let msg = PeerMessage::from_json(&value.to_string()).unwrap();
        match msg {
            PeerMessage::OrderTransaction(ot) => {
                assert_eq!(ot.action, Side::Buy);
                assert_eq!(ot.order_id, "order_1");
                assert_eq!(ot.timestamp, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cross_network_trade_is_flat() {
        let value = json!({
            "type": "cross_network_trade",
            "trade_id": "t1",
            "asset": "BTC",
            "quantity": 5,
            "price": 100,
            "buyer_network": "east",
            "seller_network": "west",
            "timestamp": 1
        });
        let msg: PeerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(msg.kind(), "cross_network_trade");
    }

    #[test]
    fn test_leadership_conversion() {
        let lm = LeadershipMessage::Vote(Vote {
            voter_id: "a".into(),
            candidate_id: "b".into(),
            term: 2,
            network_id: None,
        });
        let pm: PeerMessage = lm.clone().into();
        let value = serde_json::to_value(&pm).unwrap();
        assert_eq!(value["type"], "leadership_vote");
        assert_eq!(value["voterId"], "a");
        assert_eq!(pm.into_leadership().unwrap(), lm);
    }

    #[test]
    fn test_enterprise_trade_envelope() {
        let value = json!({
            "type": "enterprise_sync",
            "sync_data": {
                "type": "trade_execution",
                "trade": {
                    "trade_id": "t9",
                    "asset": "BTC",
                    "quantity": 5,
                    "price": 100,
                    "buyer": "alice",
                    "buyer_network": "east",
                    "seller": "bob",
                    "seller_network": "west",
                    "timestamp": 3
                }
            }
        });
        let msg = RelayMessage::from_json(&value.to_string()).unwrap();
        match msg {
            RelayMessage::EnterpriseSync {
                sync_data: SyncData::TradeExecution { trade },
            } => assert_eq!(trade.trade_id, "t9"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_relay_traffic_tolerated() {
        let msg = RelayMessage::from_json(r#"{"type":"offer","target":"x","offer":{}}"#).unwrap();
        assert_eq!(msg, RelayMessage::Unknown);

        let info = RelayMessage::from_json(r#"{"type":"network_info","network_id":"n"}"#).unwrap();
        assert_eq!(
            info,
            RelayMessage::NetworkInfo {
                network_id: "n".into(),
                peer_count: 0
            }
        );
    }
}
