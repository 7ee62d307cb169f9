//! Core types for leader election

use serde::{Deserialize, Serialize};

/// Election role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadershipRole {
    Follower,
    Candidate,
    Leader,
}

/// Candidate asking peers for their vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionRequest {
    pub candidate_id: String,
    pub term: u64,
    pub network_id: String,
    pub timestamp: u64,
}

/// Vote sent back to a candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub voter_id: String,
    pub candidate_id: String,
    pub term: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
}

/// Periodic proof of life from the leader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub leader_id: String,
    pub term: u64,
    #[serde(default)]
    pub pending_transactions: usize,
    #[serde(default)]
    pub block_height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
}

/// Broadcast once when a node wins an election
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub leader_id: String,
    pub term: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
}

/// Messages exchanged by the election protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LeadershipMessage {
    #[serde(rename = "leadership_election")]
    Election(ElectionRequest),
    #[serde(rename = "leadership_vote")]
    Vote(Vote),
    #[serde(rename = "leadership_heartbeat")]
    Heartbeat(Heartbeat),
    #[serde(rename = "leadership_announcement")]
    Announcement(Announcement),
}

impl LeadershipMessage {
    pub fn term(&self) -> u64 {
        match self {
            LeadershipMessage::Election(m) => m.term,
            LeadershipMessage::Vote(m) => m.term,
            LeadershipMessage::Heartbeat(m) => m.term,
            LeadershipMessage::Announcement(m) => m.term,
        }
    }
}

/// What the caller must do after feeding the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ElectionEffect {
    /// Send to every connected peer
    Broadcast(LeadershipMessage),
    /// Send to a single peer
    SendTo { peer: String, message: LeadershipMessage },
    /// This node now holds leadership for `term`
    BecameLeader { term: u64 },
    /// This node gave up leadership held in `term`
    SteppedDown { term: u64 },
    /// Leader should try to mine pending transactions
    MineRequested,
}

/// Protocol timing, all in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Base follower timeout before starting an election
    pub election_timeout_ms: u64,
    /// Random extra added to the election timeout
    pub election_jitter_ms: u64,
    /// Delay after starting an election before tallying it
    pub result_check_ms: u64,
    /// Leader heartbeat period
    pub heartbeat_interval_ms: u64,
    /// Period of the leader liveness check
    pub liveness_check_ms: u64,
    /// Silence after which a leader is presumed dead
    pub leader_timeout_ms: u64,
    /// Delay after start before the first leadership check
    pub initial_check_ms: u64,
    /// Random delay before a node with peers starts its first election
    pub initial_jitter_ms: u64,
    /// Election outcomes kept for status
    pub history_len: usize,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 6_000,
            election_jitter_ms: 3_000,
            result_check_ms: 4_000,
            heartbeat_interval_ms: 3_000,
            liveness_check_ms: 4_000,
            leader_timeout_ms: 10_000,
            initial_check_ms: 2_000,
            initial_jitter_ms: 3_000,
            history_len: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionOutcome {
    Pending,
    Won,
    Lost,
}

/// One election this node took part in as candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionRecord {
    pub term: u64,
    pub started_at: u64,
    pub outcome: ElectionOutcome,
    pub votes: usize,
}

/// Stats about this node's leadership
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectionMetrics {
    pub elections_started: u64,
    pub elections_won: u64,
    /// Cumulative time spent as leader
    pub total_leadership_ms: u64,
    pub heartbeats_sent: u64,
    pub votes_cast: u64,
}

/// Point-in-time view for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct LeadershipStatus {
    pub node_id: String,
    pub network_id: String,
    pub term: u64,
    pub role: LeadershipRole,
    pub current_leader: Option<String>,
    pub is_leader: bool,
    pub votes_received: usize,
    pub peer_count: usize,
    pub majority: usize,
    pub metrics: ElectionMetrics,
    pub history: Vec<ElectionRecord>,
}
