//! Mesh Consensus - leader election per network
//!
//! Architecture:
//! - Nodes start as followers at term 0
//! - A follower that sees no live leader becomes a candidate for term + 1
//! - A majority of votes (self included) makes the candidate leader
//! - The leader heartbeats every few seconds and is the only node allowed to mine
//!
//! The state machine does no I/O and reads no clock. Callers feed it
//! messages and `now_ms`, and act on the returned [`ElectionEffect`]s.

pub mod election;
pub mod types;

pub use election::{LeaderElection, LeaderElectionBuilder};
pub use types::*;
