//! Leader election state machine
//!
//! Timers are plain deadlines owned by the state machine. Every path that
//! schedules a timer clears the previous deadline of the same kind first, so
//! a node never has two election timeouts (or two heartbeat loops) armed.

use crate::types::*;
use mesh_types::short_id;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};

/// Election participant for one network
pub struct LeaderElection {
    node_id: String,
    network_id: String,
    config: ElectionConfig,
    rng: StdRng,

    /// Monotonically non-decreasing election epoch
    term: u64,
    role: LeadershipRole,
    current_leader: Option<String>,
    /// Votes received while candidate, current term only
    votes: HashMap<u64, HashSet<String>>,
    /// Last term in which this node cast a vote (for itself or another)
    voted_in_term: Option<u64>,
    last_heartbeat_seen: HashMap<String, u64>,
    /// Connected peers, excluding self
    peer_count: usize,
    /// Reported in heartbeats
    pending_transactions: usize,
    block_height: u64,

    initial_check_at: Option<u64>,
    election_deadline: Option<u64>,
    result_check_at: Option<u64>,
    next_heartbeat_at: Option<u64>,
    next_liveness_check_at: Option<u64>,

    leader_since: Option<u64>,
    metrics: ElectionMetrics,
    history: VecDeque<ElectionRecord>,
}

fn take_due(deadline: &mut Option<u64>, now_ms: u64) -> bool {
    match *deadline {
        Some(at) if at <= now_ms => {
            *deadline = None;
            true
        }
        _ => false,
    }
}

impl LeaderElection {
    /// Create a follower at term 0 with entropy-seeded jitter
    pub fn new(
        node_id: impl Into<String>,
        network_id: impl Into<String>,
        config: ElectionConfig,
        now_ms: u64,
    ) -> Self {
        Self::with_rng(node_id, network_id, config, StdRng::from_entropy(), now_ms)
    }

    fn with_rng(
        node_id: impl Into<String>,
        network_id: impl Into<String>,
        config: ElectionConfig,
        rng: StdRng,
        now_ms: u64,
    ) -> Self {
        let node_id = node_id.into();
        let network_id = network_id.into();
        tracing::debug!("Election state for {} on {} created", node_id, network_id);
        Self {
            initial_check_at: Some(now_ms + config.initial_check_ms),
            next_liveness_check_at: Some(now_ms + config.liveness_check_ms),
            history: VecDeque::with_capacity(config.history_len),
            node_id,
            network_id,
            config,
            rng,
            term: 0,
            role: LeadershipRole::Follower,
            current_leader: None,
            votes: HashMap::new(),
            voted_in_term: None,
            last_heartbeat_seen: HashMap::new(),
            peer_count: 0,
            pending_transactions: 0,
            block_height: 0,
            election_deadline: None,
            result_check_at: None,
            next_heartbeat_at: None,
            leader_since: None,
            metrics: ElectionMetrics::default(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> LeadershipRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == LeadershipRole::Leader
    }

    pub fn current_leader(&self) -> Option<&str> {
        self.current_leader.as_deref()
    }

    /// Votes needed to win: a strict majority of self plus peers
    pub fn majority(&self) -> usize {
        (1 + self.peer_count) / 2 + 1
    }

    pub fn set_peer_count(&mut self, peer_count: usize) {
        if self.peer_count != peer_count {
            tracing::debug!("Peer count {} -> {}", self.peer_count, peer_count);
        }
        self.peer_count = peer_count;
    }

    /// Ledger figures carried in outgoing heartbeats
    pub fn observe_ledger(&mut self, pending_transactions: usize, block_height: u64) {
        self.pending_transactions = pending_transactions;
        self.block_height = block_height;
    }

    /// Earliest armed deadline, if any
    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.initial_check_at,
            self.election_deadline,
            self.result_check_at,
            self.next_heartbeat_at,
            self.next_liveness_check_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every timer due at `now_ms`
    pub fn on_tick(&mut self, now_ms: u64) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();

        if take_due(&mut self.initial_check_at, now_ms) {
            self.initial_check(now_ms, &mut effects);
        }

        if take_due(&mut self.result_check_at, now_ms) {
            self.check_election_results(now_ms, &mut effects);
        }

        if take_due(&mut self.election_deadline, now_ms) && self.role != LeadershipRole::Leader {
            tracing::info!("{} election timeout at term {}", self.node_id, self.term);
            self.start_election_into(now_ms, &mut effects);
        }

        if take_due(&mut self.next_heartbeat_at, now_ms) && self.is_leader() {
            effects.push(ElectionEffect::Broadcast(self.heartbeat()));
            self.metrics.heartbeats_sent += 1;
            self.next_heartbeat_at = Some(now_ms + self.config.heartbeat_interval_ms);
        }

        if take_due(&mut self.next_liveness_check_at, now_ms) {
            self.next_liveness_check_at = Some(now_ms + self.config.liveness_check_ms);
            self.check_liveness(now_ms, &mut effects);
        }

        effects
    }

    /// Dispatch an inbound election message
    pub fn handle_message(&mut self, message: LeadershipMessage, now_ms: u64) -> Vec<ElectionEffect> {
        match message {
            LeadershipMessage::Election(req) => self.handle_election_request(req, now_ms),
            LeadershipMessage::Vote(vote) => self.handle_vote(vote, now_ms),
            LeadershipMessage::Heartbeat(hb) => self.handle_heartbeat(hb, now_ms),
            LeadershipMessage::Announcement(ann) => self.handle_announcement(ann, now_ms),
        }
    }

    /// Become a candidate for the next term
    pub fn start_election(&mut self, now_ms: u64) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();
        self.start_election_into(now_ms, &mut effects);
        effects
    }

    /// Start an election regardless of current role, even while leading
    pub fn force_election(&mut self, now_ms: u64) -> Vec<ElectionEffect> {
        tracing::info!("{} forcing election", self.node_id);
        self.start_election(now_ms)
    }

    /// Give up leadership without a successor
    pub fn step_down(&mut self, now_ms: u64) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();
        if self.is_leader() {
            tracing::info!("{} stepping down at term {}", self.node_id, self.term);
            self.become_follower(None, now_ms, &mut effects);
        }
        effects
    }

    fn start_election_into(&mut self, now_ms: u64, effects: &mut Vec<ElectionEffect>) {
        if self.is_leader() {
            self.become_follower(None, now_ms, effects);
        }
        self.term += 1;
        self.role = LeadershipRole::Candidate;
        self.current_leader = None;
        self.voted_in_term = Some(self.term);

        self.votes.clear();
        self.votes
            .entry(self.term)
            .or_default()
            .insert(self.node_id.clone());

        self.metrics.elections_started += 1;
        self.push_history(ElectionRecord {
            term: self.term,
            started_at: now_ms,
            outcome: ElectionOutcome::Pending,
            votes: 1,
        });

        tracing::info!(
            "{} starting election for term {} ({} peers, need {})",
            self.node_id,
            self.term,
            self.peer_count,
            self.majority()
        );

        self.next_heartbeat_at = None;
        self.result_check_at = Some(now_ms + self.config.result_check_ms);
        self.arm_election_timeout(now_ms);

        effects.push(ElectionEffect::Broadcast(LeadershipMessage::Election(
            ElectionRequest {
                candidate_id: self.node_id.clone(),
                term: self.term,
                network_id: self.network_id.clone(),
                timestamp: now_ms,
            },
        )));

        // A node with no peers wins on its own vote
        self.try_win(now_ms, effects);
    }

    fn handle_election_request(&mut self, req: ElectionRequest, now_ms: u64) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();
        if req.network_id != self.network_id || req.candidate_id == self.node_id {
            return effects;
        }

        if req.term > self.term {
            self.become_follower(None, now_ms, &mut effects);
            self.term = req.term;
        } else if req.term < self.term || self.role != LeadershipRole::Follower {
            tracing::debug!(
                "{} ignoring election request from {} for term {} (term {}, {:?})",
                self.node_id,
                req.candidate_id,
                req.term,
                self.term,
                self.role
            );
            return effects;
        }

        if self.voted_in_term == Some(self.term) {
            tracing::debug!(
                "{} already voted in term {}, not voting for {}",
                self.node_id,
                self.term,
                req.candidate_id
            );
            return effects;
        }

        self.voted_in_term = Some(self.term);
        self.metrics.votes_cast += 1;
        self.arm_election_timeout(now_ms);

        tracing::info!(
            "{} voting for {} in term {}",
            self.node_id,
            short_id(&req.candidate_id),
            self.term
        );

        effects.push(ElectionEffect::SendTo {
            peer: req.candidate_id.clone(),
            message: LeadershipMessage::Vote(Vote {
                voter_id: self.node_id.clone(),
                candidate_id: req.candidate_id,
                term: self.term,
                network_id: Some(self.network_id.clone()),
            }),
        });
        effects
    }

    fn handle_vote(&mut self, vote: Vote, now_ms: u64) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();
        if !self.same_network(vote.network_id.as_deref())
            || vote.candidate_id != self.node_id
            || vote.term != self.term
            || self.role != LeadershipRole::Candidate
        {
            return effects;
        }

        let votes = self.votes.entry(self.term).or_default();
        votes.insert(vote.voter_id.clone());
        let count = votes.len();
        if let Some(record) = self.history.back_mut() {
            if record.term == self.term {
                record.votes = count;
            }
        }

        tracing::debug!(
            "{} got vote from {} in term {} ({}/{})",
            self.node_id,
            vote.voter_id,
            self.term,
            count,
            self.majority()
        );

        self.try_win(now_ms, &mut effects);
        effects
    }

    fn handle_heartbeat(&mut self, hb: Heartbeat, now_ms: u64) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();
        if !self.same_network(hb.network_id.as_deref()) {
            return effects;
        }
        self.follow(hb.leader_id, hb.term, now_ms, &mut effects);
        effects
    }

    fn handle_announcement(&mut self, ann: Announcement, now_ms: u64) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();
        if !self.same_network(ann.network_id.as_deref()) {
            return effects;
        }
        tracing::info!("{} sees {} announce leadership of term {}", self.node_id, ann.leader_id, ann.term);
        self.follow(ann.leader_id, ann.term, now_ms, &mut effects);
        effects
    }

    /// Accept `leader_id` for `term` if it is not stale
    fn follow(&mut self, leader_id: String, term: u64, now_ms: u64, effects: &mut Vec<ElectionEffect>) {
        if leader_id == self.node_id {
            return;
        }
        // Two leaders of one term (a healed partition): the lower id keeps it
        let accept = term > self.term
            || (term == self.term && (!self.is_leader() || leader_id < self.node_id));
        if !accept {
            tracing::debug!(
                "{} ignoring leader {} (term {}, ours {})",
                self.node_id,
                leader_id,
                term,
                self.term
            );
            return;
        }

        self.last_heartbeat_seen.insert(leader_id.clone(), now_ms);

        if self.role != LeadershipRole::Follower || self.current_leader.as_deref() != Some(leader_id.as_str()) {
            self.become_follower(Some(leader_id), now_ms, effects);
        } else {
            self.arm_election_timeout(now_ms);
        }
        self.term = term;
    }

    fn try_win(&mut self, now_ms: u64, effects: &mut Vec<ElectionEffect>) {
        if self.role != LeadershipRole::Candidate {
            return;
        }
        let count = self.votes.get(&self.term).map_or(0, |v| v.len());
        if count >= self.majority() {
            self.become_leader(now_ms, effects);
        }
    }

    fn check_election_results(&mut self, now_ms: u64, effects: &mut Vec<ElectionEffect>) {
        if self.role != LeadershipRole::Candidate {
            return;
        }
        let count = self.votes.get(&self.term).map_or(0, |v| v.len());
        if count >= self.majority() {
            self.become_leader(now_ms, effects);
        } else {
            tracing::info!(
                "{} lost election for term {} ({}/{} votes)",
                self.node_id,
                self.term,
                count,
                self.majority()
            );
            self.become_follower(None, now_ms, effects);
        }
    }

    fn become_leader(&mut self, now_ms: u64, effects: &mut Vec<ElectionEffect>) {
        self.role = LeadershipRole::Leader;
        self.current_leader = Some(self.node_id.clone());
        self.election_deadline = None;
        self.result_check_at = None;
        self.next_heartbeat_at = Some(now_ms + self.config.heartbeat_interval_ms);
        self.leader_since = Some(now_ms);
        self.metrics.elections_won += 1;
        self.set_outcome(ElectionOutcome::Won);

        tracing::info!("{} became leader for term {}", self.node_id, self.term);

        effects.push(ElectionEffect::BecameLeader { term: self.term });
        effects.push(ElectionEffect::Broadcast(LeadershipMessage::Announcement(
            Announcement {
                leader_id: self.node_id.clone(),
                term: self.term,
                network_id: Some(self.network_id.clone()),
            },
        )));
        effects.push(ElectionEffect::MineRequested);
    }

    fn become_follower(&mut self, leader: Option<String>, now_ms: u64, effects: &mut Vec<ElectionEffect>) {
        match self.role {
            LeadershipRole::Leader => {
                if let Some(since) = self.leader_since.take() {
                    self.metrics.total_leadership_ms += now_ms.saturating_sub(since);
                }
                tracing::info!("{} stepped down from term-{} leadership", self.node_id, self.term);
                effects.push(ElectionEffect::SteppedDown { term: self.term });
            }
            LeadershipRole::Candidate => self.set_outcome(ElectionOutcome::Lost),
            LeadershipRole::Follower => {}
        }

        self.role = LeadershipRole::Follower;
        self.current_leader = leader;
        self.next_heartbeat_at = None;
        self.result_check_at = None;
        self.arm_election_timeout(now_ms);
    }

    fn check_liveness(&mut self, now_ms: u64, effects: &mut Vec<ElectionEffect>) {
        match self.current_leader.clone() {
            Some(leader) if leader == self.node_id => {
                effects.push(ElectionEffect::MineRequested);
            }
            Some(leader) => {
                let fresh = self
                    .last_heartbeat_seen
                    .get(&leader)
                    .map_or(false, |seen| now_ms.saturating_sub(*seen) <= self.config.leader_timeout_ms);
                if !fresh {
                    tracing::warn!("{} lost contact with leader {}", self.node_id, leader);
                    self.current_leader = None;
                    self.start_election_into(now_ms, effects);
                }
            }
            None => {
                // A vote already cast this term waits for the election timeout
                let awaiting_candidate =
                    self.voted_in_term == Some(self.term) && self.election_deadline.is_some();
                if self.role == LeadershipRole::Follower && !awaiting_candidate {
                    tracing::info!("{} sees no leader, starting election", self.node_id);
                    self.start_election_into(now_ms, effects);
                }
            }
        }
    }

    fn initial_check(&mut self, now_ms: u64, effects: &mut Vec<ElectionEffect>) {
        if self.current_leader.is_some() || self.role != LeadershipRole::Follower {
            return;
        }
        if self.peer_count == 0 {
            tracing::info!("{} is alone on {}, taking leadership", self.node_id, self.network_id);
            self.term = self.term.max(1);
            self.become_leader(now_ms, effects);
        } else {
            let delay = self.jitter(self.config.initial_jitter_ms);
            self.election_deadline = Some(now_ms + delay);
        }
    }

    fn arm_election_timeout(&mut self, now_ms: u64) {
        self.election_deadline = None;
        let timeout = self.config.election_timeout_ms + self.jitter(self.config.election_jitter_ms);
        self.election_deadline = Some(now_ms + timeout);
    }

    fn jitter(&mut self, max_ms: u64) -> u64 {
        if max_ms == 0 {
            0
        } else {
            self.rng.gen_range(0..=max_ms)
        }
    }

    fn heartbeat(&self) -> LeadershipMessage {
        LeadershipMessage::Heartbeat(Heartbeat {
            leader_id: self.node_id.clone(),
            term: self.term,
            pending_transactions: self.pending_transactions,
            block_height: self.block_height,
            network_id: Some(self.network_id.clone()),
        })
    }

    fn same_network(&self, network_id: Option<&str>) -> bool {
        network_id.map_or(true, |n| n == self.network_id)
    }

    fn push_history(&mut self, record: ElectionRecord) {
        self.history.push_back(record);
        while self.history.len() > self.config.history_len {
            self.history.pop_front();
        }
    }

    fn set_outcome(&mut self, outcome: ElectionOutcome) {
        if let Some(record) = self.history.back_mut() {
            if record.term == self.term && record.outcome == ElectionOutcome::Pending {
                record.outcome = outcome;
            }
        }
    }

    pub fn metrics(&self, now_ms: u64) -> ElectionMetrics {
        let mut metrics = self.metrics.clone();
        if let Some(since) = self.leader_since {
            metrics.total_leadership_ms += now_ms.saturating_sub(since);
        }
        metrics
    }

    pub fn status(&self, now_ms: u64) -> LeadershipStatus {
        LeadershipStatus {
            node_id: self.node_id.clone(),
            network_id: self.network_id.clone(),
            term: self.term,
            role: self.role,
            current_leader: self.current_leader.clone(),
            is_leader: self.is_leader(),
            votes_received: self.votes.get(&self.term).map_or(0, |v| v.len()),
            peer_count: self.peer_count,
            majority: self.majority(),
            metrics: self.metrics(now_ms),
            history: self.history.iter().cloned().collect(),
        }
    }
}

/// Builder for LeaderElection
pub struct LeaderElectionBuilder {
    node_id: String,
    network_id: String,
    config: ElectionConfig,
    seed: Option<u64>,
    peer_count: usize,
}

impl LeaderElectionBuilder {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            network_id: "default".to_string(),
            config: ElectionConfig::default(),
            seed: None,
            peer_count: 0,
        }
    }

    pub fn network(mut self, network_id: impl Into<String>) -> Self {
        self.network_id = network_id.into();
        self
    }

    pub fn config(mut self, config: ElectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Deterministic jitter, for tests and simulations
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn peer_count(mut self, peer_count: usize) -> Self {
        self.peer_count = peer_count;
        self
    }

    pub fn build(self, now_ms: u64) -> LeaderElection {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut election = LeaderElection::with_rng(self.node_id, self.network_id, self.config, rng, now_ms);
        election.peer_count = self.peer_count;
        election
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP_MS: u64 = 100;

    /// Nodes wired together with instant, in-order delivery
    struct Cluster {
        nodes: Vec<LeaderElection>,
        now: u64,
        /// Every (term, leader) pair ever observed
        leaders_by_term: HashMap<u64, HashSet<String>>,
    }

    impl Cluster {
        fn new(size: usize) -> Self {
            let nodes = (0..size)
                .map(|i| {
                    LeaderElectionBuilder::new(format!("n{}", i))
                        .network("net")
                        .seed(i as u64 + 1)
                        .peer_count(size - 1)
                        .build(0)
                })
                .collect();
            Self {
                nodes,
                now: 0,
                leaders_by_term: HashMap::new(),
            }
        }

        fn index_of(&self, id: &str) -> Option<usize> {
            self.nodes.iter().position(|n| n.node_id() == id)
        }

        fn deliver(&mut self, from: usize, effects: Vec<ElectionEffect>) {
            let mut queue: VecDeque<(usize, ElectionEffect)> =
                effects.into_iter().map(|e| (from, e)).collect();
            while let Some((src, effect)) = queue.pop_front() {
                match effect {
                    ElectionEffect::Broadcast(message) => {
                        for i in 0..self.nodes.len() {
                            if i != src {
                                let out = self.nodes[i].handle_message(message.clone(), self.now);
                                queue.extend(out.into_iter().map(|e| (i, e)));
                            }
                        }
                    }
                    ElectionEffect::SendTo { peer, message } => {
                        if let Some(i) = self.index_of(&peer) {
                            let out = self.nodes[i].handle_message(message, self.now);
                            queue.extend(out.into_iter().map(|e| (i, e)));
                        }
                    }
                    _ => {}
                }
            }
            self.record_leaders();
        }

        fn record_leaders(&mut self) {
            for node in &self.nodes {
                if node.is_leader() {
                    self.leaders_by_term
                        .entry(node.term())
                        .or_default()
                        .insert(node.node_id().to_string());
                }
            }
        }

        fn run_until(&mut self, until: u64) {
            while self.now < until {
                self.now += STEP_MS;
                for i in 0..self.nodes.len() {
                    let effects = self.nodes[i].on_tick(self.now);
                    self.deliver(i, effects);
                }
            }
        }

        fn leaders(&self) -> Vec<&LeaderElection> {
            self.nodes.iter().filter(|n| n.is_leader()).collect()
        }

        fn assert_single_leader_per_term(&self) {
            for (term, leaders) in &self.leaders_by_term {
                assert!(leaders.len() <= 1, "term {} had leaders {:?}", term, leaders);
            }
        }

        fn assert_converged(&self) {
            let leaders = self.leaders();
            assert_eq!(leaders.len(), 1, "expected exactly one leader");
            let leader = leaders[0];
            for node in &self.nodes {
                assert_eq!(node.term(), leader.term());
                assert_eq!(node.current_leader(), Some(leader.node_id()));
            }
        }
    }

    #[test]
    fn test_solo_node_leads_after_initial_check() {
        let mut node = LeaderElectionBuilder::new("solo").seed(7).build(0);
        assert!(node.on_tick(1_000).is_empty());

        let effects = node.on_tick(2_000);
        assert!(node.is_leader());
        assert_eq!(node.term(), 1);
        assert!(effects.contains(&ElectionEffect::BecameLeader { term: 1 }));
        assert!(effects.contains(&ElectionEffect::MineRequested));
    }

    #[test]
    fn test_solo_election_wins_without_votes() {
        let mut node = LeaderElectionBuilder::new("solo").seed(7).build(0);
        let effects = node.start_election(10);
        assert!(node.is_leader());
        assert_eq!(node.term(), 1);
        assert!(matches!(
            effects.first(),
            Some(ElectionEffect::Broadcast(LeadershipMessage::Election(_)))
        ));
    }

    #[test]
    fn test_majority_counts_self() {
        let node = LeaderElectionBuilder::new("a").peer_count(0).build(0);
        assert_eq!(node.majority(), 1);
        let node = LeaderElectionBuilder::new("a").peer_count(1).build(0);
        assert_eq!(node.majority(), 2);
        let node = LeaderElectionBuilder::new("a").peer_count(2).build(0);
        assert_eq!(node.majority(), 2);
        let node = LeaderElectionBuilder::new("a").peer_count(4).build(0);
        assert_eq!(node.majority(), 3);
    }

    #[test]
    fn test_votes_once_per_term() {
        let mut voter = LeaderElectionBuilder::new("v").network("net").peer_count(2).build(0);
        let request = |candidate: &str| {
            LeadershipMessage::Election(ElectionRequest {
                candidate_id: candidate.into(),
                term: 1,
                network_id: "net".into(),
                timestamp: 0,
            })
        };

        let first = voter.handle_message(request("a"), 10);
        assert_eq!(first.len(), 1);
        assert!(matches!(&first[0], ElectionEffect::SendTo { peer, .. } if peer == "a"));

        let second = voter.handle_message(request("b"), 20);
        assert!(second.is_empty());
        assert_eq!(voter.term(), 1);
    }

    #[test]
    fn test_candidate_does_not_vote_in_own_term() {
        let mut node = LeaderElectionBuilder::new("a").network("net").peer_count(2).build(0);
        node.start_election(0);
        let effects = node.handle_message(
            LeadershipMessage::Election(ElectionRequest {
                candidate_id: "b".into(),
                term: 1,
                network_id: "net".into(),
                timestamp: 0,
            }),
            5,
        );
        assert!(effects.is_empty());
        assert_eq!(node.role(), LeadershipRole::Candidate);
    }

    #[test]
    fn test_foreign_network_ignored() {
        let mut node = LeaderElectionBuilder::new("a").network("net").peer_count(1).build(0);
        let effects = node.handle_message(
            LeadershipMessage::Election(ElectionRequest {
                candidate_id: "b".into(),
                term: 5,
                network_id: "other".into(),
                timestamp: 0,
            }),
            5,
        );
        assert!(effects.is_empty());
        assert_eq!(node.term(), 0);

        node.handle_message(
            LeadershipMessage::Heartbeat(Heartbeat {
                leader_id: "b".into(),
                term: 5,
                pending_transactions: 0,
                block_height: 0,
                network_id: Some("other".into()),
            }),
            6,
        );
        assert_eq!(node.current_leader(), None);
    }

    #[test]
    fn test_vote_for_wrong_term_not_counted() {
        let mut node = LeaderElectionBuilder::new("a").network("net").peer_count(2).build(0);
        node.start_election(0);
        node.handle_message(
            LeadershipMessage::Vote(Vote {
                voter_id: "b".into(),
                candidate_id: "a".into(),
                term: 7,
                network_id: None,
            }),
            1,
        );
        assert_eq!(node.role(), LeadershipRole::Candidate);

        let effects = node.handle_message(
            LeadershipMessage::Vote(Vote {
                voter_id: "b".into(),
                candidate_id: "a".into(),
                term: 1,
                network_id: None,
            }),
            2,
        );
        assert!(node.is_leader());
        assert!(effects.contains(&ElectionEffect::BecameLeader { term: 1 }));
    }

    #[test]
    fn test_lost_election_reverts_to_follower() {
        let mut node = LeaderElectionBuilder::new("a").network("net").peer_count(2).seed(3).build(0);
        node.start_election(0);
        node.on_tick(4_000);
        assert_eq!(node.role(), LeadershipRole::Follower);
        let status = node.status(4_000);
        assert_eq!(status.history.last().map(|r| r.outcome), Some(ElectionOutcome::Lost));
        assert_eq!(status.metrics.elections_started, 1);
        assert_eq!(status.metrics.elections_won, 0);
    }

    #[test]
    fn test_leader_yields_to_newer_term() {
        let mut node = LeaderElectionBuilder::new("a").network("net").build(0);
        node.start_election(0);
        assert!(node.is_leader());

        let heartbeat = |term| {
            LeadershipMessage::Heartbeat(Heartbeat {
                leader_id: "b".into(),
                term,
                pending_transactions: 0,
                block_height: 0,
                network_id: None,
            })
        };

        assert!(node.handle_message(heartbeat(1), 100).is_empty());
        assert!(node.is_leader());

        let effects = node.handle_message(heartbeat(2), 1_100);
        assert!(effects.contains(&ElectionEffect::SteppedDown { term: 1 }));
        assert_eq!(node.role(), LeadershipRole::Follower);
        assert_eq!(node.current_leader(), Some("b"));
        assert_eq!(node.term(), 2);
        assert_eq!(node.metrics(1_100).total_leadership_ms, 1_100);
    }

    #[test]
    fn test_same_term_leaders_keep_lower_id() {
        let announce = |leader: &str| {
            LeadershipMessage::Announcement(Announcement {
                leader_id: leader.into(),
                term: 1,
                network_id: Some("net".into()),
            })
        };

        let mut low = LeaderElectionBuilder::new("a").network("net").build(0);
        let mut high = LeaderElectionBuilder::new("b").network("net").build(0);
        low.on_tick(2_000);
        high.on_tick(2_000);
        assert!(low.is_leader() && high.is_leader());
        assert_eq!((low.term(), high.term()), (1, 1));

        assert!(low.handle_message(announce("b"), 2_100).is_empty());
        assert!(low.is_leader());

        let effects = high.handle_message(announce("a"), 2_100);
        assert!(effects.contains(&ElectionEffect::SteppedDown { term: 1 }));
        assert!(!high.is_leader());
        assert_eq!(high.current_leader(), Some("a"));
        assert_eq!(high.term(), 1);
    }

    #[test]
    fn test_leader_sends_heartbeats() {
        let mut node = LeaderElectionBuilder::new("a").network("net").build(0);
        node.start_election(0);
        node.observe_ledger(3, 9);

        let effects = node.on_tick(3_000);
        let heartbeat = effects.iter().find_map(|e| match e {
            ElectionEffect::Broadcast(LeadershipMessage::Heartbeat(hb)) => Some(hb.clone()),
            _ => None,
        });
        let heartbeat = heartbeat.unwrap();
        assert_eq!(heartbeat.term, 1);
        assert_eq!(heartbeat.pending_transactions, 3);
        assert_eq!(heartbeat.block_height, 9);
    }

    #[test]
    fn test_silent_leader_triggers_election() {
        let mut node = LeaderElectionBuilder::new("a").network("net").peer_count(2).seed(1).build(0);
        node.handle_message(
            LeadershipMessage::Announcement(Announcement {
                leader_id: "b".into(),
                term: 3,
                network_id: None,
            }),
            0,
        );
        assert_eq!(node.current_leader(), Some("b"));

        // Liveness fires every 4s, election timeout is at least 6s, keep
        // the leader alive with heartbeats until 8s, then go silent.
        for t in [2_000, 4_000, 6_000, 8_000] {
            node.handle_message(
                LeadershipMessage::Heartbeat(Heartbeat {
                    leader_id: "b".into(),
                    term: 3,
                    pending_transactions: 0,
                    block_height: 0,
                    network_id: None,
                }),
                t,
            );
            node.on_tick(t);
            assert_eq!(node.role(), LeadershipRole::Follower);
        }

        let mut now = 8_000;
        while node.role() == LeadershipRole::Follower && now < 30_000 {
            now += 100;
            node.on_tick(now);
        }
        assert_eq!(node.role(), LeadershipRole::Candidate);
        assert_eq!(node.term(), 4);
    }

    #[test]
    fn test_restarting_election_rearms_single_timer() {
        let mut node = LeaderElectionBuilder::new("a").network("net").peer_count(2).seed(9).build(0);
        node.start_election(0);
        node.start_election(1_000);
        // Result check from the first election must not fire at 4s
        node.on_tick(4_000);
        assert_eq!(node.role(), LeadershipRole::Candidate);
        assert_eq!(node.term(), 2);
        node.on_tick(5_000);
        assert_eq!(node.role(), LeadershipRole::Follower);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut node = LeaderElectionBuilder::new("a").network("net").peer_count(2).build(0);
        for i in 0..8 {
            node.start_election(i * 10);
        }
        let status = node.status(100);
        assert_eq!(status.history.len(), 5);
        assert_eq!(status.history.last().map(|r| r.term), Some(8));
    }

    #[test]
    fn test_cluster_elects_one_leader() {
        let mut cluster = Cluster::new(3);
        cluster.run_until(60_000);
        cluster.assert_single_leader_per_term();
        cluster.assert_converged();
    }

    #[test]
    fn test_concurrent_candidates_converge() {
        let mut cluster = Cluster::new(3);
        let a = cluster.nodes[0].start_election(0);
        let b = cluster.nodes[1].start_election(0);
        cluster.deliver(0, a);
        cluster.deliver(1, b);

        cluster.run_until(40_000);
        cluster.assert_single_leader_per_term();
        cluster.assert_converged();
    }

    #[test]
    fn test_split_vote_resolves_with_retries() {
        let mut cluster = Cluster::new(2);
        let a = cluster.nodes[0].start_election(0);
        let b = cluster.nodes[1].start_election(0);
        cluster.deliver(0, a);
        cluster.deliver(1, b);
        assert!(cluster.leaders().is_empty());

        cluster.run_until(60_000);
        cluster.assert_single_leader_per_term();
        cluster.assert_converged();
        assert!(cluster.nodes[0].term() >= 2);
    }

    #[test]
    fn test_leader_failover() {
        let mut cluster = Cluster::new(3);
        cluster.run_until(20_000);
        cluster.assert_converged();
        let old = cluster.leaders()[0].node_id().to_string();
        let old_idx = cluster.index_of(&old).unwrap();

        // Drop the leader from the cluster
        let removed = cluster.nodes.remove(old_idx);
        assert!(removed.is_leader());

        cluster.run_until(60_000);
        cluster.assert_single_leader_per_term();
        let leaders = cluster.leaders();
        assert_eq!(leaders.len(), 1);
        assert_ne!(leaders[0].node_id(), old);
        assert!(leaders[0].term() > removed.term());
    }
}
