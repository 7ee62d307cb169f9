//! Node coordinator
//!
//! [`MeshNode`] owns the ledger, the order book and the election state and is
//! the only place they are mutated. It is driven either synchronously (tests,
//! simulations) or as a single tokio task fed by channels, see [`MeshNode::spawn`].
//! Each handler runs to completion before the next input is taken.

use crate::clock::Clock;
use crate::error::NodeError;
use crate::message::{OrderTransaction, PeerMessage, RelayMessage, SyncData};
use crate::relay::{ConnectionStatus, RelayEvent, RelayEventReceiver, RelayHandle};
use crate::transport::{EventReceiver, Transport, TransportEvent};
use mesh_consensus::{
    ElectionConfig, ElectionEffect, LeaderElection, LeaderElectionBuilder, LeadershipStatus,
};
use mesh_exchange::{
    BookView, EngineSnapshot, EnterpriseBook, OrderMatchingEngine, Placement, DEFAULT_TRADE_CAPACITY,
};
use mesh_ledger::{Ledger, LedgerSnapshot, LedgerStats, SnapshotMeta, SnapshotStore};
use mesh_types::{
    short_id, unique_id, Block, CrossNetworkTradeNotice, NodeId, OrderCall, OrderFunction, Side,
    Trade, TradeExecution, Transaction, TransactionKind, TxId, TRADING_CONTRACT_ID,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const COMMAND_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshNodeConfig {
    pub node_id: NodeId,
    pub network_id: String,
    pub election: ElectionConfig,
    /// Fixed jitter seed, entropy when unset
    pub election_seed: Option<u64>,
    pub tick_interval_ms: u64,
    /// 0 saves only on shutdown
    pub save_interval_secs: u64,
    pub trade_capacity: usize,
}

impl Default for MeshNodeConfig {
    fn default() -> Self {
        Self {
            node_id: unique_id("node"),
            network_id: "default".to_string(),
            election: ElectionConfig::default(),
            election_seed: None,
            tick_interval_ms: 250,
            save_interval_secs: 30,
            trade_capacity: DEFAULT_TRADE_CAPACITY,
        }
    }
}

/// Everything `getStatus` reports
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub network_id: String,
    pub connection: ConnectionStatus,
    pub peers: Vec<NodeId>,
    /// Relay messages waiting for a reconnect
    pub relay_pending: usize,
    pub leadership: LeadershipStatus,
    pub ledger: LedgerStats,
    pub resting_orders: usize,
    pub latest_block_hash: String,
}

pub struct MeshNode {
    config: MeshNodeConfig,
    transport: Arc<dyn Transport>,
    relay: RelayHandle,
    clock: Arc<dyn Clock>,
    store: Option<SnapshotStore>,
    ledger: Ledger,
    engine: OrderMatchingEngine,
    election: LeaderElection,
}

impl MeshNode {
    pub fn new(
        config: MeshNodeConfig,
        transport: Arc<dyn Transport>,
        relay: RelayHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_ms();
        let election = build_election(&config, transport.peer_count(), now);
        tracing::info!("Node {} starting on network {}", config.node_id, config.network_id);
        Self {
            ledger: Ledger::new(config.node_id.clone()),
            engine: OrderMatchingEngine::new(config.trade_capacity),
            election,
            config,
            transport,
            relay,
            clock,
            store: None,
        }
    }

    /// Attach a snapshot store, used by save/load and network switches
    pub fn with_store(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn network_id(&self) -> &str {
        &self.config.network_id
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn engine(&self) -> &OrderMatchingEngine {
        &self.engine
    }

    pub fn election(&self) -> &LeaderElection {
        &self.election
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    // ---- inputs ----

    /// Drive election timers, called on every tick
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();
        self.election.set_peer_count(self.transport.peer_count());
        self.observe_ledger();
        let effects = self.election.on_tick(now);
        self.apply_effects(effects);
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected(peer) => {
                tracing::info!("Peer {} joined ({} connected)", peer, self.transport.peer_count());
                self.election.set_peer_count(self.transport.peer_count());
                let request = self.sync_request();
                self.send_to(&peer, &request);
            }
            TransportEvent::PeerDisconnected(peer) => {
                tracing::info!("Peer {} left ({} connected)", peer, self.transport.peer_count());
                self.election.set_peer_count(self.transport.peer_count());
            }
            TransportEvent::Message { from, message } => self.handle_peer_message(&from, message),
        }
    }

    pub fn handle_peer_message(&mut self, from: &str, message: PeerMessage) {
        tracing::debug!("{} from {}", message.kind(), short_id(from));

        if let PeerMessage::LeadershipHeartbeat(hb) = &message {
            // Single-block catch-up when the leader is exactly ahead
            let same_network = hb.network_id.as_deref().map_or(true, |n| n == self.config.network_id);
            if same_network && hb.block_height > self.ledger.height() {
                let request = self.sync_request();
                self.send_to(from, &request);
            }
        }

        let message = match message.into_leadership() {
            Ok(leadership) => {
                let effects = self.election.handle_message(leadership, self.clock.now_ms());
                self.apply_effects(effects);
                return;
            }
            Err(other) => other,
        };

        match message {
            PeerMessage::BlockchainBlock { block, .. } => self.on_block(block, Some(from)),
            PeerMessage::SyncRequest { current_height, .. } => self.on_sync_request(from, current_height),
            PeerMessage::OrderTransaction(order) => self.on_order_transaction(order, Some(from)),
            PeerMessage::TradeExecution { trade, .. } => self.on_trade_execution(trade, Some(from)),
            PeerMessage::CrossNetworkTrade(notice) => self.on_cross_network_trade(notice),
            PeerMessage::Transaction { transaction, .. } => self.on_transaction(transaction, Some(from)),
            PeerMessage::Hello { .. } => {}
            PeerMessage::LeadershipElection(_)
            | PeerMessage::LeadershipVote(_)
            | PeerMessage::LeadershipHeartbeat(_)
            | PeerMessage::LeadershipAnnouncement(_) => {}
        }
    }

    pub fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected => tracing::info!("Relay connected"),
            RelayEvent::Disconnected => tracing::warn!("Relay disconnected, continuing with direct peers"),
            RelayEvent::GaveUp => tracing::warn!("Relay unreachable, running peer-to-peer only"),
            RelayEvent::Message(message) => self.handle_relay_message(message),
        }
    }

    pub fn handle_relay_message(&mut self, message: RelayMessage) {
        match message {
            RelayMessage::NetworkInfo { network_id, peer_count } => {
                tracing::info!("Relay assigned network {} ({} peers)", network_id, peer_count);
                if network_id != self.config.network_id {
                    self.switch_network(network_id);
                }
            }
            RelayMessage::NetworkListUpdate { networks } => {
                tracing::debug!("Relay knows {} networks", networks.len());
            }
            RelayMessage::Peers { peers } => {
                for address in &peers {
                    self.transport.connect(address);
                }
                let request = self.sync_request();
                self.transport.broadcast(&request, None);
            }
            RelayMessage::Block { block } => self.on_block(block, None),
            RelayMessage::Transaction { transaction } => self.on_transaction(transaction, None),
            RelayMessage::EnterpriseSync { sync_data } => match sync_data {
                SyncData::OrderBookUpdate(book) => self.engine.update_enterprise_book(book),
                SyncData::TradeExecution { trade } => self.on_trade_execution(trade, None),
            },
            RelayMessage::CrossNetworkTrade(notice) => self.on_cross_network_trade(notice),
            RelayMessage::JoinNetwork { .. } | RelayMessage::Unknown => {}
        }
    }

    // ---- local actions ----

    /// Match a new order locally and replicate it
    pub fn place_order(
        &mut self,
        side: Side,
        trader: &str,
        asset: &str,
        quantity: u64,
        price: u64,
    ) -> Result<Placement, NodeError> {
        let now = self.clock.now_ms();
        let order_id = unique_id("order");
        let placement = self
            .engine
            .place_with_id(&order_id, side, trader, asset, quantity, price, now)?
            .ok_or_else(|| NodeError::DuplicateOrder(order_id.clone()))?;

        tracing::info!(
            "Placed {:?} {} for {} {} @ {}: {} trades",
            side,
            order_id,
            quantity,
            asset,
            price,
            placement.trades.len()
        );

        let call = OrderCall {
            function: side.into(),
            asset: asset.to_string(),
            quantity,
            price,
            order_id: Some(order_id.clone()),
            caller: trader.to_string(),
            contract_id: TRADING_CONTRACT_ID.to_string(),
            state_changes: self.book_state(),
        };
        let call_tx = Transaction::order_call(call, now);
        let mirror = Transaction::order_mirror(&order_id, side, trader, asset, quantity, price, now);

        self.ledger.add_transaction(call_tx.clone());
        self.ledger.add_transaction(mirror);

        let order = PeerMessage::OrderTransaction(OrderTransaction {
            action: side,
            trader: trader.to_string(),
            asset: asset.to_string(),
            quantity,
            price,
            order_id,
            timestamp: now,
        });
        self.transport.broadcast(&order, None);
        self.gossip_transaction(call_tx, None);

        self.mine_if_leader();
        Ok(placement)
    }

    /// Cancel a resting order owned by `trader`
    pub fn cancel_order(&mut self, order_id: &str, trader: &str) -> bool {
        if !self.engine.cancel(order_id, trader) {
            return false;
        }

        let call = OrderCall {
            function: OrderFunction::Cancel,
            asset: String::new(),
            quantity: 0,
            price: 0,
            order_id: Some(order_id.to_string()),
            caller: trader.to_string(),
            contract_id: TRADING_CONTRACT_ID.to_string(),
            state_changes: self.book_state(),
        };
        let tx = Transaction::order_call(call, self.clock.now_ms());
        if self.ledger.add_transaction(tx.clone()) {
            self.gossip_transaction(tx, None);
        }
        self.mine_if_leader();
        true
    }

    /// Queue a chat message and replicate it
    pub fn send_message(&mut self, content: &str, sender: &str) -> Option<TxId> {
        let mut tx = Transaction::message(content, sender);
        tx.timestamp = self.clock.now_ms();
        let id = tx.id.clone();
        if !self.ledger.add_transaction(tx.clone()) {
            return None;
        }
        self.gossip_transaction(tx, None);
        self.mine_if_leader();
        Some(id)
    }

    /// Start an election now, returns the term stood for
    pub fn force_election(&mut self) -> u64 {
        let effects = self.election.force_election(self.clock.now_ms());
        self.apply_effects(effects);
        self.election.term()
    }

    pub fn step_down(&mut self) {
        let effects = self.election.step_down(self.clock.now_ms());
        self.apply_effects(effects);
    }

    // ---- queries ----

    pub fn latest_block(&self) -> Block {
        self.ledger.latest_block().clone()
    }

    pub fn order_book(&self, asset: Option<&str>) -> BookView {
        self.engine.order_book(asset)
    }

    pub fn recent_trades(&self, asset: Option<&str>, limit: usize) -> Vec<Trade> {
        self.engine.recent_trades(asset, limit)
    }

    pub fn enterprise_book(&self, asset: &str) -> Option<EnterpriseBook> {
        self.engine.enterprise_book(asset).cloned()
    }

    pub fn status(&self) -> NodeStatus {
        let peers = self.transport.connected_peers();
        NodeStatus {
            node_id: self.config.node_id.clone(),
            network_id: self.config.network_id.clone(),
            connection: ConnectionStatus::from_parts(self.relay.is_connected(), peers.len()),
            relay_pending: self.relay.pending_count(),
            peers,
            leadership: self.election.status(self.clock.now_ms()),
            ledger: self.ledger.stats(),
            resting_orders: self.engine.resting_count(),
            latest_block_hash: self.ledger.latest_block().hash.clone(),
        }
    }

    // ---- persistence ----

    /// Full node state: ledger plus term and order book
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut snapshot = self.ledger.snapshot();
        snapshot.leadership_term = self.election.term();
        match serde_json::to_value(self.engine.snapshot()) {
            Ok(book) => snapshot.order_book = Some(book),
            Err(e) => tracing::error!("Failed to encode order book: {}", e),
        }
        snapshot
    }

    /// Hydrate from a snapshot, nothing is re-validated
    pub fn restore(&mut self, snapshot: LedgerSnapshot) {
        if let Some(book) = snapshot.order_book.clone() {
            match serde_json::from_value::<EngineSnapshot>(book) {
                Ok(book) => self.engine.restore(book),
                Err(e) => tracing::warn!("Ignoring unreadable order book in snapshot: {}", e),
            }
        }
        tracing::info!(
            "Restored {} blocks and {} pending transactions (saved at term {})",
            snapshot.chain.len(),
            snapshot.pending.len(),
            snapshot.leadership_term
        );
        self.ledger.restore(snapshot);
        self.observe_ledger();
    }

    pub fn save_snapshot(&self) -> Result<Option<SnapshotMeta>, NodeError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let meta = store.save(&self.config.network_id, &self.snapshot())?;
        tracing::debug!("Saved snapshot of {} at height {}", self.config.network_id, meta.height);
        Ok(Some(meta))
    }

    /// Load the current network's snapshot, false when there is none
    pub fn load_snapshot(&mut self) -> Result<bool, NodeError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        match store.load(&self.config.network_id)? {
            Some(snapshot) => {
                self.restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn persist(&self) {
        if let Err(e) = self.save_snapshot() {
            tracing::error!("Failed to save snapshot: {}", e);
        }
    }

    /// Leave the current network for `network_id`, keeping each one's state
    fn switch_network(&mut self, network_id: String) {
        tracing::info!("Switching from network {} to {}", self.config.network_id, network_id);
        self.persist();

        let now = self.clock.now_ms();
        self.config.network_id = network_id;
        self.transport.set_network(&self.config.network_id);
        self.ledger = Ledger::new(self.config.node_id.clone());
        self.engine = OrderMatchingEngine::new(self.config.trade_capacity);
        self.election = build_election(&self.config, self.transport.peer_count(), now);

        if let Err(e) = self.load_snapshot() {
            tracing::error!("Failed to load snapshot for {}: {}", self.config.network_id, e);
        }
    }

    // ---- protocol ----

    fn on_block(&mut self, block: Block, from: Option<&str>) {
        if !self.ledger.add_block(block.clone()) {
            return;
        }
        self.replay_block(&block);
        self.observe_ledger();

        let message = PeerMessage::BlockchainBlock {
            block,
            sender: self.config.node_id.clone(),
        };
        self.transport.broadcast(&message, from);
    }

    /// Apply a block's order and trade records to the book
    fn replay_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            match &tx.kind {
                TransactionKind::OrderCall(call) => self.apply_order_call(call, tx.timestamp),
                TransactionKind::TradeExecution { trade } => {
                    self.engine
                        .execute_cross_network_trade(trade, &self.config.network_id);
                }
                TransactionKind::CrossNetworkTradeNotice { notice } => {
                    let trade = TradeExecution::from(notice.clone());
                    self.engine
                        .execute_cross_network_trade(&trade, &self.config.network_id);
                }
                TransactionKind::Message { .. } => {}
            }
        }
    }

    fn apply_order_call(&mut self, call: &OrderCall, timestamp: u64) {
        let Some(order_id) = call.order_id.as_deref() else {
            return;
        };
        match call.function.side() {
            Some(side) => {
                if let Err(e) = self.engine.place_with_id(
                    order_id,
                    side,
                    &call.caller,
                    &call.asset,
                    call.quantity,
                    call.price,
                    timestamp,
                ) {
                    tracing::warn!("Skipping invalid order call {}: {}", order_id, e);
                }
            }
            None => {
                self.engine.cancel(order_id, &call.caller);
            }
        }
    }

    fn on_sync_request(&mut self, from: &str, their_height: u64) {
        if self.ledger.height() <= their_height {
            return;
        }
        tracing::debug!(
            "{} is at height {}, sending block {}",
            short_id(from),
            their_height,
            self.ledger.height()
        );
        let reply = PeerMessage::BlockchainBlock {
            block: self.ledger.latest_block().clone(),
            sender: self.config.node_id.clone(),
        };
        self.send_to(from, &reply);
    }

    fn on_order_transaction(&mut self, order: OrderTransaction, from: Option<&str>) {
        if self.engine.has_applied(&order.order_id) {
            return;
        }
        let timestamp = if order.timestamp > 0 {
            order.timestamp
        } else {
            self.clock.now_ms()
        };

        match self.engine.place_with_id(
            &order.order_id,
            order.action,
            &order.trader,
            &order.asset,
            order.quantity,
            order.price,
            timestamp,
        ) {
            Ok(Some(placement)) => tracing::debug!(
                "Replicated order {}: {} trades, {} resting",
                order.order_id,
                placement.trades.len(),
                placement.remaining
            ),
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Rejected order {}: {}", order.order_id, e);
                return;
            }
        }

        let mirror = Transaction::order_mirror(
            &order.order_id,
            order.action,
            &order.trader,
            &order.asset,
            order.quantity,
            order.price,
            timestamp,
        );
        self.ledger.add_transaction_from_peer(mirror);
        self.observe_ledger();

        self.transport
            .broadcast(&PeerMessage::OrderTransaction(order), from);
    }

    fn on_trade_execution(&mut self, trade: TradeExecution, from: Option<&str>) {
        let outcome = self
            .engine
            .execute_cross_network_trade(&trade, &self.config.network_id);
        if !outcome.is_applied() {
            return;
        }

        self.ledger
            .add_transaction(Transaction::trade_execution(trade.clone()));
        self.mine_if_leader();

        let message = PeerMessage::TradeExecution {
            trade,
            sender: self.config.node_id.clone(),
        };
        self.transport.broadcast(&message, from);
    }

    /// Reconcile only, never forwarded
    fn on_cross_network_trade(&mut self, notice: CrossNetworkTradeNotice) {
        let trade = TradeExecution::from(notice.clone());
        let outcome = self
            .engine
            .execute_cross_network_trade(&trade, &self.config.network_id);
        if outcome.is_applied() && self.election.is_leader() {
            self.ledger
                .add_transaction(Transaction::cross_network_notice(notice));
            self.mine_if_leader();
        }
    }

    fn on_transaction(&mut self, tx: Transaction, from: Option<&str>) {
        if !self.ledger.add_transaction_from_peer(tx.clone()) {
            return;
        }
        if let TransactionKind::OrderCall(call) = &tx.kind {
            self.apply_order_call(call, tx.timestamp);
        }
        self.observe_ledger();
        self.gossip_transaction(tx, from);
    }

    fn gossip_transaction(&self, transaction: Transaction, except: Option<&str>) {
        let message = PeerMessage::Transaction {
            transaction,
            sender: self.config.node_id.clone(),
        };
        self.transport.broadcast(&message, except);
    }

    fn apply_effects(&mut self, effects: Vec<ElectionEffect>) {
        for effect in effects {
            match effect {
                ElectionEffect::Broadcast(message) => {
                    self.transport.broadcast(&PeerMessage::from(message), None);
                }
                ElectionEffect::SendTo { peer, message } => {
                    self.send_to(&peer, &PeerMessage::from(message));
                }
                ElectionEffect::BecameLeader { term } => {
                    tracing::info!("Mining enabled for term {}", term);
                    self.ledger.set_mining_authorized(true);
                }
                ElectionEffect::SteppedDown { term } => {
                    tracing::info!("Mining disabled after term {}", term);
                    self.ledger.set_mining_authorized(false);
                }
                ElectionEffect::MineRequested => self.mine_if_leader(),
            }
        }
    }

    fn mine_if_leader(&mut self) {
        if !self.election.is_leader() {
            return;
        }
        let Some(block) = self.ledger.mine_block(self.clock.now_ms()) else {
            return;
        };
        self.replay_block(&block);
        self.observe_ledger();

        let message = PeerMessage::BlockchainBlock {
            block: block.clone(),
            sender: self.config.node_id.clone(),
        };
        let delivered = self.transport.broadcast(&message, None);
        tracing::debug!("Block {} sent to {} peers", block.height, delivered);
        self.relay.send(RelayMessage::Block { block });
    }

    fn send_to(&self, peer: &str, message: &PeerMessage) {
        if let Err(e) = self.transport.send(peer, message) {
            tracing::warn!("Failed to send {} to {}: {}", message.kind(), peer, e);
        }
    }

    fn sync_request(&self) -> PeerMessage {
        PeerMessage::SyncRequest {
            current_height: self.ledger.height(),
            sender: self.config.node_id.clone(),
        }
    }

    fn observe_ledger(&mut self) {
        self.election
            .observe_ledger(self.ledger.pending_count(), self.ledger.height());
    }

    fn book_state(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self.engine.order_book(None)).ok()
    }

    // ---- actor ----

    /// Run the node on its own task
    pub fn spawn(self, transport_rx: EventReceiver, relay_rx: RelayEventReceiver) -> (NodeHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(self.run(rx, transport_rx, relay_rx));
        (NodeHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<NodeCommand>,
        mut transport_rx: EventReceiver,
        mut relay_rx: RelayEventReceiver,
    ) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let saving = self.config.save_interval_secs > 0;
        let mut save = tokio::time::interval(Duration::from_secs(self.config.save_interval_secs.max(1)));
        save.set_missed_tick_behavior(MissedTickBehavior::Skip);
        save.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = transport_rx.recv() => self.handle_transport_event(event),
                Some(event) = relay_rx.recv() => self.handle_relay_event(event),
                _ = tick.tick() => self.tick(),
                _ = save.tick(), if saving => self.persist(),
            }
        }

        self.persist();
        tracing::info!("Node {} stopped", self.config.node_id);
    }

    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::PlaceOrder {
                side,
                trader,
                asset,
                quantity,
                price,
                reply,
            } => {
                let _ = reply.send(self.place_order(side, &trader, &asset, quantity, price));
            }
            NodeCommand::CancelOrder { order_id, trader, reply } => {
                let _ = reply.send(self.cancel_order(&order_id, &trader));
            }
            NodeCommand::SendMessage { content, sender, reply } => {
                let _ = reply.send(self.send_message(&content, &sender));
            }
            NodeCommand::ForceElection { reply } => {
                let _ = reply.send(self.force_election());
            }
            NodeCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            NodeCommand::LatestBlock { reply } => {
                let _ = reply.send(self.latest_block());
            }
            NodeCommand::OrderBook { asset, reply } => {
                let _ = reply.send(self.order_book(asset.as_deref()));
            }
            NodeCommand::RecentTrades { asset, limit, reply } => {
                let _ = reply.send(self.recent_trades(asset.as_deref(), limit));
            }
            NodeCommand::EnterpriseBook { asset, reply } => {
                let _ = reply.send(self.enterprise_book(&asset));
            }
            NodeCommand::Save { reply } => {
                let _ = reply.send(self.save_snapshot());
            }
            NodeCommand::Shutdown => {}
        }
    }
}

fn build_election(config: &MeshNodeConfig, peer_count: usize, now_ms: u64) -> LeaderElection {
    let mut builder = LeaderElectionBuilder::new(config.node_id.clone())
        .network(config.network_id.clone())
        .config(config.election.clone())
        .peer_count(peer_count);
    if let Some(seed) = config.election_seed {
        builder = builder.seed(seed);
    }
    builder.build(now_ms)
}

/// Requests served by the node task
pub enum NodeCommand {
    PlaceOrder {
        side: Side,
        trader: String,
        asset: String,
        quantity: u64,
        price: u64,
        reply: oneshot::Sender<Result<Placement, NodeError>>,
    },
    CancelOrder {
        order_id: String,
        trader: String,
        reply: oneshot::Sender<bool>,
    },
    SendMessage {
        content: String,
        sender: String,
        reply: oneshot::Sender<Option<TxId>>,
    },
    ForceElection {
        reply: oneshot::Sender<u64>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    LatestBlock {
        reply: oneshot::Sender<Block>,
    },
    OrderBook {
        asset: Option<String>,
        reply: oneshot::Sender<BookView>,
    },
    RecentTrades {
        asset: Option<String>,
        limit: usize,
        reply: oneshot::Sender<Vec<Trade>>,
    },
    EnterpriseBook {
        asset: String,
        reply: oneshot::Sender<Option<EnterpriseBook>>,
    },
    Save {
        reply: oneshot::Sender<Result<Option<SnapshotMeta>, NodeError>>,
    },
    Shutdown,
}

/// Cloneable front door to a running node
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<NodeCommand>,
}

impl NodeHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub async fn place_order(
        &self,
        side: Side,
        trader: String,
        asset: String,
        quantity: u64,
        price: u64,
    ) -> Result<Placement, NodeError> {
        self.request(|reply| NodeCommand::PlaceOrder {
            side,
            trader,
            asset,
            quantity,
            price,
            reply,
        })
        .await?
    }

    pub async fn cancel_order(&self, order_id: String, trader: String) -> Result<bool, NodeError> {
        self.request(|reply| NodeCommand::CancelOrder { order_id, trader, reply })
            .await
    }

    pub async fn send_message(&self, content: String, sender: String) -> Result<Option<TxId>, NodeError> {
        self.request(|reply| NodeCommand::SendMessage { content, sender, reply })
            .await
    }

    pub async fn force_election(&self) -> Result<u64, NodeError> {
        self.request(|reply| NodeCommand::ForceElection { reply }).await
    }

    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        self.request(|reply| NodeCommand::Status { reply }).await
    }

    pub async fn latest_block(&self) -> Result<Block, NodeError> {
        self.request(|reply| NodeCommand::LatestBlock { reply }).await
    }

    pub async fn order_book(&self, asset: Option<String>) -> Result<BookView, NodeError> {
        self.request(|reply| NodeCommand::OrderBook { asset, reply }).await
    }

    pub async fn recent_trades(&self, asset: Option<String>, limit: usize) -> Result<Vec<Trade>, NodeError> {
        self.request(|reply| NodeCommand::RecentTrades { asset, limit, reply })
            .await
    }

    pub async fn enterprise_book(&self, asset: String) -> Result<Option<EnterpriseBook>, NodeError> {
        self.request(|reply| NodeCommand::EnterpriseBook { asset, reply })
            .await
    }

    pub async fn save(&self) -> Result<Option<SnapshotMeta>, NodeError> {
        self.request(|reply| NodeCommand::Save { reply }).await?
    }

    /// Stop the node task, it saves once more on the way out
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.tx
            .send(NodeCommand::Shutdown)
            .await
            .map_err(|_| NodeError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::MemoryHub;
    use mesh_consensus::{Heartbeat, LeadershipRole};
    use tempfile::tempdir;

    fn solo(id: &str, clock: &ManualClock) -> (MeshNode, EventReceiver, mpsc::UnboundedReceiver<RelayMessage>) {
        let hub = MemoryHub::new();
        let (transport, rx) = hub.join(id);
        let (relay, relay_rx) = RelayHandle::channel();
        let config = MeshNodeConfig {
            node_id: id.to_string(),
            network_id: "net".to_string(),
            election_seed: Some(7),
            ..MeshNodeConfig::default()
        };
        let node = MeshNode::new(config, Arc::new(transport), relay, Arc::new(clock.clone()));
        (node, rx, relay_rx)
    }

    fn lead(node: &mut MeshNode, clock: &ManualClock) {
        clock.advance(2_000);
        node.tick();
        assert!(node.is_leader());
    }

    #[test]
    fn test_solo_node_takes_leadership() {
        let clock = ManualClock::new(1_000);
        let (mut node, _rx, _relay) = solo("a", &clock);
        assert_eq!(node.election().role(), LeadershipRole::Follower);

        lead(&mut node, &clock);
        assert_eq!(node.election().term(), 1);
        assert!(node.ledger().mining_authorized());
    }

    #[test]
    fn test_leader_mines_message_and_pushes_to_relay() {
        let clock = ManualClock::new(1_000);
        let (mut node, _rx, mut relay) = solo("a", &clock);
        lead(&mut node, &clock);

        let id = node.send_message("hello", "alice").unwrap();
        assert_eq!(node.ledger().height(), 1);
        assert_eq!(node.ledger().pending_count(), 0);
        assert_eq!(node.latest_block().transactions[0].id, id);

        match relay.try_recv() {
            Ok(RelayMessage::Block { block }) => assert_eq!(block.height, 1),
            other => panic!("expected block push, got {:?}", other),
        }
    }

    #[test]
    fn test_follower_does_not_mine() {
        let clock = ManualClock::new(1_000);
        let (mut node, _rx, _relay) = solo("a", &clock);
        node.send_message("hello", "alice");
        assert_eq!(node.ledger().height(), 0);
        assert_eq!(node.ledger().pending_count(), 1);
    }

    #[test]
    fn test_foreign_heartbeat_does_not_request_sync() {
        let clock = ManualClock::new(1_000);
        let hub = MemoryHub::new();
        let (transport, _rx) = hub.join("a");
        let (_remote, mut remote_rx) = hub.join("b");
        let (relay, _relay_rx) = RelayHandle::channel();
        let config = MeshNodeConfig {
            node_id: "a".to_string(),
            network_id: "net".to_string(),
            ..MeshNodeConfig::default()
        };
        let mut node = MeshNode::new(config, Arc::new(transport), relay, Arc::new(clock.clone()));
        while remote_rx.try_recv().is_ok() {}

        let heartbeat = |network: &str| {
            PeerMessage::LeadershipHeartbeat(Heartbeat {
                leader_id: "b".into(),
                term: 4,
                pending_transactions: 0,
                block_height: 1,
                network_id: Some(network.to_string()),
            })
        };
        let sync_requests = |rx: &mut EventReceiver| {
            let mut count = 0;
            while let Ok(event) = rx.try_recv() {
                if let TransportEvent::Message {
                    message: PeerMessage::SyncRequest { .. },
                    ..
                } = event
                {
                    count += 1;
                }
            }
            count
        };

        node.handle_peer_message("b", heartbeat("other"));
        assert_eq!(sync_requests(&mut remote_rx), 0);
        assert_eq!(node.election().current_leader(), None);

        node.handle_peer_message("b", heartbeat("net"));
        assert_eq!(sync_requests(&mut remote_rx), 1);
    }

    #[test]
    fn test_place_order_matches_and_records() {
        let clock = ManualClock::new(1_000);
        let (mut node, _rx, _relay) = solo("a", &clock);
        lead(&mut node, &clock);

        node.place_order(Side::Sell, "bob", "BTC", 600, 9_500).unwrap();
        let placement = node.place_order(Side::Buy, "alice", "BTC", 1_000, 10_000).unwrap();

        assert_eq!(placement.trades.len(), 1);
        assert_eq!(placement.trades[0].price, 9_500);
        assert_eq!(placement.remaining, 400);
        assert_eq!(node.ledger().height(), 2);
        assert!(node.ledger().contract_state(TRADING_CONTRACT_ID).is_some());
    }

    #[test]
    fn test_invalid_order_rejected() {
        let clock = ManualClock::new(1_000);
        let (mut node, _rx, _relay) = solo("a", &clock);
        let err = node.place_order(Side::Buy, "alice", "BTC", 0, 100).unwrap_err();
        assert!(matches!(err, NodeError::Exchange(_)));
        assert_eq!(node.ledger().pending_count(), 0);
    }

    #[test]
    fn test_cancel_requires_owner() {
        let clock = ManualClock::new(1_000);
        let (mut node, _rx, _relay) = solo("a", &clock);
        let placement = node.place_order(Side::Buy, "alice", "BTC", 100, 100).unwrap();

        assert!(!node.cancel_order(&placement.order_id, "mallory"));
        assert!(node.cancel_order(&placement.order_id, "alice"));
        assert_eq!(node.order_book(Some("BTC")).bids.len(), 0);
    }

    #[test]
    fn test_cross_network_notice_reconciled_once() {
        let clock = ManualClock::new(1_000);
        let (mut node, _rx, _relay) = solo("a", &clock);
        lead(&mut node, &clock);
        node.place_order(Side::Buy, "alice", "BTC", 500, 10_000).unwrap();

        let notice = CrossNetworkTradeNotice {
            trade_id: "x1".into(),
            asset: "BTC".into(),
            quantity: 500,
            price: 10_000,
            buyer_network: "net".into(),
            seller_network: "west".into(),
            timestamp: 5,
        };
        node.handle_relay_message(RelayMessage::CrossNetworkTrade(notice.clone()));
        node.handle_relay_message(RelayMessage::CrossNetworkTrade(notice));

        assert!(node.order_book(Some("BTC")).bids.is_empty());
        assert_eq!(node.recent_trades(Some("BTC"), 10).len(), 1);
        assert!(node.ledger().contains("xnet_x1"));
    }

    #[test]
    fn test_enterprise_book_update_stored() {
        let clock = ManualClock::new(1_000);
        let (mut node, _rx, _relay) = solo("a", &clock);
        let book = EnterpriseBook {
            asset: "ETH".into(),
            updated_at: 9,
            ..EnterpriseBook::default()
        };
        node.handle_relay_message(RelayMessage::EnterpriseSync {
            sync_data: SyncData::OrderBookUpdate(book.clone()),
        });
        assert_eq!(node.enterprise_book("ETH"), Some(book));
    }

    #[test]
    fn test_snapshot_roundtrip_through_store() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(1_000);

        let (node, _rx, _relay) = solo("a", &clock);
        let mut node = node.with_store(SnapshotStore::open(dir.path()).unwrap());
        lead(&mut node, &clock);
        node.send_message("one", "alice");
        node.place_order(Side::Buy, "alice", "BTC", 100, 100).unwrap();
        let meta = node.save_snapshot().unwrap().unwrap();
        assert_eq!(meta.height, node.ledger().height());
        drop(node);

        let (fresh, _rx, _relay) = solo("a", &clock);
        let mut fresh = fresh.with_store(SnapshotStore::open(dir.path()).unwrap());
        assert!(fresh.load_snapshot().unwrap());
        assert_eq!(fresh.ledger().height(), 2);
        assert_eq!(fresh.order_book(Some("BTC")).bids.len(), 1);
        // Term is not carried over
        assert_eq!(fresh.election().term(), 0);
    }

    #[test]
    fn test_network_switch_keeps_state_per_network() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(1_000);
        let (node, _rx, _relay) = solo("a", &clock);
        let mut node = node.with_store(SnapshotStore::open(dir.path()).unwrap());
        lead(&mut node, &clock);
        node.send_message("on net", "alice");
        assert_eq!(node.ledger().height(), 1);

        node.handle_relay_message(RelayMessage::NetworkInfo {
            network_id: "other".into(),
            peer_count: 0,
        });
        assert_eq!(node.network_id(), "other");
        assert_eq!(node.ledger().height(), 0);
        assert!(!node.is_leader());

        node.handle_relay_message(RelayMessage::NetworkInfo {
            network_id: "net".into(),
            peer_count: 0,
        });
        assert_eq!(node.ledger().height(), 1);
    }

    #[tokio::test]
    async fn test_handle_drives_spawned_node() {
        let hub = MemoryHub::new();
        let (transport, transport_rx) = hub.join("a");
        let (_relay_tx, relay_rx) = mpsc::unbounded_channel();
        let config = MeshNodeConfig {
            node_id: "a".into(),
            network_id: "net".into(),
            ..MeshNodeConfig::default()
        };
        let node = MeshNode::new(
            config,
            Arc::new(transport),
            RelayHandle::disabled(),
            Arc::new(crate::clock::SystemClock),
        );
        let (handle, task) = node.spawn(transport_rx, relay_rx);

        let term = handle.force_election().await.unwrap();
        assert_eq!(term, 1);
        let id = handle
            .send_message("hi".into(), "alice".into())
            .await
            .unwrap()
            .unwrap();
        let block = handle.latest_block().await.unwrap();
        assert_eq!(block.transactions[0].id, id);

        let status = handle.status().await.unwrap();
        assert!(status.leadership.is_leader);
        assert_eq!(status.connection, ConnectionStatus::Offline);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(handle.status().await, Err(NodeError::Stopped)));
    }
}
