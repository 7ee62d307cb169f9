//! Order matching engine

use crate::error::{ExchangeError, ExchangeResult};
use crate::reconcile::EnterpriseBook;
use mesh_types::{now_millis, unique_id, Order, Side, Trade};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Trades kept in the recent-trades log before the oldest are evicted
pub const DEFAULT_TRADE_CAPACITY: usize = 100;

/// Outcome of placing an order
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub order_id: String,
    /// Trades generated while matching, in match order
    pub trades: Vec<Trade>,
    /// Unfilled quantity left resting in the book
    pub remaining: u64,
}

impl Placement {
    pub fn filled(&self) -> u64 {
        self.trades.iter().map(|t| t.quantity).sum()
    }
}

/// Bids (best first) and asks (best first)
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BookView {
    pub bids: Vec<Order>,
    pub asks: Vec<Order>,
}

/// Serializable engine state, carried inside the ledger snapshot
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub bids: Vec<Order>,
    pub asks: Vec<Order>,
    pub trades: Vec<Trade>,
    #[serde(default)]
    pub applied_order_ids: Vec<String>,
    #[serde(default)]
    pub reconciled_trade_ids: Vec<String>,
    #[serde(default)]
    pub enterprise_books: HashMap<String, EnterpriseBook>,
}

/// Continuous double auction over all assets.
///
/// Books hold every asset, matching filters by asset. Bids are kept sorted
/// by descending price and asks by ascending price. An incoming order walks
/// the opposite book from the back, so within a price level the most recent
/// order trades first.
pub struct OrderMatchingEngine {
    pub(crate) bids: Vec<Order>,
    pub(crate) asks: Vec<Order>,
    /// Bounded log, oldest first
    pub(crate) trades: VecDeque<Trade>,
    trade_capacity: usize,
    /// Orders already applied, so replays from blocks are no-ops
    applied_order_ids: HashSet<String>,
    /// External trades already reconciled
    pub(crate) reconciled_trade_ids: HashSet<String>,
    /// Last order book pushed by the enterprise ledger, per asset
    pub(crate) enterprise_books: HashMap<String, EnterpriseBook>,
}

impl Default for OrderMatchingEngine {
    fn default() -> Self {
        Self::new(DEFAULT_TRADE_CAPACITY)
    }
}

impl OrderMatchingEngine {
    pub fn new(trade_capacity: usize) -> Self {
        Self {
            bids: Vec::new(),
            asks: Vec::new(),
            trades: VecDeque::with_capacity(trade_capacity),
            trade_capacity: trade_capacity.max(1),
            applied_order_ids: HashSet::new(),
            reconciled_trade_ids: HashSet::new(),
            enterprise_books: HashMap::new(),
        }
    }

    pub fn place_buy(
        &mut self,
        trader: &str,
        asset: &str,
        quantity: u64,
        price: u64,
    ) -> ExchangeResult<Placement> {
        self.place(Side::Buy, trader, asset, quantity, price)
    }

    pub fn place_sell(
        &mut self,
        trader: &str,
        asset: &str,
        quantity: u64,
        price: u64,
    ) -> ExchangeResult<Placement> {
        self.place(Side::Sell, trader, asset, quantity, price)
    }

    /// Place a new order under a freshly generated id
    pub fn place(
        &mut self,
        side: Side,
        trader: &str,
        asset: &str,
        quantity: u64,
        price: u64,
    ) -> ExchangeResult<Placement> {
        let order_id = unique_id("order");
        let placement = self.place_with_id(&order_id, side, trader, asset, quantity, price, now_millis())?;
        // A fresh id cannot have been applied before
        Ok(placement.unwrap_or(Placement {
            order_id,
            trades: Vec::new(),
            remaining: 0,
        }))
    }

    /// Apply an order whose id was assigned elsewhere.
    ///
    /// Returns `Ok(None)` if the order was already applied, which is what
    /// happens when an order seen on the wire is replayed from a block.
    #[allow(clippy::too_many_arguments)]
    pub fn place_with_id(
        &mut self,
        order_id: &str,
        side: Side,
        trader: &str,
        asset: &str,
        quantity: u64,
        price: u64,
        created_at: u64,
    ) -> ExchangeResult<Option<Placement>> {
        validate(trader, asset, quantity, price)?;

        if !self.applied_order_ids.insert(order_id.to_string()) {
            tracing::debug!("Order {} already applied", order_id);
            return Ok(None);
        }

        let mut order = Order {
            id: order_id.to_string(),
            side,
            asset: asset.to_string(),
            quantity,
            price,
            trader: trader.to_string(),
            created_at,
        };

        let trades = self.match_incoming(&mut order);
        for trade in &trades {
            self.record_trade(trade.clone());
        }

        let remaining = order.quantity;
        if remaining > 0 {
            self.rest(order);
        }

        tracing::debug!(
            "{:?} order {} for {} {} @ {}: {} trades, {} resting",
            side,
            order_id,
            quantity,
            asset,
            price,
            trades.len(),
            remaining
        );

        Ok(Some(Placement {
            order_id: order_id.to_string(),
            trades,
            remaining,
        }))
    }

    fn match_incoming(&mut self, incoming: &mut Order) -> Vec<Trade> {
        let book = match incoming.side {
            Side::Buy => &mut self.asks,
            Side::Sell => &mut self.bids,
        };

        let mut trades = Vec::new();
        let mut i = book.len();
        while i > 0 && incoming.quantity > 0 {
            i -= 1;
            let maker = &mut book[i];
            if maker.asset != incoming.asset {
                continue;
            }
            let crosses = match incoming.side {
                Side::Buy => incoming.price >= maker.price,
                Side::Sell => incoming.price <= maker.price,
            };
            if !crosses {
                continue;
            }

            let quantity = incoming.quantity.min(maker.quantity);
            let (buyer, seller) = match incoming.side {
                Side::Buy => (incoming.trader.clone(), maker.trader.clone()),
                Side::Sell => (maker.trader.clone(), incoming.trader.clone()),
            };

            // Trades at the maker's price
            trades.push(Trade {
                id: format!("trade_{}_{}", incoming.id, maker.id),
                asset: incoming.asset.clone(),
                quantity,
                price: maker.price,
                buyer,
                seller,
                timestamp: incoming.created_at,
                cross_network: false,
            });

            incoming.quantity -= quantity;
            maker.quantity -= quantity;
            if maker.quantity == 0 {
                book.remove(i);
            }
        }
        trades
    }

    fn rest(&mut self, order: Order) {
        match order.side {
            Side::Buy => {
                self.bids.push(order);
                self.bids.sort_by(|a, b| b.price.cmp(&a.price));
            }
            Side::Sell => {
                self.asks.push(order);
                self.asks.sort_by(|a, b| a.price.cmp(&b.price));
            }
        }
    }

    pub(crate) fn record_trade(&mut self, trade: Trade) {
        self.trades.push_back(trade);
        while self.trades.len() > self.trade_capacity {
            self.trades.pop_front();
        }
    }

    /// Remove `order_id` if `trader` owns it
    pub fn cancel(&mut self, order_id: &str, trader: &str) -> bool {
        for book in [&mut self.bids, &mut self.asks] {
            if let Some(pos) = book
                .iter()
                .position(|o| o.id == order_id && o.trader == trader)
            {
                book.remove(pos);
                tracing::debug!("Cancelled order {} for {}", order_id, trader);
                return true;
            }
        }
        false
    }

    /// Resting orders, optionally restricted to one asset
    pub fn order_book(&self, asset: Option<&str>) -> BookView {
        let keep = |o: &&Order| asset.map_or(true, |a| o.asset == a);
        BookView {
            bids: self.bids.iter().filter(keep).cloned().collect(),
            asks: self.asks.iter().filter(keep).cloned().collect(),
        }
    }

    /// Most recent trades first
    pub fn recent_trades(&self, asset: Option<&str>, limit: usize) -> Vec<Trade> {
        self.trades
            .iter()
            .rev()
            .filter(|t| asset.map_or(true, |a| t.asset == a))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn find_order(&self, order_id: &str) -> Option<&Order> {
        self.bids
            .iter()
            .chain(self.asks.iter())
            .find(|o| o.id == order_id)
    }

    pub fn has_applied(&self, order_id: &str) -> bool {
        self.applied_order_ids.contains(order_id)
    }

    pub fn resting_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let mut applied: Vec<String> = self.applied_order_ids.iter().cloned().collect();
        applied.sort();
        let mut reconciled: Vec<String> = self.reconciled_trade_ids.iter().cloned().collect();
        reconciled.sort();
        EngineSnapshot {
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            trades: self.trades.iter().cloned().collect(),
            applied_order_ids: applied,
            reconciled_trade_ids: reconciled,
            enterprise_books: self.enterprise_books.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: EngineSnapshot) {
        self.bids = snapshot.bids;
        self.asks = snapshot.asks;
        self.trades = snapshot.trades.into_iter().collect();
        while self.trades.len() > self.trade_capacity {
            self.trades.pop_front();
        }
        self.applied_order_ids = snapshot.applied_order_ids.into_iter().collect();
        for order in self.bids.iter().chain(self.asks.iter()) {
            self.applied_order_ids.insert(order.id.clone());
        }
        self.reconciled_trade_ids = snapshot.reconciled_trade_ids.into_iter().collect();
        self.enterprise_books = snapshot.enterprise_books;
    }
}

fn validate(trader: &str, asset: &str, quantity: u64, price: u64) -> ExchangeResult<()> {
    if asset.trim().is_empty() {
        return Err(ExchangeError::EmptyAsset);
    }
    if trader.trim().is_empty() {
        return Err(ExchangeError::EmptyTrader);
    }
    if quantity == 0 {
        return Err(ExchangeError::ZeroQuantity);
    }
    if price == 0 {
        return Err(ExchangeError::ZeroPrice);
    }
    Ok(())
}
