//! Cross-network reconciliation
//!
//! Trades settled on the enterprise ledger already happened, so they are
//! never matched again here. Reconciliation only shrinks or removes the
//! local resting order the trade consumed and shows the trade in the log.

use crate::engine::OrderMatchingEngine;
use mesh_types::{Order, Side, Trade, TradeExecution};
use serde::{Deserialize, Serialize};

/// External order book for one asset, as pushed by the enterprise ledger
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EnterpriseBook {
    pub asset: String,
    #[serde(default)]
    pub bids: Vec<Order>,
    #[serde(default)]
    pub asks: Vec<Order>,
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Trade recorded; ids of local orders that were shrunk or removed
    Applied { adjusted_orders: Vec<String> },
    /// Trade id already reconciled
    Duplicate,
    /// Neither side belongs to this network
    NotInvolved,
}

impl Reconciliation {
    pub fn is_applied(&self) -> bool {
        matches!(self, Reconciliation::Applied { .. })
    }
}

impl OrderMatchingEngine {
    /// Fold an externally settled trade into the local book, at most once
    /// per trade id.
    pub fn execute_cross_network_trade(
        &mut self,
        trade: &TradeExecution,
        local_network: &str,
    ) -> Reconciliation {
        if self.reconciled_trade_ids.contains(&trade.trade_id) {
            tracing::debug!("Cross-network trade {} already reconciled", trade.trade_id);
            return Reconciliation::Duplicate;
        }
        if !trade.involves(local_network) {
            tracing::debug!(
                "Cross-network trade {} between {} and {} does not involve {}",
                trade.trade_id,
                trade.buyer_network,
                trade.seller_network,
                local_network
            );
            return Reconciliation::NotInvolved;
        }

        let mut adjusted_orders = Vec::new();
        if trade.buyer_network == local_network {
            match self.consume_resting(Side::Buy, trade) {
                Some(id) => adjusted_orders.push(id),
                None => tracing::warn!("No local bid found for cross-network trade {}", trade.trade_id),
            }
        }
        if trade.seller_network == local_network {
            match self.consume_resting(Side::Sell, trade) {
                Some(id) => adjusted_orders.push(id),
                None => tracing::warn!("No local ask found for cross-network trade {}", trade.trade_id),
            }
        }

        self.reconciled_trade_ids.insert(trade.trade_id.clone());
        self.record_trade(Trade {
            id: trade.trade_id.clone(),
            asset: trade.asset.clone(),
            quantity: trade.quantity,
            price: trade.price,
            buyer: trade.buyer.clone(),
            seller: trade.seller.clone(),
            timestamp: trade.timestamp,
            cross_network: true,
        });

        tracing::info!(
            "Reconciled cross-network trade {}: {} {} @ {} ({} -> {})",
            trade.trade_id,
            trade.quantity,
            trade.asset,
            trade.price,
            trade.seller_network,
            trade.buyer_network
        );

        Reconciliation::Applied { adjusted_orders }
    }

    /// Shrink or remove the most recent compatible resting order on `side`
    fn consume_resting(&mut self, side: Side, trade: &TradeExecution) -> Option<String> {
        let book = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };

        let pos = book.iter().rposition(|order| {
            order.asset == trade.asset
                && match side {
                    Side::Buy => order.price >= trade.price,
                    Side::Sell => order.price <= trade.price,
                }
        })?;

        let id = book[pos].id.clone();
        if book[pos].quantity <= trade.quantity {
            book.remove(pos);
        } else {
            book[pos].quantity -= trade.quantity;
        }
        Some(id)
    }

    pub fn has_reconciled(&self, trade_id: &str) -> bool {
        self.reconciled_trade_ids.contains(trade_id)
    }

    /// Store the enterprise ledger's view of one asset's book
    pub fn update_enterprise_book(&mut self, book: EnterpriseBook) {
        tracing::debug!(
            "Enterprise book for {}: {} bids, {} asks",
            book.asset,
            book.bids.len(),
            book.asks.len()
        );
        self.enterprise_books.insert(book.asset.clone(), book);
    }

    pub fn enterprise_book(&self, asset: &str) -> Option<&EnterpriseBook> {
        self.enterprise_books.get(asset)
    }
}
