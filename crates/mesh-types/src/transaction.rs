//! Ledger transactions
//!
//! A transaction is an id plus a tagged payload. The id is the only thing
//! deduplication looks at, so every constructor here either draws a random
//! suffix or derives the id from an externally unique key (order id, trade id).

use crate::{format_fixed, now_millis, unique_id, Side};
use serde::{Deserialize, Serialize};

/// Contract that order calls target unless told otherwise
pub const TRADING_CONTRACT_ID: &str = "trading_contract";

fn default_contract_id() -> String {
    TRADING_CONTRACT_ID.to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Globally unique id used for deduplication
    pub id: String,
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: TransactionKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionKind {
    /// Free-form chat / audit message
    Message { content: String, sender: String },
    /// Call into the trading contract
    OrderCall(OrderCall),
    /// Trade settled by the enterprise ledger. Nested so its own
    /// `timestamp` stays clear of the transaction's.
    TradeExecution { trade: TradeExecution },
    /// Trade between two other networks, recorded for display
    CrossNetworkTradeNotice { notice: CrossNetworkTradeNotice },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderFunction {
    Buy,
    Sell,
    Cancel,
}

impl OrderFunction {
    /// Book side for buy/sell, `None` for cancel
    pub fn side(&self) -> Option<Side> {
        match self {
            OrderFunction::Buy => Some(Side::Buy),
            OrderFunction::Sell => Some(Side::Sell),
            OrderFunction::Cancel => None,
        }
    }
}

impl From<Side> for OrderFunction {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => OrderFunction::Buy,
            Side::Sell => OrderFunction::Sell,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OrderCall {
    pub function: OrderFunction,
    pub asset: String,
    /// Fixed point, two implied decimals
    pub quantity: u64,
    /// Fixed point, two implied decimals
    pub price: u64,
    /// Order the call created or cancels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub caller: String,
    #[serde(default = "default_contract_id")]
    pub contract_id: String,
    /// Contract state after the call, applied verbatim by replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_changes: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TradeExecution {
    pub trade_id: String,
    pub asset: String,
    pub quantity: u64,
    pub price: u64,
    pub buyer: String,
    pub buyer_network: String,
    pub seller: String,
    pub seller_network: String,
    pub timestamp: u64,
}

impl TradeExecution {
    /// Whether `network` is one of the two counterparties
    pub fn involves(&self, network: &str) -> bool {
        self.buyer_network == network || self.seller_network == network
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CrossNetworkTradeNotice {
    pub trade_id: String,
    pub asset: String,
    pub quantity: u64,
    pub price: u64,
    pub buyer_network: String,
    pub seller_network: String,
    pub timestamp: u64,
}

impl From<CrossNetworkTradeNotice> for TradeExecution {
    fn from(notice: CrossNetworkTradeNotice) -> Self {
        Self {
            buyer: format!("{}_network", notice.buyer_network),
            seller: format!("{}_network", notice.seller_network),
            trade_id: notice.trade_id,
            asset: notice.asset,
            quantity: notice.quantity,
            price: notice.price,
            buyer_network: notice.buyer_network,
            seller_network: notice.seller_network,
            timestamp: notice.timestamp,
        }
    }
}

impl Transaction {
    /// Message with a fresh random id
    pub fn message(content: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            id: unique_id("msg"),
            timestamp: now_millis(),
            kind: TransactionKind::Message {
                content: content.into(),
                sender: sender.into(),
            },
        }
    }

    /// Audit record for an order seen on the wire.
    ///
    /// The id derives from the order id so every replica mirrors the same
    /// order into the same transaction.
    pub fn order_mirror(
        order_id: &str,
        side: Side,
        trader: &str,
        asset: &str,
        quantity: u64,
        price: u64,
        timestamp: u64,
    ) -> Self {
        let action = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        Self {
            id: format!("order_{}", order_id),
            timestamp,
            kind: TransactionKind::Message {
                content: format!(
                    "{}_ORDER: {} {} @ ${}",
                    action,
                    format_fixed(quantity),
                    asset,
                    format_fixed(price)
                ),
                sender: trader.to_string(),
            },
        }
    }

    /// Contract call, keyed by the order it creates or cancels
    pub fn order_call(call: OrderCall, timestamp: u64) -> Self {
        let id = match (&call.function, &call.order_id) {
            (OrderFunction::Cancel, Some(order_id)) => format!("cancel_{}", order_id),
            (_, Some(order_id)) => format!("call_{}", order_id),
            (_, None) => unique_id("call"),
        };
        Self {
            id,
            timestamp,
            kind: TransactionKind::OrderCall(call),
        }
    }

    pub fn trade_execution(trade: TradeExecution) -> Self {
        Self {
            id: format!("exec_{}", trade.trade_id),
            timestamp: trade.timestamp,
            kind: TransactionKind::TradeExecution { trade },
        }
    }

    pub fn cross_network_notice(notice: CrossNetworkTradeNotice) -> Self {
        Self {
            id: format!("xnet_{}", notice.trade_id),
            timestamp: notice.timestamp,
            kind: TransactionKind::CrossNetworkTradeNotice { notice },
        }
    }

    pub fn as_order_call(&self) -> Option<&OrderCall> {
        match &self.kind {
            TransactionKind::OrderCall(call) => Some(call),
            _ => None,
        }
    }

    /// Short type label for logs
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TransactionKind::Message { .. } => "message",
            TransactionKind::OrderCall(_) => "order_call",
            TransactionKind::TradeExecution { .. } => "trade_execution",
            TransactionKind::CrossNetworkTradeNotice { .. } => "cross_network_trade_notice",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_call() -> OrderCall {
        OrderCall {
            function: OrderFunction::Buy,
            asset: "BTC".into(),
            quantity: 1_000,
            price: 10_000,
            order_id: Some("order_1".into()),
            caller: "alice".into(),
            contract_id: TRADING_CONTRACT_ID.into(),
            state_changes: Some(serde_json::json!({"orders": 1})),
        }
    }

    #[test]
    fn test_tagged_json_shape() {
        let tx = Transaction::order_call(sample_call(), 42);
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], "order_call");
        assert_eq!(json["function"], "buy");
        assert_eq!(json["id"], "call_order_1");

        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_contract_id_defaults() {
        let json = serde_json::json!({
            "id": "call_x",
            "timestamp": 1,
            "type": "order_call",
            "function": "sell",
            "asset": "ETH",
            "quantity": 5,
            "price": 7,
            "caller": "bob"
        });
        let tx: Transaction = serde_json::from_value(json).unwrap();
        let call = tx.as_order_call().unwrap();
        assert_eq!(call.contract_id, TRADING_CONTRACT_ID);
        assert_eq!(call.function.side(), Some(Side::Sell));
        assert!(call.order_id.is_none());
    }

    #[test]
    fn test_order_mirror_is_deterministic() {
        let a = Transaction::order_mirror("o1", Side::Buy, "alice", "BTC", 1_000, 10_050, 9);
        let b = Transaction::order_mirror("o1", Side::Buy, "alice", "BTC", 1_000, 10_050, 9);
        assert_eq!(a, b);
        match a.kind {
            TransactionKind::Message { content, sender } => {
                assert_eq!(content, "BUY_ORDER: 10.00 BTC @ $100.50");
                assert_eq!(sender, "alice");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    fn sample_notice() -> CrossNetworkTradeNotice {
        CrossNetworkTradeNotice {
            trade_id: "t1".into(),
            asset: "BTC".into(),
            quantity: 5,
            price: 100,
            buyer_network: "east".into(),
            seller_network: "west".into(),
            timestamp: 3,
        }
    }

    #[test]
    fn test_trade_execution_survives_json() {
        let tx = Transaction::trade_execution(sample_notice().into());
        let text = serde_json::to_string(&tx).unwrap();
        assert_eq!(text.matches("\"timestamp\"").count(), 2);

        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "trade_execution");
        assert_eq!(json["trade"]["trade_id"], "t1");

        let back: Transaction = serde_json::from_str(&text).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_notice_survives_json() {
        let tx = Transaction::cross_network_notice(sample_notice());
        let text = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, "xnet_t1");
        assert_eq!(back, tx);
    }

    #[test]
    fn test_message_survives_json() {
        let tx = Transaction::message("gm", "alice");
        let back: Transaction = serde_json::from_str(&serde_json::to_string(&tx).unwrap()).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_notice_converts_to_execution() {
        let notice = CrossNetworkTradeNotice {
            trade_id: "t1".into(),
            asset: "BTC".into(),
            quantity: 5,
            price: 100,
            buyer_network: "east".into(),
            seller_network: "west".into(),
            timestamp: 3,
        };
        let exec: TradeExecution = notice.into();
        assert_eq!(exec.buyer, "east_network");
        assert_eq!(exec.seller, "west_network");
        assert!(exec.involves("west"));
        assert!(!exec.involves("north"));
        assert_eq!(Transaction::trade_execution(exec).id, "exec_t1");
    }
}
