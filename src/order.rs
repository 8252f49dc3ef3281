use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct OrderId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    EnteredBook,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled)
    }
}

/// A single order, exchange-owned for its entire lifetime. External callers hold an
/// `OrderId`, never a reference into exchange state.
#[derive(Debug, Clone, Constructor)]
pub struct NewOrderRequest {
    pub symbol: String,
    pub client_id: Option<String>,
    pub side: Side,
    pub kind: OrderKind,
    pub size: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub leverage: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub id: OrderId,
    pub client_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub leverage: Option<Decimal>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub avg_fill_price: Option<Decimal>,
    pub mid_at_placement: Option<Decimal>,
}

impl Order {
    pub fn new(id: OrderId, request: NewOrderRequest, created_at: DateTime<Utc>, mid_at_placement: Option<Decimal>) -> Self {
        Self {
            id,
            client_id: request.client_id,
            symbol: request.symbol,
            side: request.side,
            kind: request.kind,
            size: request.size,
            filled_size: Decimal::ZERO,
            price: request.price,
            stop_price: request.stop_price,
            reduce_only: request.reduce_only,
            leverage: request.leverage,
            status: OrderStatus::Open,
            created_at,
            triggered_at: None,
            filled_at: None,
            avg_fill_price: None,
            mid_at_placement,
        }
    }

    pub fn remaining(&self) -> Decimal {
        self.size - self.filled_size
    }

    /// A view of this order for the exchange's "fetch order" and "list open orders"
    /// surfaces — always an owned copy, never a borrow into exchange state.
    pub fn view(&self) -> OrderView {
        OrderView {
            id: self.id,
            client_id: self.client_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            kind: self.kind,
            amount: self.size,
            price: self.price,
            stop_price: self.stop_price,
            status: self.status,
            filled: self.filled_size,
            remaining: self.remaining(),
            average: self.avg_fill_price,
            reduce_only: self.reduce_only,
            datetime: self.created_at,
            timestamp: self.created_at.timestamp(),
        }
    }
}

/// The statically typed response the exchange returns in place of the loose
/// dictionary the original exchange client used (spec §9 design note).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
    pub id: OrderId,
    pub client_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub average: Option<Decimal>,
    pub reduce_only: bool,
    pub datetime: DateTime<Utc>,
    pub timestamp: i64,
}
