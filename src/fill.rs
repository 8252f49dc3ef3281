use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::order::{OrderId, Side};

/// Append-only record of what happened on the exchange. Fills are never mutated once
/// recorded; the fill log is the authoritative history of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub is_maker: bool,
    pub timestamp: DateTime<Utc>,
    pub reduce_only: bool,
    /// Pnl realized by this specific fill, zero when the fill only opened or grew
    /// exposure rather than closing any of it.
    pub realized_pnl: Decimal,
    /// Whether this fill established a position where none existed.
    pub opened_position: bool,
    /// Whether this fill reduced a position to flat (or flattened-then-reversed it).
    pub closed_position: bool,
}
