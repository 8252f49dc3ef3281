use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::order::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl From<Side> for PositionSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => Self::Long,
            Side::Sell => Self::Short,
        }
    }
}

/// One per symbol. Invariant: `size > 0` or absent — flat positions are removed from
/// the holding map, never represented as size 0.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
}

impl Position {
    pub fn notional(&self) -> Decimal {
        self.size * self.entry_price
    }

    pub fn margin_used(&self) -> Decimal {
        self.notional() / self.leverage
    }

    pub fn unrealized_pnl_at(&self, mark: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (mark - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - mark) * self.size,
        }
    }

    /// The mark price at which margin is exhausted. Computed on demand, never
    /// independently tracked — a supplementary field surfaced for position views.
    pub fn liquidation_price(&self) -> Decimal {
        let inverse_leverage = Decimal::ONE / self.leverage;
        match self.side {
            PositionSide::Long => self.entry_price * (Decimal::ONE - inverse_leverage),
            PositionSide::Short => self.entry_price * (Decimal::ONE + inverse_leverage),
        }
    }

    pub fn view(&self) -> PositionView {
        PositionView {
            symbol: self.symbol.clone(),
            side: self.side,
            size: self.size,
            entry_price: self.entry_price,
            unrealized_pnl: self.unrealized_pnl,
            leverage: self.leverage,
            liquidation_price: self.liquidation_price(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
    pub liquidation_price: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long(entry: Decimal, size: Decimal, leverage: Decimal) -> Position {
        Position {
            symbol: "BTC/USD:USD".into(),
            side: PositionSide::Long,
            size,
            entry_price: entry,
            unrealized_pnl: Decimal::ZERO,
            leverage,
        }
    }

    #[test]
    fn unrealized_pnl_long_is_mark_minus_entry_times_size() {
        let p = long(dec!(50_000), dec!(1), dec!(5));
        assert_eq!(p.unrealized_pnl_at(dec!(51_000)), dec!(1000));
    }

    #[test]
    fn unrealized_pnl_short_is_entry_minus_mark_times_size() {
        let mut p = long(dec!(50_000), dec!(1), dec!(5));
        p.side = PositionSide::Short;
        assert_eq!(p.unrealized_pnl_at(dec!(49_000)), dec!(1000));
    }

    #[test]
    fn liquidation_price_long_is_below_entry() {
        let p = long(dec!(50_000), dec!(1), dec!(5));
        assert_eq!(p.liquidation_price(), dec!(40000));
    }

    #[test]
    fn liquidation_price_short_is_above_entry() {
        let mut p = long(dec!(50_000), dec!(1), dec!(5));
        p.side = PositionSide::Short;
        assert_eq!(p.liquidation_price(), dec!(60000));
    }

    #[test]
    fn margin_used_is_notional_over_leverage() {
        let p = long(dec!(50_000), dec!(2), dec!(10));
        assert_eq!(p.margin_used(), dec!(10000));
    }
}
