use fnv::FnvHashMap;
use rust_decimal::Decimal;

use crate::position::Position;

/// `equity = initial_equity + realized_pnl − total_fees − total_funding + Σ unrealized_pnl`.
/// Recomputed after every fill and every mark update.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub initial_equity: Decimal,
    pub realized_pnl: Decimal,
    pub total_fees: Decimal,
    pub total_funding: Decimal,
    pub positions: FnvHashMap<String, Position>,
}

impl AccountState {
    pub fn new(initial_equity: Decimal) -> Self {
        Self {
            initial_equity,
            realized_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            total_funding: Decimal::ZERO,
            positions: FnvHashMap::default(),
        }
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    pub fn equity(&self) -> Decimal {
        self.initial_equity + self.realized_pnl - self.total_fees - self.total_funding + self.unrealized_pnl()
    }

    pub fn margin_used(&self) -> Decimal {
        self.positions.values().map(Position::margin_used).sum()
    }

    pub fn available_margin(&self) -> Decimal {
        self.equity() - self.margin_used()
    }

    /// Removes a position if it has decayed to zero size, preserving the invariant
    /// that flat positions are absent rather than present at size 0.
    pub fn prune_flat(&mut self, symbol: &str) {
        if let Some(position) = self.positions.get(symbol) {
            if position.size <= Decimal::ZERO {
                self.positions.remove(symbol);
            }
        }
    }
}
