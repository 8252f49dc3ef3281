use std::fs::File;
use std::io::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ErrorKind, ReplayError, ReplayResult};
use crate::fill::Fill;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SafetyCounters {
    invariant_violations: u64,
    exceptions_by_type: std::collections::BTreeMap<String, u64>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct TradingCounters {
    trades_opened: u64,
    trades_closed: u64,
    winning_trades: u64,
    losing_trades: u64,
    gross_profit: Decimal,
    gross_loss: Decimal,
    total_fees: Decimal,
    total_funding: Decimal,
    realized_pnl: Decimal,
    maker_fills: u64,
    taker_fills: u64,
    mid_fallback_count: u64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ExecutionCounters {
    orders_placed: u64,
    orders_filled: u64,
    orders_cancelled: u64,
    orders_rejected: u64,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SystemCounters {
    ticks: u64,
    circuit_breaker_opens: u64,
    circuit_breaker_open_seconds: f64,
    faults_injected: u64,
}

/// Counts everything a completed replay reports (spec §7): safety, trading,
/// execution, and system counters, plus the equity curve used to derive ratios.
/// Every `record_*` method appends; nothing is ever overwritten.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ReplayMetrics {
    safety: SafetyCounters,
    trading: TradingCounters,
    execution: ExecutionCounters,
    system: SystemCounters,
    equity_curve: Vec<EquitySnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub invariant_violations: u64,
    pub trades_opened: u64,
    pub trades_closed: u64,
    pub win_rate: Decimal,
    pub profit_factor: Option<Decimal>,
    pub maker_ratio: Decimal,
    pub fee_drag_pct: Decimal,
    pub realized_pnl: Decimal,
    pub mid_fallback_count: u64,
    pub orders_placed: u64,
    pub orders_filled: u64,
    pub orders_cancelled: u64,
    pub orders_rejected: u64,
    pub ticks: u64,
    pub circuit_breaker_opens: u64,
    pub circuit_breaker_open_seconds: f64,
    pub faults_injected: u64,
    pub final_equity: Option<Decimal>,
    pub max_drawdown_pct: Decimal,
}

impl ReplayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_equity(&mut self, timestamp: DateTime<Utc>, equity: Decimal) {
        self.equity_curve.push(EquitySnapshot { timestamp, equity });
    }

    pub fn record_tick(&mut self) {
        self.system.ticks += 1;
    }

    /// Overwrites the system counters sourced from the exchange's own cumulative
    /// breaker/fault-injector state, taken once at the end of a run rather than
    /// tracked incrementally alongside it.
    pub fn finalize_system_counters(&mut self, breaker_opens: u64, breaker_open_seconds: f64, faults_injected: u64) {
        self.system.circuit_breaker_opens = breaker_opens;
        self.system.circuit_breaker_open_seconds = breaker_open_seconds;
        self.system.faults_injected = faults_injected;
    }

    /// Overwrites the execution counters sourced from the exchange's own cumulative
    /// order book, taken once at the end of a run since the runner never observes an
    /// engine's direct `place_futures_order`/`cancel_order` calls.
    pub fn finalize_execution_counters(&mut self, orders_placed: u64, orders_cancelled: u64, orders_rejected: u64) {
        self.execution.orders_placed = orders_placed;
        self.execution.orders_cancelled = orders_cancelled;
        self.execution.orders_rejected = orders_rejected;
    }

    /// Overwrites fees/funding/realized-pnl/mid-fallback counters sourced from the
    /// exchange's own cumulative state, taken once at the end of a run rather than
    /// accumulated incrementally, matching the original's end-of-run reconciliation.
    pub fn finalize_trading_counters(&mut self, total_fees: Decimal, total_funding: Decimal, realized_pnl: Decimal, mid_fallback_count: u64) {
        self.trading.total_fees = total_fees;
        self.trading.total_funding = total_funding;
        self.trading.realized_pnl = realized_pnl;
        self.trading.mid_fallback_count = mid_fallback_count;
    }

    /// Records one fill, updating fee/funding/maker-taker counters. Does not itself
    /// decide trade open/close — callers pass that through `record_trade_closed`.
    pub fn record_fill(&mut self, fill: &Fill) {
        self.execution.orders_filled += 1;
        self.trading.total_fees += fill.fee;
        if fill.is_maker {
            self.trading.maker_fills += 1;
        } else {
            self.trading.taker_fills += 1;
        }
    }

    pub fn record_mid_fallback(&mut self) {
        self.trading.mid_fallback_count += 1;
    }

    pub fn record_funding(&mut self, funding: Decimal) {
        self.trading.total_funding += funding;
    }

    pub fn record_trade_opened(&mut self) {
        self.trading.trades_opened += 1;
    }

    /// Records a closed trade's realized pnl, classifying it win/loss for
    /// `win_rate`/`profit_factor`.
    pub fn record_trade_closed(&mut self, realized_pnl: Decimal) {
        self.trading.trades_closed += 1;
        if realized_pnl > Decimal::ZERO {
            self.trading.winning_trades += 1;
            self.trading.gross_profit += realized_pnl;
        } else if realized_pnl < Decimal::ZERO {
            self.trading.losing_trades += 1;
            self.trading.gross_loss += -realized_pnl;
        }
    }

    /// Records an exception the runner caught, bucketed by its kind for
    /// `exceptions_by_type`. Invariant violations also bump the dedicated counter.
    pub fn record_exception(&mut self, err: &ReplayError) {
        if err.kind() == ErrorKind::Invariant {
            self.safety.invariant_violations += 1;
        }
        *self.safety.exceptions_by_type.entry(err.kind().to_string()).or_insert(0) += 1;
    }

    pub fn win_rate(&self) -> Decimal {
        if self.trading.trades_closed == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.trading.winning_trades) / Decimal::from(self.trading.trades_closed)
    }

    /// `gross_profit / gross_loss`, `None` when there have been no losing trades
    /// (an undefined ratio, not an infinite one).
    pub fn profit_factor(&self) -> Option<Decimal> {
        if self.trading.gross_loss.is_zero() {
            return None;
        }
        Some(self.trading.gross_profit / self.trading.gross_loss)
    }

    pub fn maker_ratio(&self) -> Decimal {
        let total = self.trading.maker_fills + self.trading.taker_fills;
        if total == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.trading.maker_fills) / Decimal::from(total)
    }

    /// Total fees + funding as a percentage of final equity.
    pub fn fee_drag_pct(&self) -> Decimal {
        let Some(final_equity) = self.final_equity() else {
            return Decimal::ZERO;
        };
        if final_equity.is_zero() {
            return Decimal::ZERO;
        }
        (self.trading.total_fees + self.trading.total_funding) / final_equity * Decimal::new(100, 0)
    }

    pub fn final_equity(&self) -> Option<Decimal> {
        self.equity_curve.last().map(|s| s.equity)
    }

    /// Largest peak-to-trough drop in the equity curve, as a percentage of the peak.
    pub fn max_drawdown_pct(&self) -> Decimal {
        let mut peak = Decimal::MIN;
        let mut worst = Decimal::ZERO;
        for snapshot in &self.equity_curve {
            if snapshot.equity > peak {
                peak = snapshot.equity;
            }
            if peak > Decimal::ZERO {
                let drawdown = (peak - snapshot.equity) / peak * Decimal::new(100, 0);
                if drawdown > worst {
                    worst = drawdown;
                }
            }
        }
        worst
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            invariant_violations: self.safety.invariant_violations,
            trades_opened: self.trading.trades_opened,
            trades_closed: self.trading.trades_closed,
            win_rate: self.win_rate(),
            profit_factor: self.profit_factor(),
            maker_ratio: self.maker_ratio(),
            fee_drag_pct: self.fee_drag_pct(),
            realized_pnl: self.trading.realized_pnl,
            mid_fallback_count: self.trading.mid_fallback_count,
            orders_placed: self.execution.orders_placed,
            orders_filled: self.execution.orders_filled,
            orders_cancelled: self.execution.orders_cancelled,
            orders_rejected: self.execution.orders_rejected,
            ticks: self.system.ticks,
            circuit_breaker_opens: self.system.circuit_breaker_opens,
            circuit_breaker_open_seconds: self.system.circuit_breaker_open_seconds,
            faults_injected: self.system.faults_injected,
            final_equity: self.final_equity(),
            max_drawdown_pct: self.max_drawdown_pct(),
        }
    }

    /// Human-readable report to stdout/logs, mirroring the original's end-of-run
    /// console summary.
    pub fn print_report(&self) {
        let summary = self.summary();
        info!(
            invariant_violations = summary.invariant_violations,
            trades_closed = summary.trades_closed,
            win_rate = %summary.win_rate,
            profit_factor = ?summary.profit_factor.map(|p| p.to_f64()),
            maker_ratio = %summary.maker_ratio,
            fee_drag_pct = %summary.fee_drag_pct,
            final_equity = ?summary.final_equity.map(|e| e.to_f64()),
            max_drawdown_pct = %summary.max_drawdown_pct,
            "replay complete"
        );
    }

    pub fn save(&self, path: impl AsRef<Path>) -> ReplayResult<()> {
        let json = serde_json::to_string_pretty(&self.summary())
            .map_err(|e| ReplayError::other(format!("failed to serialize metrics: {e}")))?;
        let mut file = File::create(path.as_ref())
            .map_err(|e| ReplayError::other(format!("failed to create {}: {e}", path.as_ref().display())))?;
        file.write_all(json.as_bytes())
            .map_err(|e| ReplayError::other(format!("failed to write {}: {e}", path.as_ref().display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn win_rate_is_wins_over_closed_trades() {
        let mut metrics = ReplayMetrics::new();
        metrics.record_trade_closed(dec!(100));
        metrics.record_trade_closed(dec!(-50));
        metrics.record_trade_closed(dec!(25));
        assert_eq!(metrics.win_rate(), dec!(2) / dec!(3));
    }

    #[test]
    fn profit_factor_is_none_with_no_losses() {
        let mut metrics = ReplayMetrics::new();
        metrics.record_trade_closed(dec!(100));
        assert_eq!(metrics.profit_factor(), None);
    }

    #[test]
    fn profit_factor_is_gross_profit_over_gross_loss() {
        let mut metrics = ReplayMetrics::new();
        metrics.record_trade_closed(dec!(200));
        metrics.record_trade_closed(dec!(-100));
        assert_eq!(metrics.profit_factor(), Some(dec!(2)));
    }

    #[test]
    fn maker_ratio_counts_maker_fills_over_total() {
        let mut metrics = ReplayMetrics::new();
        let fill = |is_maker: bool| Fill {
            order_id: crate::order::OrderId(1),
            symbol: "BTC/USD:USD".into(),
            side: crate::order::Side::Buy,
            price: dec!(50_000),
            size: dec!(1),
            fee: dec!(1),
            is_maker,
            timestamp: Utc::now(),
            reduce_only: false,
            realized_pnl: dec!(0),
            opened_position: false,
            closed_position: false,
        };
        metrics.record_fill(&fill(true));
        metrics.record_fill(&fill(true));
        metrics.record_fill(&fill(false));
        assert_eq!(metrics.maker_ratio(), dec!(2) / dec!(3));
    }

    #[test]
    fn max_drawdown_finds_worst_peak_to_trough_drop() {
        let mut metrics = ReplayMetrics::new();
        let t = Utc::now();
        metrics.record_equity(t, dec!(100));
        metrics.record_equity(t, dec!(150));
        metrics.record_equity(t, dec!(90));
        metrics.record_equity(t, dec!(120));
        assert_eq!(metrics.max_drawdown_pct(), dec!(40));
    }

    #[test]
    fn record_exception_buckets_invariant_violations_separately() {
        let mut metrics = ReplayMetrics::new();
        metrics.record_exception(&ReplayError::invariant("breach"));
        metrics.record_exception(&ReplayError::data("bad data"));
        assert_eq!(metrics.safety.invariant_violations, 1);
        assert_eq!(metrics.safety.exceptions_by_type.len(), 2);
    }
}
