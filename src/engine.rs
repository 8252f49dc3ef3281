use std::future::Future;

use rust_decimal::Decimal;

use crate::candle::Candle;
use crate::error::ReplayResult;
use crate::exchange::{ExchangeMetrics, SimulatedExchange};
use crate::order::{NewOrderRequest, OrderId, OrderKind, OrderView, Side};
use crate::position::PositionView;

/// The capability surface a trading engine under test is driven through. Exists so
/// the runner injects a concrete engine explicitly at construction time rather than
/// patching methods onto a running object — the dependency is a type, not a monkeypatch.
/// `Runner` is generic over this trait rather than boxing it: native `async fn` in
/// traits is not dyn-compatible, and nothing here needs dynamic dispatch.
pub trait TradingEngine: Send {
    /// Called once per tick with the bar that just closed, after the exchange has
    /// stepped and before equity is recorded for this tick.
    fn on_bar(
        &mut self,
        symbol: &str,
        bar: &Candle,
        exchange: &SimulatedExchange,
    ) -> impl Future<Output = ReplayResult<()>> + Send;

    /// Called once at the end of a run so the engine can flatten any residual
    /// exposure before final metrics are taken.
    fn on_shutdown(&mut self, exchange: &SimulatedExchange) -> impl Future<Output = ReplayResult<()>> + Send;
}

/// A deterministic reference engine: alternates long/flat on a simple moving-average
/// crossover so every exchange code path (stop triggers, reduce-only closes, funding
/// accrual, fills under fault injection) is exercised without a real strategy layer,
/// which is out of scope for this harness.
pub struct ReferenceEngine {
    fast_window: usize,
    slow_window: usize,
    order_size: Decimal,
    leverage: Decimal,
    history: Vec<Decimal>,
    last_signal: Option<Side>,
}

impl ReferenceEngine {
    pub fn new(fast_window: usize, slow_window: usize, order_size: Decimal, leverage: Decimal) -> Self {
        Self {
            fast_window,
            slow_window,
            order_size,
            leverage,
            history: Vec::new(),
            last_signal: None,
        }
    }

    fn average(window: &[Decimal]) -> Decimal {
        if window.is_empty() {
            return Decimal::ZERO;
        }
        window.iter().copied().sum::<Decimal>() / Decimal::from(window.len())
    }

    fn signal(&self) -> Option<Side> {
        if self.history.len() < self.slow_window {
            return None;
        }
        let fast = Self::average(&self.history[self.history.len() - self.fast_window..]);
        let slow = Self::average(&self.history[self.history.len() - self.slow_window..]);
        if fast > slow {
            Some(Side::Buy)
        } else if fast < slow {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

impl TradingEngine for ReferenceEngine {
    async fn on_bar(&mut self, symbol: &str, bar: &Candle, exchange: &SimulatedExchange) -> ReplayResult<()> {
        self.history.push(bar.close);

        let Some(signal) = self.signal() else {
            return Ok(());
        };
        if self.last_signal == Some(signal) {
            return Ok(());
        }

        // Queried via the bulk accessor (rather than `get_futures_position`) so the
        // fault-injected `get_all_futures_positions` method is exercised on every
        // signal change, not just at shutdown.
        if exchange.get_all_futures_positions().await?.iter().any(|p| p.symbol == symbol) {
            exchange.close_position(symbol).await?;
        }

        exchange
            .place_futures_order(NewOrderRequest::new(
                symbol.to_string(),
                None,
                signal,
                OrderKind::Market,
                self.order_size,
                None,
                None,
                false,
                Some(self.leverage),
            ))
            .await?;

        self.last_signal = Some(signal);
        Ok(())
    }

    async fn on_shutdown(&mut self, exchange: &SimulatedExchange) -> ReplayResult<()> {
        for position in exchange.get_all_futures_positions().await? {
            exchange.close_position(&position.symbol).await?;
        }
        Ok(())
    }
}

/// Typed views of exchange state an engine or test harness reads without touching
/// exchange internals directly — re-exported here for callers that only import
/// `engine`.
pub struct EngineView<'a> {
    pub exchange: &'a SimulatedExchange,
}

impl<'a> EngineView<'a> {
    pub fn metrics(&self) -> ExchangeMetrics {
        self.exchange.exchange_metrics()
    }

    pub async fn open_orders(&self, symbol: Option<&str>) -> ReplayResult<Vec<OrderView>> {
        self.exchange.get_futures_open_orders(symbol).await
    }

    pub async fn position(&self, symbol: &str) -> ReplayResult<Option<PositionView>> {
        self.exchange.get_futures_position(symbol).await
    }

    pub async fn order(&self, id: OrderId) -> ReplayResult<Option<OrderView>> {
        self.exchange.fetch_order(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_engine_emits_buy_signal_once_fast_crosses_slow() {
        let mut engine = ReferenceEngine::new(2, 4, Decimal::ONE, Decimal::ONE);
        for price in [dec(100), dec(100), dec(100), dec(101), dec(110)] {
            engine.history.push(price);
        }
        assert_eq!(engine.signal(), Some(Side::Buy));
    }

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    #[test]
    fn no_signal_before_slow_window_fills() {
        let engine = ReferenceEngine::new(2, 4, Decimal::ONE, Decimal::ONE);
        assert_eq!(engine.signal(), None);
    }
}
