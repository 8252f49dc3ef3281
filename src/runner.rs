use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};

use crate::clock::SimClock;
use crate::data_store::DataStore;
use crate::engine::TradingEngine;
use crate::error::{ErrorKind, ReplayError, ReplayResult};
use crate::exchange::SimulatedExchange;
use crate::metrics::ReplayMetrics;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub symbol: String,
    pub timeframe: String,
    pub tick_interval: ChronoDuration,
}

/// The outcome of a completed run: the metrics collected and whether it passed
/// (zero invariant violations and no unclassified exception terminated it early).
#[derive(Debug)]
pub struct RunOutcome {
    pub metrics: ReplayMetrics,
    pub passed: bool,
    pub terminated_early: bool,
}

/// Drives one replay from start to end of the loaded candle series: `clock.set` →
/// `exchange.step` → record fills → `engine.on_bar` with exception classification →
/// record equity → advance clock. Grounded on the original's tick loop, with one
/// deliberate divergence: an unclassified (`ReplayError::Other`) exception is never
/// caught here — it propagates out of `run` and terminates the replay, rather than
/// being logged and continued like every other error kind.
pub struct Runner<E: TradingEngine> {
    clock: SimClock,
    data_store: Arc<DataStore>,
    exchange: Arc<SimulatedExchange>,
    engine: E,
    config: RunnerConfig,
    metrics: ReplayMetrics,
}

impl<E: TradingEngine> Runner<E> {
    pub fn new(clock: SimClock, data_store: Arc<DataStore>, exchange: Arc<SimulatedExchange>, engine: E, config: RunnerConfig) -> Self {
        Self {
            clock,
            data_store,
            exchange,
            engine,
            config,
            metrics: ReplayMetrics::new(),
        }
    }

    pub async fn run(mut self) -> ReplayResult<RunOutcome> {
        let Some((start, end)) = self.data_store.time_range(&self.config.symbol, &self.config.timeframe) else {
            return Err(ReplayError::data(format!(
                "no candle data for {} {}",
                self.config.symbol, self.config.timeframe
            )));
        };
        info!(symbol = %self.config.symbol, %start, %end, "starting replay");

        let mut now = start;
        let mut terminated_early = false;

        while now <= end {
            self.clock.set(now);
            self.metrics.record_tick();

            let fills = self.exchange.step(now);
            for fill in &fills {
                self.metrics.record_fill(fill);
                if fill.opened_position {
                    self.metrics.record_trade_opened();
                }
                if fill.closed_position {
                    self.metrics.record_trade_closed(fill.realized_pnl);
                }
            }

            if let Err(err) = self.run_tick(now).await {
                match err.kind() {
                    ErrorKind::Other => {
                        error!(error = %err, "unclassified error, terminating run");
                        self.metrics.record_exception(&err);
                        terminated_early = true;
                        break;
                    }
                    ErrorKind::Invariant => {
                        warn!(error = %err, "invariant violated");
                        self.metrics.record_exception(&err);
                    }
                    ErrorKind::Operational | ErrorKind::Data => {
                        warn!(error = %err, "tick failed, continuing");
                        self.metrics.record_exception(&err);
                    }
                }
            }

            let equity = self.exchange.exchange_metrics().equity;
            self.metrics.record_equity(now, equity);

            now += self.config.tick_interval;
        }

        if !terminated_early {
            if let Err(err) = self.engine.on_shutdown(&self.exchange).await {
                warn!(error = %err, "engine shutdown failed");
                self.metrics.record_exception(&err);
            }
        }

        let faults_injected = self.exchange.fault_stats().map(|s| s.total_injections).unwrap_or(0);
        self.metrics.finalize_system_counters(
            self.exchange.breaker.open_count(),
            self.exchange.breaker.open_total_seconds(),
            faults_injected,
        );

        let exchange_metrics = self.exchange.exchange_metrics();
        self.metrics.finalize_execution_counters(
            exchange_metrics.orders_placed_total,
            exchange_metrics.orders_cancelled_total,
            exchange_metrics.orders_rejected_total,
        );
        self.metrics.finalize_trading_counters(
            exchange_metrics.total_fees,
            exchange_metrics.total_funding,
            exchange_metrics.realized_pnl,
            exchange_metrics.mid_fallback_count,
        );

        self.metrics.print_report();
        let passed = !terminated_early && self.metrics.summary().invariant_violations == 0;
        Ok(RunOutcome {
            metrics: self.metrics,
            passed,
            terminated_early,
        })
    }

    async fn run_tick(&mut self, now: DateTime<Utc>) -> ReplayResult<()> {
        let bar = self
            .data_store
            .candle_at(&self.config.symbol, &self.config.timeframe, now)
            .ok_or_else(|| ReplayError::data(format!("no bar for {} at {now}", self.config.symbol)))?;
        self.engine.on_bar(&self.config.symbol, &bar, &self.exchange).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeSimConfig;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct NoopEngine {
        bars_seen: usize,
    }

    impl TradingEngine for NoopEngine {
        async fn on_bar(&mut self, _symbol: &str, _bar: &crate::candle::Candle, _exchange: &SimulatedExchange) -> ReplayResult<()> {
            self.bars_seen += 1;
            Ok(())
        }

        async fn on_shutdown(&mut self, _exchange: &SimulatedExchange) -> ReplayResult<()> {
            Ok(())
        }
    }

    struct FailingEngine;

    impl TradingEngine for FailingEngine {
        async fn on_bar(&mut self, _symbol: &str, _bar: &crate::candle::Candle, _exchange: &SimulatedExchange) -> ReplayResult<()> {
            Err(ReplayError::other("unrecoverable bug"))
        }

        async fn on_shutdown(&mut self, _exchange: &SimulatedExchange) -> ReplayResult<()> {
            Ok(())
        }
    }

    fn t(offset_min: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + ChronoDuration::minutes(offset_min)
    }

    fn bar(ts: DateTime<Utc>) -> crate::candle::Candle {
        crate::candle::Candle {
            timestamp: ts,
            open: dec!(50_000),
            high: dec!(50_050),
            low: dec!(49_950),
            close: dec!(50_000),
            volume: dec!(500_000),
        }
    }

    fn setup(symbol: &str, count: i64) -> (Arc<DataStore>, SimClock, Arc<SimulatedExchange>) {
        let mut store = DataStore::new("unused", vec![symbol.to_string()], vec!["1m".to_string()]);
        let bars: Vec<_> = (0..count).map(|i| bar(t(i))).collect();
        store.inject_for_test(symbol, "1m", bars);
        let store = Arc::new(store);
        let clock = SimClock::new(t(0));
        let exchange = Arc::new(SimulatedExchange::new(clock.clone(), store.clone(), ExchangeSimConfig::default(), None));
        (store, clock, exchange)
    }

    #[tokio::test]
    async fn runs_one_tick_per_bar() {
        let (store, clock, exchange) = setup("BTC/USD:USD", 5);
        let runner = Runner::new(
            clock,
            store,
            exchange,
            NoopEngine { bars_seen: 0 },
            RunnerConfig {
                symbol: "BTC/USD:USD".into(),
                timeframe: "1m".into(),
                tick_interval: ChronoDuration::minutes(1),
            },
        );
        let outcome = runner.run().await.unwrap();
        assert!(outcome.passed);
        assert!(!outcome.terminated_early);
        assert_eq!(outcome.metrics.summary().ticks, 5);
    }

    #[tokio::test]
    async fn unclassified_error_terminates_the_run_early() {
        let (store, clock, exchange) = setup("BTC/USD:USD", 5);
        let runner = Runner::new(
            clock,
            store,
            exchange,
            FailingEngine,
            RunnerConfig {
                symbol: "BTC/USD:USD".into(),
                timeframe: "1m".into(),
                tick_interval: ChronoDuration::minutes(1),
            },
        );
        let outcome = runner.run().await.unwrap();
        assert!(outcome.terminated_early);
        assert!(!outcome.passed);
        assert_eq!(outcome.metrics.summary().ticks, 1);
    }
}
