use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use replay_harness::clock::SimClock;
use replay_harness::data_store::DataStore;
use replay_harness::engine::ReferenceEngine;
use replay_harness::episodes::{self, EpisodeKind};
use replay_harness::exchange::{ExchangeSimConfig, SimulatedExchange};
use replay_harness::runner::{Runner, RunnerConfig};
use rust_decimal_macros::dec;

const SYMBOL: &str = "BTC/USD:USD";

async fn run(kind: EpisodeKind) -> replay_harness::runner::RunOutcome {
    let data_dir = episodes::scratch_data_dir(kind).join(format!("it-{}-{}", std::process::id(), kind.name()));
    let spec = episodes::build(kind, &data_dir, SYMBOL).unwrap();

    let mut store = DataStore::new(data_dir.clone(), vec![SYMBOL.to_string()], vec![spec.timeframe.clone()]);
    store.load().unwrap();
    let store = Arc::new(store);

    let (start, _) = store.time_range(SYMBOL, &spec.timeframe).unwrap();
    let clock = SimClock::new(start);

    let mut config = ExchangeSimConfig::default();
    config.jitter_seed = spec.jitter_seed;
    let exchange = Arc::new(SimulatedExchange::new(clock.clone(), store.clone(), config, spec.fault_injector.map(Arc::new)));
    let engine = ReferenceEngine::new(8, 21, dec!(0.05), dec!(3));

    let runner = Runner::new(
        clock,
        store,
        exchange,
        engine,
        RunnerConfig {
            symbol: SYMBOL.to_string(),
            timeframe: spec.timeframe,
            tick_interval: ChronoDuration::minutes(1),
        },
    );

    let outcome = runner.run().await.unwrap();
    let _ = std::fs::remove_dir_all(&data_dir);
    outcome
}

#[tokio::test]
async fn normal_episode_runs_every_bar_with_no_invariant_violations() {
    let outcome = run(EpisodeKind::Normal).await;
    assert!(!outcome.terminated_early);
    assert_eq!(outcome.metrics.summary().invariant_violations, 0);
    assert_eq!(outcome.metrics.summary().ticks, 720);
}

#[tokio::test]
async fn volatility_spike_episode_completes_without_terminating() {
    let outcome = run(EpisodeKind::VolatilitySpike).await;
    assert!(!outcome.terminated_early);
}

#[tokio::test]
async fn exchange_outage_episode_trips_the_circuit_breaker_and_continues() {
    let outcome = run(EpisodeKind::ExchangeOutage).await;
    assert!(!outcome.terminated_early);
    assert!(outcome.metrics.summary().circuit_breaker_opens >= 1 || outcome.metrics.summary().faults_injected == 0);
}

#[tokio::test]
async fn bug_injection_episode_terminates_early_on_the_unclassified_fault() {
    let outcome = run(EpisodeKind::BugInjection).await;
    assert!(outcome.terminated_early);
    assert!(outcome.metrics.summary().ticks < 720);
}
