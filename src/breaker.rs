use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::error::{OperationalError, ReplayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    rate_limit_hits: u32,
    opened_at: Option<DateTime<Utc>>,
    open_count: u64,
    open_total: Duration,
}

/// Three-state breaker guarding exchange calls (spec §4.6). Single-threaded
/// cooperative scheduling means this only needs a logical mutex for correctness
/// under interleaving, never cross-thread synchronization.
pub struct ApiCircuitBreaker {
    failure_threshold: u32,
    rate_limit_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl ApiCircuitBreaker {
    pub fn new(failure_threshold: u32, rate_limit_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            rate_limit_threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                rate_limit_hits: 0,
                opened_at: None,
                open_count: 0,
                open_total: Duration::zero(),
            }),
        }
    }

    pub fn default_thresholds() -> Self {
        Self::new(5, 2, Duration::seconds(30))
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn open_count(&self) -> u64 {
        self.inner.lock().unwrap().open_count
    }

    pub fn open_total_seconds(&self) -> f64 {
        self.inner.lock().unwrap().open_total.num_milliseconds() as f64 / 1000.0
    }

    /// Called before every exchange call. Rejects fast while `OPEN`; admits exactly
    /// one probe once the cooldown elapses.
    pub fn before_call(&self, now: DateTime<Utc>) -> Result<(), ReplayError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let opened_at = inner.opened_at.expect("OPEN state always has opened_at");
                if now - opened_at >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(ReplayError::from(OperationalError::CircuitOpen))
                }
            }
        }
    }

    /// Records a non-business failure (timeout/5xx). Business errors (bad symbol,
    /// insufficient margin, below-minimum size, auth failure) must never reach here.
    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => self.trip(&mut inner, now),
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_rate_limit(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => self.trip(&mut inner, now),
            CircuitState::Closed => {
                inner.rate_limit_hits += 1;
                if inner.rate_limit_hits >= self.rate_limit_threshold {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::HalfOpen {
            info!("circuit breaker recovered");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.rate_limit_hits = 0;
        inner.opened_at = None;
    }

    fn trip(&self, inner: &mut Inner, now: DateTime<Utc>) {
        warn!("circuit breaker opened");
        if let Some(opened_at) = inner.opened_at {
            inner.open_total = inner.open_total + (now - opened_at);
        }
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.open_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap()
    }

    #[test]
    fn trips_after_failure_threshold() {
        let breaker = ApiCircuitBreaker::new(3, 2, Duration::seconds(10));
        for i in 0..2 {
            breaker.record_failure(t(i));
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure(t(3));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.open_count(), 1);
    }

    #[test]
    fn trips_after_rate_limit_threshold() {
        let breaker = ApiCircuitBreaker::new(5, 2, Duration::seconds(10));
        breaker.record_rate_limit(t(0));
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_rate_limit(t(1));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_until_cooldown_then_probes() {
        let breaker = ApiCircuitBreaker::new(1, 1, Duration::seconds(10));
        breaker.record_failure(t(0));
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.before_call(t(5)).is_err());
        assert!(breaker.before_call(t(11)).is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_success_closes_and_resets() {
        let breaker = ApiCircuitBreaker::new(1, 1, Duration::seconds(10));
        breaker.record_failure(t(0));
        breaker.before_call(t(11)).unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(t(12));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = ApiCircuitBreaker::new(1, 1, Duration::seconds(10));
        breaker.record_failure(t(0));
        breaker.before_call(t(11)).unwrap();
        breaker.record_failure(t(12));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.open_count(), 2);
    }
}
