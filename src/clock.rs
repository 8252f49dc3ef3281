use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::ReplayError;

/// Call counters exposed for test assertions on how the runner drove the clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockStats {
    pub sets: u64,
    pub advances: u64,
    pub sleeps: u64,
}

type StepCallback = Box<dyn Fn(ChronoDuration) + Send + Sync>;

struct Inner {
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    stats: ClockStats,
    step_callback: Option<StepCallback>,
}

/// A single source of "now" for the entire replay. No component may consult
/// wall-clock time; every timestamp the harness observes flows through this type.
#[derive(Clone)]
pub struct SimClock {
    inner: Arc<Mutex<Inner>>,
}

impl SimClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                start,
                now: start,
                stats: ClockStats::default(),
                step_callback: None,
            })),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    pub fn unix_time(&self) -> i64 {
        self.now().timestamp()
    }

    pub fn elapsed(&self) -> ChronoDuration {
        let inner = self.inner.lock();
        inner.now - inner.start
    }

    /// Sets the clock to `t`. No monotonicity check: `t` may be before the current
    /// instant, matching the original's `set()` semantics exactly.
    pub fn set(&self, t: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        debug!(from = %inner.now, to = %t, "sim clock set");
        inner.now = t;
        inner.stats.sets += 1;
    }

    /// Advances the clock by `delta`. Rejects a negative delta with `InvalidTime`.
    pub fn advance(&self, delta: ChronoDuration) -> Result<(), ReplayError> {
        if delta < ChronoDuration::zero() {
            warn!(delta_ms = delta.num_milliseconds(), "negative clock advance rejected");
            return Err(ReplayError::data("InvalidTime: advance delta must be >= 0"));
        }
        let mut inner = self.inner.lock();
        inner.now += delta;
        inner.stats.advances += 1;
        Ok(())
    }

    /// Installs a callback invoked by every `sleep()` with the requested duration.
    /// The default harness runner never installs one (it advances the clock itself
    /// between ticks); this exists for callers that want `sleep` to behave like a
    /// real advance without going through the tick loop.
    pub fn set_step_callback<F>(&self, callback: F)
    where
        F: Fn(ChronoDuration) + Send + Sync + 'static,
    {
        self.inner.lock().step_callback = Some(Box::new(callback));
    }

    /// Cooperative sleep: yields once to the scheduler and, if a step callback is
    /// installed, notifies it of the requested duration. Does not itself advance the
    /// clock — callers composing `sleep` with an auto-advancing callback get that
    /// advance through the callback, not here.
    pub async fn sleep(&self, seconds: f64) {
        {
            let mut inner = self.inner.lock();
            inner.stats.sleeps += 1;
            if let Some(cb) = inner.step_callback.as_ref() {
                cb(ChronoDuration::milliseconds((seconds * 1000.0) as i64));
            }
        }
        tokio::task::yield_now().await;
    }

    pub fn stats(&self) -> ClockStats {
        self.inner.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn set_has_no_monotonicity_check() {
        let clock = SimClock::new(t(2025, 1, 1, 0));
        clock.set(t(2025, 1, 1, 5));
        clock.set(t(2025, 1, 1, 2));
        assert_eq!(clock.now(), t(2025, 1, 1, 2));
        assert_eq!(clock.stats().sets, 2);
    }

    #[test]
    fn advance_rejects_negative_delta() {
        let clock = SimClock::new(t(2025, 1, 1, 0));
        let err = clock.advance(ChronoDuration::seconds(-1)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Data);
        assert_eq!(clock.now(), t(2025, 1, 1, 0));
    }

    #[test]
    fn advance_moves_time_forward() {
        let clock = SimClock::new(t(2025, 1, 1, 0));
        clock.advance(ChronoDuration::hours(1)).unwrap();
        assert_eq!(clock.now(), t(2025, 1, 1, 1));
        assert_eq!(clock.elapsed(), ChronoDuration::hours(1));
    }

    #[tokio::test]
    async fn sleep_invokes_step_callback_without_self_advancing() {
        let clock = SimClock::new(t(2025, 1, 1, 0));
        let observed = Arc::new(Mutex::new(ChronoDuration::zero()));
        let observed_clone = observed.clone();
        clock.set_step_callback(move |d| {
            *observed_clone.lock() = d;
        });
        clock.sleep(2.5).await;
        assert_eq!(clock.now(), t(2025, 1, 1, 0));
        assert_eq!(*observed.lock(), ChronoDuration::milliseconds(2500));
        assert_eq!(clock.stats().sleeps, 1);
    }
}
