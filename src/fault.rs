use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use rand::Rng;
use rand::rngs::StdRng;
use tracing::warn;

use crate::error::{OperationalError, OtherError, ReplayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Timeout,
    RateLimit,
    DataError,
    AttributeError,
}

/// A scripted fault injection window. `probability < 1.0` gates injection through the
/// exchange's shared seeded RNG, preserving run-level determinism.
#[derive(Debug, Clone)]
pub struct FaultSpec {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub fault_kind: FaultKind,
    pub affected_methods: Option<Vec<String>>,
    pub message: String,
    pub probability: f64,
}

impl FaultSpec {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, fault_kind: FaultKind) -> Self {
        Self {
            start,
            end,
            fault_kind,
            affected_methods: None,
            message: format!("Injected {fault_kind:?}"),
            probability: 1.0,
        }
    }

    pub fn with_methods(mut self, methods: Vec<&str>) -> Self {
        self.affected_methods = Some(methods.into_iter().map(String::from).collect());
        self
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FaultStats {
    pub total_injections: u64,
    pub by_kind: FnvHashMap<String, u64>,
    pub specs_count: usize,
}

#[derive(Debug, Clone)]
pub struct InjectionLogEntry {
    pub time: DateTime<Utc>,
    pub method: String,
    pub fault_kind: FaultKind,
}

struct Inner {
    specs: Vec<FaultSpec>,
    injections_total: u64,
    injections_by_kind: FnvHashMap<String, u64>,
    injection_log: Vec<InjectionLogEntry>,
}

/// Holds an ordered list of fault specs; the exchange calls `maybe_inject` before
/// every simulated API call.
pub struct FaultInjector {
    inner: Mutex<Inner>,
}

impl FaultInjector {
    pub fn new(mut specs: Vec<FaultSpec>) -> Self {
        specs.sort_by_key(|s| s.start);
        Self {
            inner: Mutex::new(Inner {
                specs,
                injections_total: 0,
                injections_by_kind: FnvHashMap::default(),
                injection_log: Vec::new(),
            }),
        }
    }

    pub fn add(&self, spec: FaultSpec) {
        let mut inner = self.inner.lock().unwrap();
        inner.specs.push(spec);
        inner.specs.sort_by_key(|s| s.start);
    }

    /// Checks whether a fault should fire for `method` at `now`. Specs are scanned in
    /// `start`-ascending order; the scan breaks at the first spec not yet started.
    pub fn maybe_inject(&self, method: &str, now: DateTime<Utc>, rng: &mut StdRng) -> Result<(), ReplayError> {
        let mut inner = self.inner.lock().unwrap();
        let specs = inner.specs.clone();
        for spec in &specs {
            if now < spec.start {
                break;
            }
            if now > spec.end {
                continue;
            }
            if let Some(methods) = &spec.affected_methods {
                if !methods.iter().any(|m| m == method) {
                    continue;
                }
            }
            if spec.probability < 1.0 && rng.random::<f64>() > spec.probability {
                continue;
            }

            warn!(method, fault_kind = ?spec.fault_kind, "fault injected");
            inner.injections_total += 1;
            *inner
                .injections_by_kind
                .entry(format!("{:?}", spec.fault_kind))
                .or_insert(0) += 1;
            inner.injection_log.push(InjectionLogEntry {
                time: now,
                method: method.to_string(),
                fault_kind: spec.fault_kind,
            });

            return Err(match spec.fault_kind {
                FaultKind::Timeout => ReplayError::from(OperationalError::Timeout(spec.message.clone())),
                FaultKind::RateLimit => ReplayError::from(OperationalError::RateLimit),
                FaultKind::DataError => ReplayError::data(spec.message.clone()),
                FaultKind::AttributeError => ReplayError::from(OtherError(spec.message.clone())),
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> FaultStats {
        let inner = self.inner.lock().unwrap();
        FaultStats {
            total_injections: inner.injections_total,
            by_kind: inner.injections_by_kind.clone(),
            specs_count: inner.specs.len(),
        }
    }

    pub fn injection_log(&self) -> Vec<InjectionLogEntry> {
        self.inner.lock().unwrap().injection_log.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::SeedableRng;

    fn window(start_min: i64, end_min: i64, kind: FaultKind) -> FaultSpec {
        let base = Utc::now();
        FaultSpec::new(base + Duration::minutes(start_min), base + Duration::minutes(end_min), kind)
    }

    #[test]
    fn injects_within_window_and_not_outside() {
        let base = Utc::now();
        let injector = FaultInjector::new(vec![window(2, 4, FaultKind::Timeout)]);
        let mut rng = StdRng::seed_from_u64(1);

        assert!(injector.maybe_inject("place_futures_order", base + Duration::minutes(1), &mut rng).is_ok());
        let err = injector
            .maybe_inject("place_futures_order", base + Duration::minutes(3), &mut rng)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Operational);
        assert!(injector.maybe_inject("place_futures_order", base + Duration::minutes(5), &mut rng).is_ok());
        assert_eq!(injector.stats().total_injections, 1);
    }

    #[test]
    fn affected_methods_restricts_injection() {
        let base = Utc::now();
        let spec = window(0, 10, FaultKind::RateLimit).with_methods(vec!["place_futures_order"]);
        let injector = FaultInjector::new(vec![spec]);
        let mut rng = StdRng::seed_from_u64(1);

        assert!(injector.maybe_inject("get_futures_balance", base + Duration::minutes(1), &mut rng).is_ok());
        assert!(injector.maybe_inject("place_futures_order", base + Duration::minutes(1), &mut rng).is_err());
    }

    #[test]
    fn attribute_error_is_unclassified() {
        let base = Utc::now();
        let injector = FaultInjector::new(vec![window(0, 10, FaultKind::AttributeError)]);
        let mut rng = StdRng::seed_from_u64(1);
        let err = injector
            .maybe_inject("get_all_futures_positions", base + Duration::minutes(1), &mut rng)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Other);
    }
}
