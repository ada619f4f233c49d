//! Named-breaker registry with adaptive threshold/timeout tuning.
//!
//! Grounded on the teacher's `circuit_breaker_registry.rs` (an
//! `Arc<Mutex<HashMap<String, _>>>` registry of named policies); the
//! adaptation pass itself is new, built against §4.3 of the specification.

use crate::circuit_breaker::{BreakerError, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::error::CircuitBreakerError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Minimum `fail_max` the adaptive tuner will ever set. A breaker that trips
/// on a single failure is a hard switch, not a breaker — see DESIGN.md's
/// Open Question decision.
pub const MIN_FAIL_MAX: usize = 2;

struct Entry {
    breaker: CircuitBreakerPolicy,
    adapted_at_millis: u64,
    recent_calls_at_last_adapt: usize,
}

/// One adaptation decision, kept for observability in `Stats`.
#[derive(Debug, Clone)]
pub struct AdaptationRecord {
    pub breaker: String,
    pub new_fail_max: usize,
    pub new_timeout: Duration,
    pub reason: &'static str,
}

pub struct CircuitBreakerManager {
    breakers: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    adaptations: Mutex<Vec<AdaptationRecord>>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            clock: Arc::new(MonotonicClock::default()),
            adaptations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            clock: Arc::new(clock),
            adaptations: Mutex::new(Vec::new()),
        }
    }

    pub fn register_breaker(&self, name: impl Into<String>, cfg: CircuitBreakerConfig) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers.insert(
            name.into(),
            Entry {
                breaker: CircuitBreakerPolicy::with_config(cfg),
                adapted_at_millis: 0,
                recent_calls_at_last_adapt: 0,
            },
        );
    }

    fn breaker(&self, name: &str) -> Option<CircuitBreakerPolicy> {
        self.breakers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map(|e| e.breaker.clone())
    }

    pub async fn call_with_breaker<T, E, Fut, Op>(
        &self,
        name: &str,
        operation: Op,
    ) -> Result<T, BreakerError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BreakerError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let breaker = self.breaker(name).unwrap_or_else(|| {
            // An un-registered name is treated as an always-closed breaker
            // rather than a panic, matching "lock small state, never fail
            // admission on a bookkeeping gap".
            CircuitBreakerPolicy::new(usize::MAX, Duration::from_secs(0))
        });
        breaker.execute(operation).await
    }

    pub fn get_breaker_state(&self, name: &str) -> Option<CircuitState> {
        self.breaker(name).map(|b| b.state())
    }

    pub fn reset_breaker(&self, name: &str) -> Result<(), CircuitBreakerError> {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        match breakers.get(name) {
            Some(entry) => {
                entry.breaker.reset();
                Ok(())
            }
            None => Err(CircuitBreakerError::UnknownBreaker(name.to_string())),
        }
    }

    /// Snapshot of per-breaker counters, for `Stats`.
    pub fn get_metrics(&self) -> HashMap<String, BreakerMetrics> {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    BreakerMetrics {
                        state: entry.breaker.state(),
                        consecutive_failures: entry.breaker.consecutive_failures(),
                        total_calls: entry.breaker.total_calls(),
                        successful_calls: entry.breaker.successful_calls(),
                        failed_calls: entry.breaker.failed_calls(),
                        total_trips: entry.breaker.total_trips(),
                        fail_max: entry.breaker.config().failure_threshold,
                        timeout: entry.breaker.config().recovery_timeout,
                    },
                )
            })
            .collect()
    }

    /// Idempotent adaptation pass. Raises `timeout_duration` when trips are
    /// frequent; shrinks both `timeout_duration` and `fail_max` (floored at
    /// [`MIN_FAIL_MAX`]) when a dependency has gone quiet, so it recovers
    /// fast on the next single successful probe.
    pub fn maybe_adapt_breakers(&self, min_interval: Duration) -> Vec<AdaptationRecord> {
        let now = self.clock.now_millis();
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        let mut produced = Vec::new();

        for (name, entry) in breakers.iter_mut() {
            if now.saturating_sub(entry.adapted_at_millis) < min_interval.as_millis() as u64 {
                continue;
            }

            let total_calls = entry.breaker.total_calls();
            let total_trips = entry.breaker.total_trips();
            let calls_since_last = total_calls.saturating_sub(entry.recent_calls_at_last_adapt);
            let trip_rate_percent = if total_calls == 0 {
                0.0
            } else {
                (total_trips as f64 / total_calls as f64) * 100.0
            };

            let cfg = entry.breaker.config().clone();
            let (new_fail_max, new_timeout, reason) = if trip_rate_percent > 20.0 {
                let lengthened = (cfg.recovery_timeout * 2).min(Duration::from_secs(10 * 60));
                (cfg.failure_threshold, lengthened, "high trip rate: lengthening timeout")
            } else if calls_since_last < 2 {
                let shortened = Duration::from_millis((cfg.recovery_timeout.as_millis() as u64 / 2).max(1));
                let lowered = cfg.failure_threshold.saturating_sub(1).max(MIN_FAIL_MAX);
                (lowered, shortened, "low call volume: shortening timeout for fast recovery")
            } else {
                entry.adapted_at_millis = now;
                entry.recent_calls_at_last_adapt = total_calls;
                continue;
            };

            entry.breaker.retune(new_fail_max, new_timeout);
            entry.adapted_at_millis = now;
            entry.recent_calls_at_last_adapt = total_calls;

            let record = AdaptationRecord {
                breaker: name.clone(),
                new_fail_max,
                new_timeout,
                reason,
            };
            produced.push(record.clone());
            self.adaptations.lock().unwrap_or_else(|p| p.into_inner()).push(record);
        }

        produced
    }

    pub fn adaptation_history(&self) -> Vec<AdaptationRecord> {
        self.adaptations.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub total_calls: usize,
    pub successful_calls: usize,
    pub failed_calls: usize,
    pub total_trips: usize,
    pub fail_max: usize,
    pub timeout: Duration,
}
