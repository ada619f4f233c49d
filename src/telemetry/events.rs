use std::time::Duration;
use std::fmt;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Policy events emitted during execution.
///
/// All Nine Lives policies emit structured events that describe their behavior.
/// These events can be collected, aggregated, and used for observability,
/// monitoring, or autonomous control.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    /// Retry policy events
    Retry(RetryEvent),
    /// Circuit breaker events
    CircuitBreaker(CircuitBreakerEvent),
    /// Bulkhead events
    Bulkhead(BulkheadEvent),
    /// Timeout events
    Timeout(TimeoutEvent),
    /// Request outcome events (emitted by all policies)
    Request(RequestOutcome),
    /// Broker domain events (key pool, cache, health)
    Broker(BrokerEvent),
}

/// Events emitted by the broker and its collaborators: key-pool state
/// transitions, rate-limit throttling, cache tier served, and health-related
/// changes. Same event/sink shape as the resilience-policy events above,
/// generalized to the broker's own domain vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// An `ApiKey` changed health state.
    KeyStateChanged {
        provider: String,
        key_index: usize,
        from: &'static str,
        to: &'static str,
    },
    /// A named circuit breaker tripped open.
    BreakerTripped { name: String, consecutive_failures: usize },
    /// A named circuit breaker's thresholds were adapted.
    BreakerAdapted { name: String, new_fail_max: usize, new_timeout: Duration, reason: &'static str },
    /// `RateLimiter::acquire` did not return `AdmitNow`.
    RateLimitThrottled { provider: String, wait: Option<Duration> },
    /// A response was served from a fallback tier.
    CacheTierServed { provider: String, kind: &'static str },
    /// A monitored component's health status changed.
    HealthStatusChanged { component: String, from: &'static str, to: &'static str },
    /// A recovery action was attempted for a component.
    RecoveryAttempted { component: String, action: &'static str, success: bool },
}

impl fmt::Display for BrokerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerEvent::KeyStateChanged { provider, key_index, from, to } => {
                write!(f, "KeyStateChanged({provider}[{key_index}]: {from} -> {to})")
            }
            BrokerEvent::BreakerTripped { name, consecutive_failures } => {
                write!(f, "BreakerTripped({name}, {consecutive_failures} consecutive failures)")
            }
            BrokerEvent::BreakerAdapted { name, new_fail_max, new_timeout, reason } => {
                write!(f, "BreakerAdapted({name}, fail_max={new_fail_max}, timeout={new_timeout:?}, {reason})")
            }
            BrokerEvent::RateLimitThrottled { provider, wait } => {
                write!(f, "RateLimitThrottled({provider}, wait={wait:?})")
            }
            BrokerEvent::CacheTierServed { provider, kind } => {
                write!(f, "CacheTierServed({provider}, {kind})")
            }
            BrokerEvent::HealthStatusChanged { component, from, to } => {
                write!(f, "HealthStatusChanged({component}: {from} -> {to})")
            }
            BrokerEvent::RecoveryAttempted { component, action, success } => {
                write!(f, "RecoveryAttempted({component}, {action}, success={success})")
            }
        }
    }
}

/// Events emitted by retry policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry attempt is about to be made.
    ///
    /// Emitted before sleeping and retrying a failed request.
    Attempt {
        /// The attempt number (1-indexed)
        attempt: usize,
        /// The backoff delay before this retry
        delay: Duration,
    },
    /// All retry attempts have been exhausted.
    ///
    /// Emitted when the maximum number of retries is reached
    /// and the request still fails.
    Exhausted {
        /// Total number of attempts made
        total_attempts: usize,
        /// Total time spent retrying
        total_duration: Duration,
    },
}

/// Events emitted by circuit breaker policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open state.
    ///
    /// Subsequent requests will be rejected immediately without
    /// being forwarded to the inner service.
    Opened {
        /// Number of consecutive failures that triggered the open
        failure_count: usize,
    },
    /// Circuit transitioned to half-open state.
    ///
    /// A limited number of test requests will be allowed through
    /// to determine if the inner service has recovered.
    HalfOpen,
    /// Circuit transitioned to closed state.
    ///
    /// Normal operation resumes - all requests are forwarded.
    Closed,
}

/// Events emitted by bulkhead policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEvent {
    /// A request successfully acquired a bulkhead permit.
    ///
    /// The request will proceed to the inner service.
    Acquired {
        /// Current number of active requests
        active_count: usize,
        /// Maximum concurrency limit
        max_concurrency: usize,
    },
    /// A request was rejected due to bulkhead saturation.
    ///
    /// All available permits are in use.
    Rejected {
        /// Current number of active requests
        active_count: usize,
        /// Maximum concurrency limit
        max_concurrency: usize,
    },
}

/// Events emitted by timeout policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// A request exceeded the timeout duration.
    ///
    /// The request was cancelled and an error returned.
    Occurred {
        /// The timeout duration that was exceeded
        timeout: Duration,
    },
}

/// Request outcome events emitted by all policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request completed successfully.
    Success {
        /// Time taken to complete the request
        duration: Duration,
    },
    /// Request failed with an error.
    Failure {
        /// Time taken before failure
        duration: Duration,
    },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry(event) => write!(f, "Retry::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            PolicyEvent::Bulkhead(event) => write!(f, "Bulkhead::{}", event),
            PolicyEvent::Timeout(event) => write!(f, "Timeout::{}", event),
            PolicyEvent::Request(event) => write!(f, "Request::{}", event),
            PolicyEvent::Broker(event) => write!(f, "Broker::{}", event),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count } => {
                write!(f, "Opened(failures={})", failure_count)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
        }
    }
}

impl fmt::Display for BulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkheadEvent::Acquired { active_count, max_concurrency } => {
                write!(f, "Acquired({}/{})", active_count, max_concurrency)
            }
            BulkheadEvent::Rejected { active_count, max_concurrency } => {
                write!(f, "Rejected({}/{})", active_count, max_concurrency)
            }
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutEvent::Occurred { timeout } => write!(f, "Occurred(timeout={:?})", timeout),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure(duration={:?})", duration),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a PolicyEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &PolicyEvent) -> serde_json::Value {
    match event {
        PolicyEvent::Retry(r) => match r {
            RetryEvent::Attempt { attempt, delay } => json!({
                "kind": "retry_attempt",
                "attempt": *attempt,
                "delay_ms": clamp_u64(delay.as_millis()),
            }),
            RetryEvent::Exhausted { total_attempts, total_duration } => json!({
                "kind": "retry_exhausted",
                "attempts": *total_attempts,
                "duration_ms": clamp_u64(total_duration.as_millis()),
            }),
        },
        PolicyEvent::CircuitBreaker(c) => match c {
            CircuitBreakerEvent::Opened { failure_count } => {
                json!({ "kind": "circuit_opened", "failures": *failure_count })
            }
            CircuitBreakerEvent::HalfOpen => json!({ "kind": "circuit_half_open" }),
            CircuitBreakerEvent::Closed => json!({ "kind": "circuit_closed" }),
        },
        PolicyEvent::Bulkhead(b) => match b {
            BulkheadEvent::Acquired { active_count, max_concurrency } => json!({
                "kind": "bulkhead_acquired",
                "active": *active_count,
                "max": *max_concurrency
            }),
            BulkheadEvent::Rejected { active_count, max_concurrency } => json!({
                "kind": "bulkhead_rejected",
                "active": *active_count,
                "max": *max_concurrency
            }),
        },
        PolicyEvent::Timeout(t) => match t {
            TimeoutEvent::Occurred { timeout } => json!({
                "kind": "timeout",
                "timeout_ms": clamp_u64(timeout.as_millis())
            }),
        },
        PolicyEvent::Request(r) => match r {
            RequestOutcome::Success { duration } => json!({
                "kind": "request_success",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
            RequestOutcome::Failure { duration } => json!({
                "kind": "request_failure",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
        },
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_event_display() {
        let event = RetryEvent::Attempt { attempt: 2, delay: Duration::from_millis(100) };
        assert!(event.to_string().contains("Attempt"));
        assert!(event.to_string().contains("#2"));
    }

    #[test]
    fn test_circuit_breaker_event_display() {
        let event = CircuitBreakerEvent::Opened { failure_count: 5 };
        assert!(event.to_string().contains("Opened"));
        assert!(event.to_string().contains("5"));
    }

    #[test]
    fn test_bulkhead_event_display() {
        let event = BulkheadEvent::Rejected { active_count: 10, max_concurrency: 10 };
        assert!(event.to_string().contains("Rejected"));
        assert!(event.to_string().contains("10/10"));
    }

    #[test]
    fn test_policy_event_clone() {
        let event = PolicyEvent::Retry(RetryEvent::Attempt {
            attempt: 1,
            delay: Duration::from_millis(50),
        });
        let cloned = event.clone();
        assert_eq!(event, cloned);
    }

    #[test]
    fn test_policy_event_request_variants_display() {
        let ok =
            PolicyEvent::Request(RequestOutcome::Success { duration: Duration::from_millis(5) });
        let err =
            PolicyEvent::Request(RequestOutcome::Failure { duration: Duration::from_millis(7) });
        assert!(format!("{}", ok).contains("Success"));
        assert!(format!("{}", err).contains("Failure"));
    }
}
