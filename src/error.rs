//! Error types for the broker and its subsystems.
//!
//! `BrokerError` is the single boundary type returned by `Broker::send`,
//! `Broker::stream`, and `Broker::stats`. Subsystem errors convert into it
//! via `From`. Following the teacher crate, the idiom is mixed by
//! subsystem rather than uniform: `KeyPoolError` is hand-rolled
//! (`Display`/`Error` impls, matching the teacher's own `error.rs`) while
//! the rest are `thiserror`-derived (matching the teacher's `control/types.rs`).

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by `KeyPool` operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPoolError {
    UnknownProvider(String),
    NoKeyAvailable(String),
}

impl fmt::Display for KeyPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownProvider(p) => write!(f, "unknown provider: {p}"),
            Self::NoKeyAvailable(p) => write!(f, "no usable key available for provider: {p}"),
        }
    }
}

impl std::error::Error for KeyPoolError {}

/// Errors raised by `RateLimiter::acquire`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit window exhausted for provider {provider}")]
    Rejected { provider: String },
}

/// Errors raised by the named-breaker manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CircuitBreakerError {
    #[error("circuit breaker '{name}' is open ({failure_count} failures, open for {open_duration:?})")]
    Open {
        name: String,
        failure_count: usize,
        open_duration: Duration,
    },
    #[error("no circuit breaker registered with name '{0}'")]
    UnknownBreaker(String),
}

/// Errors raised by `ProviderClient` dispatch.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("upstream rate limited (429), retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    #[error("upstream authentication error ({status})")]
    Auth { status: u16 },
    #[error("upstream server error ({status}): {body}")]
    UpstreamServer { status: u16, body: String },
    #[error("transport error: {0}")]
    Network(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed upstream response: {0}")]
    Decode(String),
}

/// Errors raised while serving or building a cache entry.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CacheError {
    #[error("cache build failed: {0}")]
    BuildFailed(String),
}

/// The single error type returned at the broker's public boundary.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum BrokerError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("no key available: {0}")]
    NoKeyAvailable(#[from] KeyPoolError),
    #[error("circuit breaker rejected the call: {0}")]
    CircuitOpen(#[from] CircuitBreakerError),
    #[error("rate limited locally: {0}")]
    RateLimited(#[from] RateLimitError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("every fallback tier was exhausted")]
    FallbackExhausted,
}

impl BrokerError {
    /// True for every condition that the dispatch pipeline treats as
    /// "try the fallback cascade" rather than "surface immediately". Per
    /// spec.md §7's error table, every dispatch-boundary error short of
    /// `Validation` (already short-circuited before dispatch even runs)
    /// enters the cascade: admission failures (`NoKeyAvailable`,
    /// `CircuitOpen`, `RateLimited`) per §4.7 step 3-5, and upstream
    /// failures surfaced only after retries/key rotation are exhausted
    /// (`Provider`, `Cache`) per §4.7 step 6-7. `FallbackExhausted` is the
    /// cascade's own terminal state and must not re-enter itself.
    pub fn triggers_fallback(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::FallbackExhausted)
    }
}
