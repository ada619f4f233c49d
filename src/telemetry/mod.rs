//! Telemetry and observability for broker and resilience-policy events.
//!
//! Events flow through `TelemetrySink` implementations which can log,
//! aggregate, or forward events to external systems.
//!
//! # Event Types
//!
//! - **Retry**: `RetryAttempt`, `RetryExhausted`
//! - **Circuit Breaker**: `CircuitOpened`, `CircuitClosed`, `CircuitHalfOpen`
//! - **Broker**: key-pool state transitions, breaker adaptation, rate-limit
//!   throttling, cache tier served, health status changes, recovery attempts
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<PolicyEvent>` for composability.

pub mod events;
pub mod sinks;

// Re-export core types for backward compatibility
pub use events::{
    BrokerEvent, BulkheadEvent, CircuitBreakerEvent, PolicyEvent, RequestOutcome, RetryEvent,
    TimeoutEvent,
};
pub use sinks::{
    emit_best_effort, ComposedSinkError, FallbackSink, LogSink, MemorySink, MulticastSink,
    NonBlockingSink, NullSink, StreamingSink, TelemetrySink,
};
