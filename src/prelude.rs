//! Convenient re-exports for common broker types.
pub use crate::{
    broker::{Broker, BrokerBuilder, Channel, Request, Response},
    cache::{FallbackCache, FallbackKind},
    circuit_breaker::{CircuitBreakerConfig, CircuitState},
    circuit_breaker_manager::CircuitBreakerManager,
    config::{BrokerConfig, ProviderConfig, TokenBudgetConfig},
    error::{BrokerError, CacheError, CircuitBreakerError, KeyPoolError, ProviderError, RateLimitError},
    health::{HealthMonitor, HealthStatus},
    key_pool::{ApiKey, KeyPool, KeySource, StaticKeySource},
    provider::{ProviderClient, ProviderProfile},
    rate_limiter::RateLimiter,
    stats::{ServiceHealth, Stats},
    telemetry::{BrokerEvent, LogSink, MemorySink, NullSink, PolicyEvent, TelemetrySink},
};
