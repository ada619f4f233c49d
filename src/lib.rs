#![forbid(unsafe_code)]

//! A resilient multi-provider LLM request broker.
//!
//! `Broker` sits between application code and one or more LLM providers
//! (OpenAI-compatible HTTP APIs, Ollama, etc.) and absorbs the failure modes
//! that come with depending on third-party inference endpoints: exhausted or
//! revoked API keys, per-provider rate limits, flaky upstreams, and outright
//! outages. A single [`Broker::send`] call rotates through a weighted pool of
//! keys, admits the request against a sliding token/cost budget, dispatches
//! through a per-provider circuit breaker, and — if every avenue to the
//! upstream fails — falls back through a cached response, a canned static
//! reply, a degraded handler, or a last-resort synthetic message, in that
//! order.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::HashMap;
//! use waystation::{
//!     BrokerBuilder, BrokerConfig, ProviderConfig, Request, StaticKeySource, TokenBudgetConfig,
//! };
//!
//! # async fn run() {
//! let mut providers = HashMap::new();
//! providers.insert(
//!     "deepseek".to_string(),
//!     ProviderConfig {
//!         base_url: "https://api.deepseek.com".into(),
//!         default_model: "deepseek-chat".into(),
//!         dialect: None,
//!         timeout_seconds: 30,
//!         max_retries: 3,
//!         retry_delay_seconds: 1,
//!         rate_limit_rpm: None,
//!         token_budget: TokenBudgetConfig::default(),
//!     },
//! );
//! let config = BrokerConfig {
//!     providers,
//!     circuit_breakers: HashMap::new(),
//!     health: Default::default(),
//!     fallback: Default::default(),
//!     features: Default::default(),
//! };
//!
//! let keys = StaticKeySource::new().with_provider("deepseek", vec!["sk-...".into()]);
//! let broker = BrokerBuilder::new(config).build(&keys).await;
//!
//! let response = broker
//!     .send(Request::new("deepseek", "analyze", "summarize this filing", 512))
//!     .await;
//! println!("{} via {:?}", response.content, response.channel_used);
//! # }
//! ```

mod adaptive;
mod backoff;
mod broker;
mod cache;
mod circuit_breaker;
mod circuit_breaker_manager;
mod clock;
mod config;
mod error;
mod health;
mod jitter;
mod key_pool;
mod multilevel_cache;
mod provider;
mod rate_limiter;
mod sleeper;
mod stats;
mod telemetry;
mod transport;

/// Not gated behind `#[cfg(test)]`: the top-level `tests/` integration
/// binaries compile against this crate as an external consumer and need a
/// stable path to reach these seams. Kept out of [`prelude`] so production
/// code never picks them up.
pub mod test_support;

pub use adaptive::Adaptive;
pub use backoff::Backoff;
pub use broker::{Broker, BrokerBuilder, Channel, Request, Response};
pub use cache::{fingerprint, CacheStats, DegradedHandler, FallbackCache, FallbackKind};
pub use circuit_breaker_manager::{AdaptationRecord, BreakerMetrics, CircuitBreakerManager, MIN_FAIL_MAX};
pub use circuit_breaker::{BreakerError, CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use clock::{Clock, MonotonicClock};
pub use config::{
    BrokerConfig, CircuitBreakerConfigEntry, DialectConfig, FallbackConfig, FeatureFlags,
    HealthConfig, ProviderConfig, TokenBudgetConfig,
};
pub use error::{BrokerError, CacheError, CircuitBreakerError, KeyPoolError, ProviderError, RateLimitError};
pub use health::{
    FileOperationStrategy, HealthCheckResult, HealthMetrics, HealthMonitor, HealthProbe,
    HealthStatus, RecoveryAction, RecoveryActionKind, RecoveryRecord,
};
pub use jitter::Jitter;
pub use key_pool::{ApiKey, KeyHealth, KeyPool, KeyPoolBuilder, KeySource, StaticKeySource};
pub use multilevel_cache::{MultiLevelCache, MultiLevelCacheStats, RemoteCache};
pub use provider::{
    ChatCall, ChatChunkStream, ChatMessage, ProviderCallResult, ProviderClient, ProviderClientPool,
    ProviderProfile, TokenUsage, WireDialect,
};
pub use rate_limiter::{Admission, RateLimiter, RateLimiterMetrics, TokenBudget, MAX_LOCAL_WAIT};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stats::{autonomy_score, AutonomyInputs, ProviderCounters, ServiceHealth, ServiceRegistry, ServiceStatus, Stats, StatsCollector};
pub use telemetry::{
    emit_best_effort, BrokerEvent, ComposedSinkError, FallbackSink, LogSink, MemorySink,
    MulticastSink, NonBlockingSink, NullSink, PolicyEvent, StreamingSink, TelemetrySink,
};
pub use transport::{ByteChunkStream, HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};

pub mod prelude;
