//! Dispatch pipeline tying every subsystem together: admission, key
//! selection, breaker-guarded dispatch, and the fallback cascade.
//!
//! Grounded on `examples/original_source/backend/agents/llm/base_client.py`'s
//! `chat_completion` orchestration (acquire key → rate limit → call → record)
//! and `fallback_service.py`'s cascade, recomposed over the subsystem types
//! built in the sibling modules rather than re-implemented here.

use crate::cache::{FallbackCache, FallbackKind};
use crate::circuit_breaker::{BreakerError, CircuitBreakerConfig, CircuitState};
use crate::circuit_breaker_manager::CircuitBreakerManager;
use crate::clock::{Clock, MonotonicClock};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, CircuitBreakerError, ProviderError, RateLimitError};
use crate::health::{recovery_action_label, status_label, HealthMonitor, HealthStatus};
use crate::key_pool::{ApiKey, KeyPool, KeyPoolBuilder, KeySource};
use crate::provider::{ChatCall, ChatChunkStream, ChatMessage, ProviderClient, ProviderProfile, TokenUsage};
use crate::rate_limiter::{Admission, RateLimiter, MAX_LOCAL_WAIT};
use crate::stats::{ServiceHealth, ServiceRegistry, Stats, StatsCollector};
use crate::telemetry::{emit_best_effort, BrokerEvent, NullSink, PolicyEvent, TelemetrySink};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound on `estimated_tokens`; anything past this is almost certainly
/// a caller bug rather than a legitimately large prompt.
const MAX_ESTIMATED_TOKENS: u64 = 2_000_000;

/// Bounded retry count for the auth-error-disables-key-then-retry path
/// (§7's "retry with next key, only if pool exhausted" rule needs at most
/// one retry per remaining key).
const MAX_KEY_ATTEMPTS: usize = 4;

/// Which surface produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    DirectApi,
    Cache,
    Fallback,
}

/// Inbound call, provider-agnostic.
#[derive(Debug, Clone)]
pub struct Request {
    pub provider: String,
    pub task_type: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub context: serde_json::Value,
    pub estimated_tokens: u64,
    pub temperature: f64,
    pub max_tokens: u32,
    pub use_cache: bool,
    pub idempotency_key: Option<String>,
}

impl Request {
    pub fn new(provider: impl Into<String>, task_type: impl Into<String>, prompt: impl Into<String>, estimated_tokens: u64) -> Self {
        Self {
            provider: provider.into(),
            task_type: task_type.into(),
            prompt: prompt.into(),
            system_prompt: None,
            context: serde_json::Value::Null,
            estimated_tokens,
            temperature: 0.7,
            max_tokens: 1024,
            use_cache: true,
            idempotency_key: None,
        }
    }
}

/// Uniform response surface. `success` is true for a real upstream answer
/// or for any fallback tier short of `Synthetic`; `fallback_type` is set
/// whenever a tier other than the upstream itself served the content.
#[derive(Debug, Clone)]
pub struct Response {
    pub success: bool,
    pub content: String,
    pub reasoning_content: Option<String>,
    pub error: Option<String>,
    pub channel_used: Channel,
    pub api_key_index: Option<usize>,
    pub latency_ms: u64,
    pub token_usage: Option<TokenUsage>,
    pub cost_estimate: Option<f64>,
    pub fallback_type: Option<FallbackKind>,
}

fn validate(request: &Request) -> Result<(), String> {
    if request.provider.trim().is_empty() {
        return Err("provider must not be empty".into());
    }
    if request.prompt.trim().is_empty() {
        return Err("prompt must not be empty".into());
    }
    if request.estimated_tokens == 0 || request.estimated_tokens > MAX_ESTIMATED_TOKENS {
        return Err(format!("estimated_tokens out of bounds: {}", request.estimated_tokens));
    }
    Ok(())
}

fn build_messages(request: &Request) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(system) = &request.system_prompt {
        messages.push(ChatMessage { role: "system".into(), content: system.clone(), name: None });
    }
    messages.push(ChatMessage { role: "user".into(), content: request.prompt.clone(), name: None });
    messages
}

fn fallback_kind_label(kind: FallbackKind) -> &'static str {
    match kind {
        FallbackKind::Cached => "cached",
        FallbackKind::Static => "static",
        FallbackKind::Degraded => "degraded",
        FallbackKind::Synthetic => "synthetic",
    }
}

/// One provider's wired-up dispatch target: client plus its pricing.
struct ProviderEntry {
    client: Arc<ProviderClient>,
    cost_per_1k_tokens: f64,
}

/// Builds a [`Broker`] from a [`BrokerConfig`], a credential source, and a
/// per-provider [`ProviderClient`] the caller constructs (since the broker
/// itself has no opinion on which `Transport` backs it).
pub struct BrokerBuilder<S: TelemetrySink = NullSink> {
    config: BrokerConfig,
    clients: HashMap<String, Arc<ProviderClient>>,
    sink: S,
    clock: Arc<dyn Clock>,
}

impl BrokerBuilder<NullSink> {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config, clients: HashMap::new(), sink: NullSink, clock: Arc::new(MonotonicClock::default()) }
    }
}

impl<S: TelemetrySink> BrokerBuilder<S> {
    pub fn with_provider_client(mut self, name: impl Into<String>, client: Arc<ProviderClient>) -> Self {
        self.clients.insert(name.into(), client);
        self
    }

    pub fn with_sink<S2: TelemetrySink>(self, sink: S2) -> BrokerBuilder<S2> {
        BrokerBuilder { config: self.config, clients: self.clients, sink, clock: self.clock }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub async fn build(self, key_source: &dyn KeySource) -> Broker<S> {
        let providers: Vec<&str> = self.config.providers.keys().map(String::as_str).collect();

        let key_pool = KeyPoolBuilder::new().build(key_source, &providers).await;

        let rate_limiter = RateLimiter::new();
        let breakers = CircuitBreakerManager::new();
        let mut provider_entries = HashMap::new();

        for (name, provider_cfg) in &self.config.providers {
            rate_limiter.configure_provider(name.clone(), provider_cfg.token_budget.into());

            let breaker_cfg = self.config.circuit_breaker_for(name);
            breakers.register_breaker(
                name.clone(),
                CircuitBreakerConfig {
                    failure_threshold: breaker_cfg.fail_max,
                    recovery_timeout: breaker_cfg.timeout_duration(),
                    half_open_max_calls: 1,
                },
            );

            let client = self.clients.get(name).cloned().unwrap_or_else(|| {
                let dialect = provider_cfg.dialect.map(Into::into).unwrap_or(crate::provider::WireDialect::OpenAiCompatible);
                let mut profile = ProviderProfile {
                    name: name.clone(),
                    base_url: provider_cfg.base_url.clone(),
                    default_model: provider_cfg.default_model.clone(),
                    dialect,
                    timeout: provider_cfg.timeout(),
                    max_retries: provider_cfg.max_retries,
                    retry_delay: provider_cfg.retry_delay(),
                    extensions: serde_json::json!({}),
                };
                profile.timeout = provider_cfg.timeout();
                Arc::new(ProviderClient::new(profile, Arc::new(crate::transport::ReqwestTransport::new())))
            });

            provider_entries.insert(
                name.clone(),
                ProviderEntry { client, cost_per_1k_tokens: provider_cfg.token_budget.cost_per_1k_tokens },
            );
        }

        Broker {
            key_pool,
            rate_limiter,
            breakers,
            cache: FallbackCache::new(self.config.fallback.cache_max_size, self.config.fallback.cache_ttl()),
            health: HealthMonitor::new().with_recovery_min_interval(self.config.health.recovery_min_interval()),
            stats_collector: StatsCollector::new(),
            services: ServiceRegistry::new(),
            providers: provider_entries,
            mcp_available: !self.config.features.mcp_disabled,
            sink: self.sink,
            clock: self.clock,
            last_health_status: Mutex::new(HashMap::new()),
            last_recovery_count: AtomicUsize::new(0),
        }
    }
}

/// The broker. Owns every subsystem and exposes the four RPCs collaborators
/// (an HTTP router, a scheduler, a CLI) call against: `send`, `stream`,
/// `stats`, `reset_key_cooldown`, `register_service_health_update`.
pub struct Broker<S: TelemetrySink = NullSink> {
    key_pool: KeyPool,
    rate_limiter: RateLimiter,
    breakers: CircuitBreakerManager,
    cache: FallbackCache,
    health: HealthMonitor,
    stats_collector: StatsCollector,
    services: ServiceRegistry,
    providers: HashMap<String, ProviderEntry>,
    mcp_available: bool,
    sink: S,
    clock: Arc<dyn Clock>,
    last_health_status: Mutex<HashMap<String, HealthStatus>>,
    last_recovery_count: AtomicUsize,
}

impl<S> Broker<S>
where
    S: TelemetrySink,
    S::Future: Send,
{
    async fn emit(&self, event: BrokerEvent) {
        emit_best_effort(self.sink.clone(), PolicyEvent::Broker(event)).await;
    }

    fn cost_of(&self, provider: &str, tokens: u64) -> f64 {
        let per_1k = self.providers.get(provider).map(|e| e.cost_per_1k_tokens).unwrap_or(0.0);
        (tokens as f64 / 1000.0) * per_1k
    }

    fn account_provider_error(&self, key: &ApiKey, err: &ProviderError) {
        match err {
            ProviderError::RateLimited { retry_after } => {
                self.key_pool.mark_rate_limit(key, *retry_after);
                self.stats_collector.record_rate_limit_event();
            }
            ProviderError::Network(_) | ProviderError::Timeout(_) => self.key_pool.mark_network_error(key),
            ProviderError::UpstreamServer { .. } | ProviderError::Decode(_) => self.key_pool.mark_error(key),
            ProviderError::Auth { .. } => self.key_pool.mark_auth_error(key),
        }

        // §4.1 pool alert: more than half the pool cooling is worth surfacing
        // in Stats even though nothing in §4.1-§4.8 reacts to it directly.
        if self.key_pool.cooling_fraction(key.provider()) > 0.5 {
            self.stats_collector.record_key_pool_alert();
        }
    }

    /// Admission + key selection + breaker-guarded dispatch, looping at most
    /// [`MAX_KEY_ATTEMPTS`] times to cover the "auth error disables a key,
    /// retry with the next one" path. Returns the raw result and the index
    /// of the key that served it, or the terminal `BrokerError`.
    async fn dispatch(&self, request: &Request) -> Result<(crate::provider::ProviderCallResult, usize), BrokerError> {
        let entry = self
            .providers
            .get(&request.provider)
            .ok_or_else(|| BrokerError::Validation(format!("no client configured for provider {}", request.provider)))?;

        for _ in 0..MAX_KEY_ATTEMPTS {
            match self.rate_limiter.acquire(&request.provider, request.estimated_tokens) {
                Admission::AdmitNow => {}
                Admission::WaitForMs(ms) => {
                    self.emit(BrokerEvent::RateLimitThrottled { provider: request.provider.clone(), wait: Some(Duration::from_millis(ms)) })
                        .await;
                    tokio::time::sleep(Duration::from_millis(ms.min(MAX_LOCAL_WAIT.as_millis() as u64))).await;
                }
                Admission::Reject => {
                    self.emit(BrokerEvent::RateLimitThrottled { provider: request.provider.clone(), wait: None }).await;
                    return Err(BrokerError::RateLimited(RateLimitError::Rejected { provider: request.provider.clone() }));
                }
            }

            let key = self.key_pool.acquire(&request.provider)?;
            let call = ChatCall { messages: build_messages(request), temperature: request.temperature, max_tokens: request.max_tokens };

            let client = entry.client.clone();
            let key_for_call = key.clone();
            let call_for_call = call.clone();
            let outcome: Result<Result<crate::provider::ProviderCallResult, ProviderError>, BreakerError<ProviderError>> = self
                .breakers
                .call_with_breaker(&request.provider, move || {
                    let client = client.clone();
                    let key_for_call = key_for_call.clone();
                    let call_for_call = call_for_call.clone();
                    async move {
                        match client.chat(key_for_call.secret(), &call_for_call).await {
                            Ok(result) => Ok(Ok(result)),
                            Err(ProviderError::Auth { status }) => Ok(Err(ProviderError::Auth { status })),
                            Err(other) => Err(BreakerError::Inner(other)),
                        }
                    }
                })
                .await;

            match outcome {
                Ok(Ok(result)) => {
                    self.key_pool.mark_success(&key);
                    let cost = self.cost_of(&request.provider, result.token_usage.total_tokens);
                    self.rate_limiter.record_usage(&request.provider, result.token_usage.total_tokens, cost);
                    self.stats_collector.record_success(&request.provider, result.token_usage.total_tokens);
                    return Ok((result, key.index()));
                }
                Ok(Err(ProviderError::Auth { status })) => {
                    self.key_pool.mark_auth_error(&key);
                    self.stats_collector.record_error(&request.provider);
                    self.emit(BrokerEvent::KeyStateChanged {
                        provider: request.provider.clone(),
                        key_index: key.index(),
                        from: "healthy",
                        to: "disabled",
                    })
                    .await;
                    let _ = status;
                    continue;
                }
                Ok(Err(other)) => {
                    // Only `Auth` is ever wrapped as `Ok(Err(_))`; anything
                    // else reaching here is a logic error in the thunk above.
                    self.account_provider_error(&key, &other);
                    self.stats_collector.record_error(&request.provider);
                    return Err(BrokerError::Provider(other));
                }
                Err(BreakerError::Open { failure_count, open_duration }) => {
                    self.emit(BrokerEvent::BreakerTripped { name: request.provider.clone(), consecutive_failures: failure_count }).await;
                    return Err(BrokerError::CircuitOpen(CircuitBreakerError::Open {
                        name: request.provider.clone(),
                        failure_count,
                        open_duration,
                    }));
                }
                Err(BreakerError::Inner(provider_err)) => {
                    self.account_provider_error(&key, &provider_err);
                    self.stats_collector.record_error(&request.provider);
                    return Err(BrokerError::Provider(provider_err));
                }
            }
        }

        Err(BrokerError::NoKeyAvailable(crate::error::KeyPoolError::NoKeyAvailable(request.provider.clone())))
    }

    fn validation_response(&self, msg: String) -> Response {
        Response {
            success: false,
            content: String::new(),
            reasoning_content: None,
            error: Some(msg),
            channel_used: Channel::DirectApi,
            api_key_index: None,
            latency_ms: 0,
            token_usage: None,
            cost_estimate: None,
            fallback_type: None,
        }
    }

    fn success_response(&self, request: &Request, result: crate::provider::ProviderCallResult, key_index: usize) -> Response {
        if request.use_cache {
            self.cache.set(&request.provider, &request.prompt, result.content.clone(), None);
        }
        let cost = self.cost_of(&request.provider, result.token_usage.total_tokens);
        Response {
            success: true,
            content: result.content,
            reasoning_content: result.reasoning_content,
            error: None,
            // MCP is modeled purely as a health-probe channel preference
            // here, not an alternate dispatch wire, so successful direct
            // calls always report DIRECT_API.
            channel_used: Channel::DirectApi,
            api_key_index: Some(key_index),
            latency_ms: result.latency_ms,
            token_usage: Some(result.token_usage),
            cost_estimate: Some(cost),
            fallback_type: None,
        }
    }

    /// Direct (non-cascading) failure surface for a dispatch error that
    /// §7's error table says is surfaced as-is rather than run through the
    /// fallback cascade.
    fn direct_error_response(&self, err: BrokerError) -> Response {
        Response {
            success: false,
            content: String::new(),
            reasoning_content: None,
            error: Some(err.to_string()),
            channel_used: Channel::DirectApi,
            api_key_index: None,
            latency_ms: 0,
            token_usage: None,
            cost_estimate: None,
            fallback_type: None,
        }
    }

    /// Route a dispatch error to the fallback cascade or straight back to
    /// the caller, per `BrokerError::triggers_fallback`.
    async fn handle_dispatch_error(&self, request: &Request, err: BrokerError) -> Response {
        if err.triggers_fallback() {
            self.fallback_response(request, err).await
        } else {
            self.direct_error_response(err)
        }
    }

    async fn fallback_response(&self, request: &Request, err: BrokerError) -> Response {
        self.fallback_response_for_message(request, err.to_string()).await
    }

    /// Shared tail of the fallback cascade; takes a plain message so the
    /// cache-coalesced path in `send` (whose failures surface as a `String`
    /// from `FallbackCache::get_or_build`, not a `BrokerError`) can reuse it.
    async fn fallback_response_for_message(&self, request: &Request, message: String) -> Response {
        self.stats_collector.record_fallback(&request.provider);
        let (content, kind) = self.cache.fallback(&request.provider, &request.prompt, &request.task_type);
        self.emit(BrokerEvent::CacheTierServed { provider: request.provider.clone(), kind: fallback_kind_label(kind) }).await;
        Response {
            success: kind != FallbackKind::Synthetic,
            content,
            reasoning_content: None,
            error: Some(message),
            channel_used: Channel::Fallback,
            api_key_index: None,
            latency_ms: 0,
            token_usage: None,
            cost_estimate: None,
            fallback_type: Some(kind),
        }
    }

    /// §4.7's dispatch pipeline: validate → cache short-circuit → admission
    /// → key selection → breaker-guarded call → fallback cascade on any
    /// admission or upstream failure.
    ///
    /// Cache-eligible requests run the upstream dispatch behind
    /// `FallbackCache::get_or_build`'s coalescing gate: concurrent `send`
    /// calls for the same provider+prompt share a single in-flight dispatch
    /// instead of each independently hitting the upstream (§8 #3).
    pub async fn send(&self, request: Request) -> Response {
        self.stats_collector.record_request(&request.provider);

        if let Err(msg) = validate(&request) {
            return self.validation_response(msg);
        }

        if !request.use_cache {
            return match self.dispatch(&request).await {
                Ok((result, key_index)) => self.success_response(&request, result, key_index),
                Err(err) => self.handle_dispatch_error(&request, err).await,
            };
        }

        if let Some((content, kind)) = self.cache.get(&request.provider, &request.prompt) {
            return Response {
                success: true,
                content,
                reasoning_content: None,
                error: None,
                channel_used: Channel::Cache,
                api_key_index: None,
                latency_ms: 0,
                token_usage: None,
                cost_estimate: None,
                fallback_type: Some(kind),
            };
        }

        let slot: std::cell::RefCell<Option<(crate::provider::ProviderCallResult, usize)>> = std::cell::RefCell::new(None);
        let built = self
            .cache
            .get_or_build(&request.provider, &request.prompt, None, || async {
                match self.dispatch(&request).await {
                    Ok((result, key_index)) => {
                        let content = result.content.clone();
                        *slot.borrow_mut() = Some((result, key_index));
                        Ok(content)
                    }
                    Err(err) => Err(err.to_string()),
                }
            })
            .await;

        match built {
            Ok(content) => match slot.into_inner() {
                Some((result, key_index)) => self.success_response(&request, result, key_index),
                // Another caller's in-flight build served this one; we made
                // no upstream call of our own, so report it as a cache hit.
                None => Response {
                    success: true,
                    content,
                    reasoning_content: None,
                    error: None,
                    channel_used: Channel::Cache,
                    api_key_index: None,
                    latency_ms: 0,
                    token_usage: None,
                    cost_estimate: None,
                    fallback_type: Some(FallbackKind::Cached),
                },
            },
            Err(cache_err) => self.fallback_response_for_message(&request, cache_err.to_string()).await,
        }
    }

    /// §4.5's streaming contract: a lazy, finite, non-restartable sequence
    /// of text chunks. Unlike `send`, streaming does not retry across keys
    /// or consult the fallback cascade once bytes have started arriving —
    /// there is no way to splice a cached reply mid-stream.
    pub async fn stream(&self, request: Request) -> Result<ChatChunkStream, BrokerError> {
        if let Err(msg) = validate(&request) {
            return Err(BrokerError::Validation(msg));
        }

        let entry = self
            .providers
            .get(&request.provider)
            .ok_or_else(|| BrokerError::Validation(format!("no client configured for provider {}", request.provider)))?;

        match self.rate_limiter.acquire(&request.provider, request.estimated_tokens) {
            Admission::AdmitNow => {}
            Admission::WaitForMs(ms) => {
                tokio::time::sleep(Duration::from_millis(ms.min(MAX_LOCAL_WAIT.as_millis() as u64))).await;
            }
            Admission::Reject => {
                return Err(BrokerError::RateLimited(RateLimitError::Rejected { provider: request.provider.clone() }));
            }
        }

        let key = self.key_pool.acquire(&request.provider)?;
        let call = ChatCall { messages: build_messages(&request), temperature: request.temperature, max_tokens: request.max_tokens };
        let result = entry.client.chat_stream(key.secret(), &call).await;
        match &result {
            Ok(_) => self.key_pool.mark_success(&key),
            Err(e) => self.account_provider_error(&key, e),
        }
        result.map_err(BrokerError::Provider)
    }

    /// Aggregated operational snapshot across every subsystem.
    pub fn stats(&self) -> Stats {
        let breaker_metrics = self.breakers.get_metrics();
        let health_metrics = self.health.get_metrics();
        self.stats_collector.snapshot(breaker_metrics, health_metrics, self.mcp_available)
    }

    /// Manually clear a key's cooldown (and, unless disabled, its health),
    /// returning how many keys were reset.
    pub fn reset_key_cooldown(&self, provider: &str, index: Option<usize>) -> usize {
        self.key_pool.reset_cooldown(provider, index)
    }

    /// Push an out-of-band health update for a named upstream into the
    /// lightweight [`ServiceRegistry`], independent of the probe-driven
    /// [`HealthMonitor`].
    pub fn register_service_health_update(
        &self,
        name: impl Into<String>,
        health: ServiceHealth,
        circuit_state: Option<CircuitState>,
        latency_p95_ms: Option<f64>,
        error_rate: Option<f64>,
    ) {
        self.services.update(name, health, circuit_state, latency_p95_ms, error_rate);
    }

    /// Run one adaptation pass over every registered breaker; exposed so a
    /// host process can drive it on its own schedule rather than the broker
    /// spawning a background task of its own.
    pub async fn maybe_adapt_breakers(&self, min_interval: Duration) -> Vec<crate::circuit_breaker_manager::AdaptationRecord> {
        let records = self.breakers.maybe_adapt_breakers(min_interval);
        for record in &records {
            self.emit(BrokerEvent::BreakerAdapted {
                name: record.breaker.clone(),
                new_fail_max: record.new_fail_max,
                new_timeout: record.new_timeout,
                reason: record.reason,
            })
            .await;
        }
        records
    }

    /// Run one health-probe tick across every registered component, emitting
    /// a `HealthStatusChanged` event for each component whose status moved
    /// since the previous tick and a `RecoveryAttempted` event for every new
    /// entry `HealthMonitor` appended to its recovery history.
    pub async fn tick_health(&self) {
        let results = self.health.tick().await;
        self.stats_collector.record_health_check(self.clock.now_millis());

        for result in &results {
            let previous = {
                let mut last = self.last_health_status.lock().unwrap_or_else(|p| p.into_inner());
                last.insert(result.component.clone(), result.status)
            };
            if previous != Some(result.status) {
                self.emit(BrokerEvent::HealthStatusChanged {
                    component: result.component.clone(),
                    from: previous.map(status_label).unwrap_or("unknown"),
                    to: status_label(result.status),
                })
                .await;
            }
        }

        let history = self.health.get_recovery_history(usize::MAX);
        let total = history.len();
        let previous_total = self.last_recovery_count.swap(total, Ordering::Relaxed);
        let new_count = total.saturating_sub(previous_total);
        for record in history.iter().take(new_count).rev() {
            self.emit(BrokerEvent::RecoveryAttempted {
                component: record.component.clone(),
                action: recovery_action_label(record.action),
                success: record.success,
            })
            .await;
        }
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn service_registry(&self) -> &ServiceRegistry {
        &self.services
    }
}
