//! Deserializable configuration tree mirroring the broker's external
//! configuration surface.
//!
//! Grounded on the teacher's `adaptive.rs` (`Adaptive<T>` hot-reload wrapper)
//! and `examples/original_source/backend/agents/llm/rate_limiter.py`'s
//! `TokenBudget` fields. Hot-reloadable subsets are wrapped in `Adaptive<T>`
//! so a config reload never blocks in-flight requests.

use crate::adaptive::Adaptive;
use crate::provider::WireDialect;
use crate::rate_limiter::TokenBudget;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_timeout_seconds() -> u64 {
    60
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_seconds() -> u64 {
    1
}

/// Per-provider token budget as it appears in configuration files. Converts
/// to [`TokenBudget`] with `From`.
///
/// Adds `cost_per_1k_tokens`, not named in the distilled configuration
/// surface, so callers can derive `actual_cost` from `actual_tokens` without
/// a separate pricing table; recorded as a deliberate addition in DESIGN.md.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TokenBudgetConfig {
    #[serde(default = "default_tokens_per_minute")]
    pub per_minute: u64,
    #[serde(default = "default_tokens_per_hour")]
    pub per_hour: u64,
    #[serde(default = "default_tokens_per_day")]
    pub per_day: u64,
    #[serde(default = "default_cost_per_hour")]
    pub cost_per_hour: f64,
    #[serde(default = "default_cost_per_day")]
    pub cost_per_day: f64,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
}

fn default_tokens_per_minute() -> u64 {
    100_000
}
fn default_tokens_per_hour() -> u64 {
    2_000_000
}
fn default_tokens_per_day() -> u64 {
    20_000_000
}
fn default_cost_per_hour() -> f64 {
    5.0
}
fn default_cost_per_day() -> f64 {
    50.0
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            per_minute: default_tokens_per_minute(),
            per_hour: default_tokens_per_hour(),
            per_day: default_tokens_per_day(),
            cost_per_hour: default_cost_per_hour(),
            cost_per_day: default_cost_per_day(),
            cost_per_1k_tokens: 0.0,
        }
    }
}

impl From<TokenBudgetConfig> for TokenBudget {
    fn from(cfg: TokenBudgetConfig) -> Self {
        TokenBudget {
            max_tokens_per_minute: cfg.per_minute,
            max_tokens_per_hour: cfg.per_hour,
            max_tokens_per_day: cfg.per_day,
            max_cost_per_hour_usd: cfg.cost_per_hour,
            max_cost_per_day_usd: cfg.cost_per_day,
        }
    }
}

/// Which wire dialect a provider speaks, as written in config files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DialectConfig {
    OpenaiCompatible,
    Ollama,
}

impl From<DialectConfig> for WireDialect {
    fn from(d: DialectConfig) -> Self {
        match d {
            DialectConfig::OpenaiCompatible => WireDialect::OpenAiCompatible,
            DialectConfig::Ollama => WireDialect::Ollama,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProviderConfig {
    pub base_url: String,
    pub default_model: String,
    #[serde(default)]
    pub dialect: Option<DialectConfig>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default)]
    pub rate_limit_rpm: Option<u64>,
    #[serde(default)]
    pub token_budget: TokenBudgetConfig,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CircuitBreakerConfigEntry {
    #[serde(default = "default_fail_max")]
    pub fail_max: usize,
    #[serde(default = "default_timeout_duration_seconds")]
    pub timeout_duration_seconds: u64,
    #[serde(default)]
    pub expected_errors: Vec<String>,
}

fn default_fail_max() -> usize {
    5
}
fn default_timeout_duration_seconds() -> u64 {
    30
}

impl Default for CircuitBreakerConfigEntry {
    fn default() -> Self {
        Self {
            fail_max: default_fail_max(),
            timeout_duration_seconds: default_timeout_duration_seconds(),
            expected_errors: Vec::new(),
        }
    }
}

impl CircuitBreakerConfigEntry {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout_duration_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    #[serde(default = "default_recovery_min_interval_seconds")]
    pub recovery_min_interval_seconds: u64,
}

fn default_health_interval_seconds() -> u64 {
    30
}
fn default_probe_timeout_seconds() -> u64 {
    10
}
fn default_recovery_min_interval_seconds() -> u64 {
    60
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_health_interval_seconds(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            recovery_min_interval_seconds: default_recovery_min_interval_seconds(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn recovery_min_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_min_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FallbackConfig {
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
}

fn default_cache_max_size() -> usize {
    1000
}
fn default_cache_ttl_seconds() -> u64 {
    3600
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            cache_max_size: default_cache_max_size(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

impl FallbackConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

/// Feature flags, §6: `force_direct_api` (skip secondary transports),
/// `mcp_disabled` (treat MCP as DECOMMISSIONED).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FeatureFlags {
    #[serde(default)]
    pub force_direct_api: bool,
    #[serde(default)]
    pub mcp_disabled: bool,
}

/// Root configuration tree. Deserializes from whatever format the host
/// process chooses (TOML/JSON/YAML all work through `serde`); the broker
/// itself only knows `serde_json::Value` at its edges for provider
/// extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BrokerConfig {
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub circuit_breakers: HashMap<String, CircuitBreakerConfigEntry>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub features: FeatureFlags,
}

impl BrokerConfig {
    pub fn circuit_breaker_for(&self, provider: &str) -> CircuitBreakerConfigEntry {
        self.circuit_breakers.get(provider).cloned().unwrap_or_default()
    }

    /// Wrap the per-provider token budgets in `Adaptive<T>` so a live config
    /// reload can swap them without blocking requests in flight.
    pub fn adaptive_budgets(&self) -> HashMap<String, Adaptive<TokenBudget>> {
        self.providers
            .iter()
            .map(|(name, cfg)| (name.clone(), Adaptive::new(TokenBudget::from(cfg.token_budget))))
            .collect()
    }
}
