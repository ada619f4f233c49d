//! Service-health rollup, Stats snapshot, and the autonomy score formula.
//!
//! Grounded on `examples/original_source/backend/services/fallback_service.py`'s
//! `register_service`/`update_service_health`/`get_overall_health` registry
//! (health rollup) and SPEC_FULL.md §4.9 (autonomy score).

use crate::circuit_breaker::CircuitState;
use crate::circuit_breaker_manager::BreakerMetrics;
use crate::health::HealthMetrics;
use std::collections::HashMap;
use std::sync::Mutex;

/// Health of one named upstream service, tracked independently of
/// [`crate::health::HealthMonitor`]'s probe-driven components — this is a
/// lighter-weight registry callers can push updates into directly (see
/// `Broker::register_service_health_update`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: String,
    pub health: ServiceHealth,
    pub circuit_state: Option<CircuitState>,
    pub latency_p95_ms: Option<f64>,
    pub error_rate: Option<f64>,
}

/// Registry of named upstream statuses with an any-UNHEALTHY-dominates
/// rollup rule.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, ServiceStatus>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &self,
        name: impl Into<String>,
        health: ServiceHealth,
        circuit_state: Option<CircuitState>,
        latency_p95_ms: Option<f64>,
        error_rate: Option<f64>,
    ) {
        let name = name.into();
        let mut services = self.services.lock().unwrap_or_else(|p| p.into_inner());
        services.insert(name.clone(), ServiceStatus { name, health, circuit_state, latency_p95_ms, error_rate });
    }

    pub fn get(&self, name: &str) -> Option<ServiceStatus> {
        self.services.lock().unwrap_or_else(|p| p.into_inner()).get(name).cloned()
    }

    pub fn all(&self) -> Vec<ServiceStatus> {
        self.services.lock().unwrap_or_else(|p| p.into_inner()).values().cloned().collect()
    }

    /// Any UNHEALTHY dominates; else any DEGRADED dominates; else all
    /// HEALTHY yields HEALTHY; an empty registry is UNKNOWN.
    pub fn overall_health(&self) -> ServiceHealth {
        let services = self.services.lock().unwrap_or_else(|p| p.into_inner());
        if services.is_empty() {
            return ServiceHealth::Unknown;
        }
        if services.values().any(|s| s.health == ServiceHealth::Unhealthy) {
            return ServiceHealth::Unhealthy;
        }
        if services.values().any(|s| s.health == ServiceHealth::Degraded) {
            return ServiceHealth::Degraded;
        }
        if services.values().all(|s| s.health == ServiceHealth::Healthy) {
            return ServiceHealth::Healthy;
        }
        ServiceHealth::Unknown
    }
}

/// Inputs to the autonomy score formula, gathered from the other
/// subsystems' metrics snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutonomyInputs {
    pub successful_recoveries: usize,
    pub total_recovery_attempts: usize,
    pub total_trips: usize,
    pub total_calls: usize,
    pub healthy_components: usize,
    pub total_components: usize,
}

/// `[0.0, 10.0]`, rounded to one decimal; purely observational.
pub fn autonomy_score(inputs: &AutonomyInputs) -> f64 {
    let auto_recovery_component = if inputs.total_recovery_attempts == 0 {
        0.0
    } else {
        (inputs.successful_recoveries as f64 / inputs.total_recovery_attempts as f64) * 4.0
    };

    let trip_rate_percent = if inputs.total_calls == 0 {
        0.0
    } else {
        (inputs.total_trips as f64 / inputs.total_calls as f64) * 100.0
    };
    let circuit_component = (3.0 - trip_rate_percent / 10.0).max(0.0);

    let health_component = if inputs.total_components == 0 {
        0.0
    } else {
        (inputs.healthy_components as f64 / inputs.total_components as f64) * 3.0
    };

    let score = auto_recovery_component + circuit_component + health_component;
    (score.clamp(0.0, 10.0) * 10.0).round() / 10.0
}

/// Request-total and per-provider counters, written by the Broker as
/// requests complete.
#[derive(Debug, Clone, Default)]
pub struct ProviderCounters {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub fallbacks: u64,
    pub tokens_used: u64,
}

#[derive(Default)]
pub struct StatsCollector {
    per_provider: Mutex<HashMap<String, ProviderCounters>>,
    key_pool_alerts: Mutex<u64>,
    rate_limit_events: Mutex<u64>,
    last_health_check_millis: Mutex<u64>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, provider: &str) {
        let mut per_provider = self.per_provider.lock().unwrap_or_else(|p| p.into_inner());
        per_provider.entry(provider.to_string()).or_default().requests += 1;
    }

    pub fn record_success(&self, provider: &str, tokens: u64) {
        let mut per_provider = self.per_provider.lock().unwrap_or_else(|p| p.into_inner());
        let entry = per_provider.entry(provider.to_string()).or_default();
        entry.successes += 1;
        entry.tokens_used += tokens;
    }

    pub fn record_error(&self, provider: &str) {
        let mut per_provider = self.per_provider.lock().unwrap_or_else(|p| p.into_inner());
        per_provider.entry(provider.to_string()).or_default().errors += 1;
    }

    pub fn record_fallback(&self, provider: &str) {
        let mut per_provider = self.per_provider.lock().unwrap_or_else(|p| p.into_inner());
        per_provider.entry(provider.to_string()).or_default().fallbacks += 1;
    }

    pub fn record_key_pool_alert(&self) {
        *self.key_pool_alerts.lock().unwrap_or_else(|p| p.into_inner()) += 1;
    }

    pub fn record_rate_limit_event(&self) {
        *self.rate_limit_events.lock().unwrap_or_else(|p| p.into_inner()) += 1;
    }

    pub fn record_health_check(&self, now_millis: u64) {
        *self.last_health_check_millis.lock().unwrap_or_else(|p| p.into_inner()) = now_millis;
    }

    pub fn snapshot(
        &self,
        breaker_metrics: HashMap<String, BreakerMetrics>,
        health_metrics: HealthMetrics,
        mcp_available: bool,
    ) -> Stats {
        let per_provider = self.per_provider.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let total_calls: usize = breaker_metrics.values().map(|m| m.total_calls).sum();
        let total_trips: usize = breaker_metrics.values().map(|m| m.total_trips).sum();
        let healthy_components = *health_metrics.by_status.get("healthy").unwrap_or(&0);
        let total_components: usize = health_metrics.by_status.values().sum();

        let inputs = AutonomyInputs {
            successful_recoveries: health_metrics.recovery_successes,
            total_recovery_attempts: health_metrics.recovery_attempts,
            total_trips,
            total_calls,
            healthy_components,
            total_components,
        };

        Stats {
            per_provider,
            key_pool_alerts: *self.key_pool_alerts.lock().unwrap_or_else(|p| p.into_inner()),
            rate_limit_events: *self.rate_limit_events.lock().unwrap_or_else(|p| p.into_inner()),
            auto_recoveries: health_metrics.recovery_successes as u64,
            breakers: breaker_metrics,
            health_by_status: health_metrics.by_status,
            last_health_check_millis: *self.last_health_check_millis.lock().unwrap_or_else(|p| p.into_inner()),
            mcp_available,
            autonomy_score: autonomy_score(&inputs),
        }
    }
}

/// Aggregated operational snapshot surfaced through `Broker::stats`.
#[derive(Debug, Clone)]
pub struct Stats {
    pub per_provider: HashMap<String, ProviderCounters>,
    pub key_pool_alerts: u64,
    pub rate_limit_events: u64,
    pub auto_recoveries: u64,
    pub breakers: HashMap<String, BreakerMetrics>,
    pub health_by_status: HashMap<&'static str, usize>,
    pub last_health_check_millis: u64,
    pub mcp_available: bool,
    pub autonomy_score: f64,
}
