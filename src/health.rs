//! Health probing and recovery orchestration.
//!
//! Grounded on `examples/original_source/backend/agents/health_monitor.py`'s
//! `HealthMonitor`: probe registration, a periodic tick loop, recovery
//! callbacks keyed by action type, and a bounded recovery-history ring.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

use crate::clock::{Clock, MonotonicClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
    Decommissioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryActionKind {
    RotateKeys,
    ResetErrors,
    RestartService,
    ForceHealthCheck,
    ResetCircuitBreaker,
    NoAction,
}

#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
    pub checked_at_millis: u64,
    pub recovery_suggested: Option<RecoveryActionKind>,
}

#[derive(Debug, Clone)]
pub struct RecoveryRecord {
    pub action: RecoveryActionKind,
    pub component: String,
    pub reason: String,
    pub executed_at_millis: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// A health probe for one component. Implemented per-collaborator (key
/// pool, a provider's upstream, an optional secondary transport).
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> HealthCheckResult;
}

/// Runs a registered recovery action for a component. Recovery callbacks are
/// small closures captured at startup; the monitor never holds a reference
/// back into the broker beyond these.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    async fn recover(&self, component: &str) -> Result<(), String>;
}

/// Strategy decision for routing file/transport operations when a secondary
/// channel (an "MCP"-like transport) may or may not be available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperationStrategy {
    McpPrimary,
    McpDegraded,
    DirectFallback,
}

const RECOVERY_HISTORY_CAP: usize = 100;
const PROBE_TTL_MILLIS: u64 = 30_000;

struct ComponentEntry {
    probe: Arc<dyn HealthProbe>,
    recovery: Option<Arc<dyn RecoveryAction>>,
    last_result: Mutex<Option<HealthCheckResult>>,
    last_probed_millis: AtomicU64,
    last_recovery_millis: AtomicU64,
    decommissioned: AtomicBool,
    in_flight: AsyncMutex<()>,
}

pub struct HealthMonitor {
    clock: Arc<dyn Clock>,
    components: Mutex<HashMap<String, Arc<ComponentEntry>>>,
    recovery_history: Mutex<VecDeque<RecoveryRecord>>,
    recovery_min_interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(MonotonicClock::default()),
            components: Mutex::new(HashMap::new()),
            recovery_history: Mutex::new(VecDeque::new()),
            recovery_min_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_recovery_min_interval(mut self, d: Duration) -> Self {
        self.recovery_min_interval = d;
        self
    }

    pub fn register_health_check(
        &self,
        component: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
        recovery: Option<Arc<dyn RecoveryAction>>,
    ) {
        let name = component.into();
        let entry = Arc::new(ComponentEntry {
            probe,
            recovery,
            last_result: Mutex::new(None),
            last_probed_millis: AtomicU64::new(0),
            last_recovery_millis: AtomicU64::new(0),
            decommissioned: AtomicBool::new(false),
            in_flight: AsyncMutex::new(()),
        });
        self.components
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name, entry);
    }

    pub fn decommission(&self, component: &str) {
        let components = self.components.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = components.get(component) {
            entry.decommissioned.store(true, Ordering::Relaxed);
            let mut last = entry.last_result.lock().unwrap_or_else(|p| p.into_inner());
            *last = Some(HealthCheckResult {
                component: component.to_string(),
                status: HealthStatus::Decommissioned,
                message: "disabled by configuration".into(),
                checked_at_millis: self.clock.now_millis(),
                recovery_suggested: None,
            });
        }
    }

    fn entry(&self, component: &str) -> Option<Arc<ComponentEntry>> {
        self.components
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(component)
            .cloned()
    }

    /// Run one probe/recovery cycle for a single component. No more than one
    /// concurrent probe per component is ever in flight (`in_flight` gate).
    pub async fn check_component_health(&self, component: &str) -> Option<HealthCheckResult> {
        let entry = self.entry(component)?;
        if entry.decommissioned.load(Ordering::Relaxed) {
            return entry.last_result.lock().unwrap_or_else(|p| p.into_inner()).clone();
        }

        let _guard = entry.in_flight.lock().await;
        let result = match tokio::time::timeout(self.probe_timeout, entry.probe.check()).await {
            Ok(r) => r,
            Err(_) => HealthCheckResult {
                component: component.to_string(),
                status: HealthStatus::Unhealthy,
                message: "timeout".into(),
                checked_at_millis: self.clock.now_millis(),
                recovery_suggested: Some(RecoveryActionKind::ForceHealthCheck),
            },
        };

        entry.last_probed_millis.store(self.clock.now_millis(), Ordering::Relaxed);
        *entry.last_result.lock().unwrap_or_else(|p| p.into_inner()) = Some(result.clone());

        if result.status == HealthStatus::Unhealthy {
            if let Some(kind) = result.recovery_suggested {
                self.maybe_recover(component, &entry, kind).await;
            }
        }

        Some(result)
    }

    async fn maybe_recover(&self, component: &str, entry: &Arc<ComponentEntry>, kind: RecoveryActionKind) {
        let Some(recovery) = entry.recovery.clone() else { return };

        let now = self.clock.now_millis();
        let last = entry.last_recovery_millis.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.recovery_min_interval.as_millis() as u64 {
            return;
        }
        entry.last_recovery_millis.store(now, Ordering::Relaxed);

        let outcome = recovery.recover(component).await;
        let record = RecoveryRecord {
            action: kind,
            component: component.to_string(),
            reason: "unhealthy probe suggested recovery".into(),
            executed_at_millis: now,
            success: outcome.is_ok(),
            error: outcome.err(),
        };
        self.push_recovery_record(record);

        // grace period then re-probe, matching the original's ~5s wait.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let _ = self.check_component_health(component).await;
    }

    fn push_recovery_record(&self, record: RecoveryRecord) {
        let mut history = self.recovery_history.lock().unwrap_or_else(|p| p.into_inner());
        if history.len() >= RECOVERY_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(record);
    }

    pub fn get_recovery_history(&self, limit: usize) -> Vec<RecoveryRecord> {
        let history = self.recovery_history.lock().unwrap_or_else(|p| p.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Run one tick across every registered, non-decommissioned component.
    /// Returns every probe result from this tick, for callers that want to
    /// surface status transitions (e.g. `Broker::tick_health`).
    pub async fn tick(&self) -> Vec<HealthCheckResult> {
        let names: Vec<String> = {
            let components = self.components.lock().unwrap_or_else(|p| p.into_inner());
            components
                .iter()
                .filter(|(_, e)| !e.decommissioned.load(Ordering::Relaxed))
                .map(|(name, _)| name.clone())
                .collect()
        };
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            if let Some(result) = self.check_component_health(&name).await {
                results.push(result);
            }
        }
        results
    }

    pub fn get_metrics(&self) -> HealthMetrics {
        let components = self.components.lock().unwrap_or_else(|p| p.into_inner());
        let mut by_status: HashMap<&'static str, usize> = HashMap::new();
        for entry in components.values() {
            let status = entry
                .last_result
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .as_ref()
                .map(|r| r.status)
                .unwrap_or(HealthStatus::Unknown);
            *by_status.entry(status_label(status)).or_insert(0) += 1;
        }
        let history = self.recovery_history.lock().unwrap_or_else(|p| p.into_inner());
        let attempts = history.len();
        let successes = history.iter().filter(|r| r.success).count();
        HealthMetrics {
            by_status,
            recovery_attempts: attempts,
            recovery_successes: successes,
            recovery_success_rate: if attempts == 0 { 0.0 } else { successes as f64 / attempts as f64 },
        }
    }

    /// Decide how file/secondary-transport operations should be routed,
    /// refreshing a stale probe (older than [`PROBE_TTL_MILLIS`]) first.
    pub async fn get_file_operation_strategy(&self, component: &str) -> FileOperationStrategy {
        let Some(entry) = self.entry(component) else {
            return FileOperationStrategy::DirectFallback;
        };
        let now = self.clock.now_millis();
        let stale = now.saturating_sub(entry.last_probed_millis.load(Ordering::Relaxed)) > PROBE_TTL_MILLIS;
        if stale {
            self.check_component_health(component).await;
        }
        let status = self
            .entry(component)
            .and_then(|e| e.last_result.lock().unwrap_or_else(|p| p.into_inner()).as_ref().map(|r| r.status))
            .unwrap_or(HealthStatus::Unknown);
        match status {
            HealthStatus::Healthy => FileOperationStrategy::McpPrimary,
            HealthStatus::Degraded => FileOperationStrategy::McpDegraded,
            _ => FileOperationStrategy::DirectFallback,
        }
    }

    /// Combined status for a dual-probe ("MCP"-like) dependency: both
    /// succeed → Healthy, exactly one → Degraded, both fail → Unhealthy.
    pub fn combine_dual_probe(http_ok: bool, ping_ok: bool) -> HealthStatus {
        match (http_ok, ping_ok) {
            (true, true) => HealthStatus::Healthy,
            (true, false) | (false, true) => HealthStatus::Degraded,
            (false, false) => HealthStatus::Unhealthy,
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

pub fn status_label(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Degraded => "degraded",
        HealthStatus::Unhealthy => "unhealthy",
        HealthStatus::Unknown => "unknown",
        HealthStatus::Decommissioned => "decommissioned",
    }
}

pub fn recovery_action_label(kind: RecoveryActionKind) -> &'static str {
    match kind {
        RecoveryActionKind::RotateKeys => "rotate_keys",
        RecoveryActionKind::ResetErrors => "reset_errors",
        RecoveryActionKind::RestartService => "restart_service",
        RecoveryActionKind::ForceHealthCheck => "force_health_check",
        RecoveryActionKind::ResetCircuitBreaker => "reset_circuit_breaker",
        RecoveryActionKind::NoAction => "no_action",
    }
}

#[derive(Debug, Clone)]
pub struct HealthMetrics {
    pub by_status: HashMap<&'static str, usize>,
    pub recovery_attempts: usize,
    pub recovery_successes: usize,
    pub recovery_success_rate: f64,
}
