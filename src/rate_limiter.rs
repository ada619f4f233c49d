//! Token-aware sliding-window rate limiting per provider.
//!
//! Grounded on `examples/original_source/backend/agents/llm/rate_limiter.py`'s
//! `TokenAwareRateLimiter`/`TokenBudget`/`UsageWindow`. The original checks
//! only the hourly cost window; this implementation checks both the hourly
//! and daily cost budgets (see SPEC_FULL.md §4.2 Supplemental).

use crate::clock::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-provider budget ceilings across the three sliding windows plus cost.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    pub max_tokens_per_minute: u64,
    pub max_tokens_per_hour: u64,
    pub max_tokens_per_day: u64,
    pub max_cost_per_hour_usd: f64,
    pub max_cost_per_day_usd: f64,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_tokens_per_minute: 100_000,
            max_tokens_per_hour: 2_000_000,
            max_tokens_per_day: 20_000_000,
            max_cost_per_hour_usd: 5.0,
            max_cost_per_day_usd: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct UsageWindow {
    window_seconds: u64,
    window_start_millis: u64,
    tokens_used: u64,
    cost_usd: f64,
    request_count: u64,
}

impl UsageWindow {
    fn new(window_seconds: u64, now_millis: u64) -> Self {
        Self {
            window_seconds,
            window_start_millis: now_millis,
            tokens_used: 0,
            cost_usd: 0.0,
            request_count: 0,
        }
    }

    fn reset_if_expired(&mut self, now_millis: u64) {
        if now_millis.saturating_sub(self.window_start_millis) >= self.window_seconds * 1000 {
            self.window_start_millis = now_millis;
            self.tokens_used = 0;
            self.cost_usd = 0.0;
            self.request_count = 0;
        }
    }

    fn remaining_seconds(&self, now_millis: u64) -> u64 {
        let elapsed = now_millis.saturating_sub(self.window_start_millis) / 1000;
        self.window_seconds.saturating_sub(elapsed)
    }

    fn record(&mut self, tokens: u64, cost: f64) {
        self.tokens_used += tokens;
        self.cost_usd += cost;
        self.request_count += 1;
    }
}

/// Admission decision returned by [`RateLimiter::acquire`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    AdmitNow,
    WaitForMs(u64),
    Reject,
}

struct ProviderState {
    minute: Mutex<UsageWindow>,
    hour: Mutex<UsageWindow>,
    day: Mutex<UsageWindow>,
    budget: TokenBudget,
    throttled_count: AtomicU64,
}

/// Snapshot of one provider's current usage, for `Stats`.
#[derive(Debug, Clone)]
pub struct RateLimiterMetrics {
    pub minute_tokens_used: u64,
    pub hour_tokens_used: u64,
    pub day_tokens_used: u64,
    pub hour_cost_usd: f64,
    pub day_cost_usd: f64,
    pub throttled_count: u64,
}

/// How long a locally-rejected request may wait before being abandoned to
/// the fallback cascade, per §4.7 step 3.
pub const MAX_LOCAL_WAIT: Duration = Duration::from_secs(10);

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    providers: Mutex<HashMap<String, Arc<ProviderState>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(MonotonicClock::default()),
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            clock: Arc::new(clock),
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn configure_provider(&self, provider: impl Into<String>, budget: TokenBudget) {
        let now = self.clock.now_millis();
        let state = Arc::new(ProviderState {
            minute: Mutex::new(UsageWindow::new(60, now)),
            hour: Mutex::new(UsageWindow::new(3600, now)),
            day: Mutex::new(UsageWindow::new(86_400, now)),
            budget,
            throttled_count: AtomicU64::new(0),
        });
        self.providers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(provider.into(), state);
    }

    fn state(&self, provider: &str) -> Arc<ProviderState> {
        let mut providers = self.providers.lock().unwrap_or_else(|p| p.into_inner());
        providers
            .entry(provider.to_string())
            .or_insert_with(|| {
                let now = self.clock.now_millis();
                Arc::new(ProviderState {
                    minute: Mutex::new(UsageWindow::new(60, now)),
                    hour: Mutex::new(UsageWindow::new(3600, now)),
                    day: Mutex::new(UsageWindow::new(86_400, now)),
                    budget: TokenBudget::default(),
                    throttled_count: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Admission check for `estimated_tokens` against all three windows and
    /// the hourly+daily cost budgets.
    pub fn acquire(&self, provider: &str, estimated_tokens: u64) -> Admission {
        let now = self.clock.now_millis();
        let state = self.state(provider);

        let mut minute = state.minute.lock().unwrap_or_else(|p| p.into_inner());
        let mut hour = state.hour.lock().unwrap_or_else(|p| p.into_inner());
        let mut day = state.day.lock().unwrap_or_else(|p| p.into_inner());
        minute.reset_if_expired(now);
        hour.reset_if_expired(now);
        day.reset_if_expired(now);

        let minute_ok = minute.tokens_used + estimated_tokens <= state.budget.max_tokens_per_minute;
        let hour_ok = hour.tokens_used + estimated_tokens <= state.budget.max_tokens_per_hour;
        let day_ok = day.tokens_used + estimated_tokens <= state.budget.max_tokens_per_day;
        let hour_cost_ok = hour.cost_usd <= state.budget.max_cost_per_hour_usd;
        let day_cost_ok = day.cost_usd <= state.budget.max_cost_per_day_usd;

        if minute_ok && hour_ok && day_ok && hour_cost_ok && day_cost_ok {
            return Admission::AdmitNow;
        }

        state.throttled_count.fetch_add(1, Ordering::Relaxed);

        // Only the minute window being exhausted, with everything else
        // fine, is worth a short wait; any other failure mode rejects
        // immediately so the fallback cascade can run.
        if !minute_ok && hour_ok && day_ok && hour_cost_ok && day_cost_ok {
            let wait = minute.remaining_seconds(now);
            if wait <= MAX_LOCAL_WAIT.as_secs() {
                return Admission::WaitForMs(wait * 1000);
            }
        }

        Admission::Reject
    }

    /// Apply actual usage to all three windows after the call completes.
    pub fn record_usage(&self, provider: &str, actual_tokens: u64, actual_cost: f64) {
        let now = self.clock.now_millis();
        let state = self.state(provider);

        let mut minute = state.minute.lock().unwrap_or_else(|p| p.into_inner());
        let mut hour = state.hour.lock().unwrap_or_else(|p| p.into_inner());
        let mut day = state.day.lock().unwrap_or_else(|p| p.into_inner());
        minute.reset_if_expired(now);
        hour.reset_if_expired(now);
        day.reset_if_expired(now);

        minute.record(actual_tokens, actual_cost);
        hour.record(actual_tokens, actual_cost);
        day.record(actual_tokens, actual_cost);
    }

    pub fn metrics(&self, provider: &str) -> RateLimiterMetrics {
        let state = self.state(provider);
        let now = self.clock.now_millis();
        let mut minute = state.minute.lock().unwrap_or_else(|p| p.into_inner());
        let mut hour = state.hour.lock().unwrap_or_else(|p| p.into_inner());
        let mut day = state.day.lock().unwrap_or_else(|p| p.into_inner());
        minute.reset_if_expired(now);
        hour.reset_if_expired(now);
        day.reset_if_expired(now);

        RateLimiterMetrics {
            minute_tokens_used: minute.tokens_used,
            hour_tokens_used: hour.tokens_used,
            day_tokens_used: day.tokens_used,
            hour_cost_usd: hour.cost_usd,
            day_cost_usd: day.cost_usd,
            throttled_count: state.throttled_count.load(Ordering::Relaxed),
        }
    }
}
