//! Per-provider credential pools: health tracking, cooldown, weighted selection.
//!
//! Grounded on the resilience posture of the teacher crate's circuit breaker
//! (lock-protected mutable state behind atomics-friendly small structs) but
//! driven by a different FSM: a key's health is KeyPool-owned, not a generic
//! breaker's.

use crate::clock::{Clock, MonotonicClock};
use crate::error::KeyPoolError;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Health state of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHealth {
    Healthy,
    Degraded,
    Cooling,
    Disabled,
}

/// Source of decrypted per-provider credentials. The broker never reads
/// environment variables or files directly; a `KeySource` hands it secrets
/// already in hand.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn keys_for(&self, provider: &str) -> Vec<SecretString>;
}

/// A `KeySource` backed by an in-memory map, useful for tests and for
/// configuration-driven deployments that decrypt secrets at startup.
#[derive(Default)]
pub struct StaticKeySource {
    keys: HashMap<String, Vec<SecretString>>,
}

impl StaticKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: impl Into<String>, secrets: Vec<String>) -> Self {
        self.keys.insert(
            provider.into(),
            secrets.into_iter().map(SecretString::from).collect(),
        );
        self
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn keys_for(&self, provider: &str) -> Vec<SecretString> {
        self.keys.get(provider).cloned().unwrap_or_default()
    }
}

/// One credential of one provider. Mutated only through `KeyPool` operations.
pub struct ApiKey {
    provider: String,
    index: usize,
    secret: SecretString,
    health: Mutex<KeyHealth>,
    success_count: AtomicUsize,
    error_count: AtomicUsize,
    rate_limit_count: AtomicUsize,
    consecutive_errors: AtomicUsize,
    last_used_millis: AtomicU64,
    cooling_until_millis: AtomicU64,
    last_error_millis: AtomicU64,
    weight: Mutex<f64>,
}

impl ApiKey {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn health(&self) -> KeyHealth {
        *self.health.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn success_count(&self) -> usize {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn rate_limit_count(&self) -> usize {
        self.rate_limit_count.load(Ordering::Relaxed)
    }

    pub fn cooling_until_millis(&self) -> Option<u64> {
        match self.cooling_until_millis.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }

    fn is_usable(&self, now_millis: u64) -> bool {
        let health = self.health();
        if health == KeyHealth::Disabled {
            return false;
        }
        match self.cooling_until_millis() {
            Some(until) if until > now_millis => false,
            _ => true,
        }
    }

    fn effective_weight(&self, now_millis: u64) -> f64 {
        let successes = self.success_count() as f64;
        let errors = self.error_count() as f64;
        let success_ratio = successes / (successes + errors + 1e-6);
        let alpha = 1.5;
        let base_weight = *self.weight.lock().unwrap_or_else(|p| p.into_inner());
        let last_used = self.last_used_millis.load(Ordering::Relaxed);
        let idle_millis = now_millis.saturating_sub(last_used) as f64;
        // Gently favor least-recently-used keys among equally healthy ones:
        // bonus saturates so a key idle for minutes isn't infinitely preferred.
        let age_bonus = 1.0 + (idle_millis / 60_000.0).min(1.0) * 0.1;
        base_weight * success_ratio.powf(alpha) * age_bonus
    }
}

/// Ordered sequence of credentials for one provider.
pub struct KeyPool {
    clock: Arc<dyn Clock>,
    keys: HashMap<String, Vec<Arc<ApiKey>>>,
    round_robin: Mutex<HashMap<String, usize>>,
    consecutive_error_limit: usize,
    disable_error_limit: usize,
    base_cooldown: Duration,
    max_cooldown: Duration,
    min_cooldown: Duration,
}

pub struct KeyPoolBuilder {
    consecutive_error_limit: usize,
    disable_error_limit: usize,
    base_cooldown: Duration,
    max_cooldown: Duration,
    min_cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for KeyPoolBuilder {
    fn default() -> Self {
        Self {
            consecutive_error_limit: 3,
            disable_error_limit: 10,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(30 * 60),
            min_cooldown: Duration::from_secs(30),
            clock: Arc::new(MonotonicClock::default()),
        }
    }
}

impl KeyPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive_error_limit(mut self, n: usize) -> Self {
        self.consecutive_error_limit = n;
        self
    }

    pub fn disable_error_limit(mut self, n: usize) -> Self {
        self.disable_error_limit = n;
        self
    }

    pub fn min_cooldown(mut self, d: Duration) -> Self {
        self.min_cooldown = d;
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub async fn build(self, source: &dyn KeySource, providers: &[&str]) -> KeyPool {
        let mut keys = HashMap::new();
        for provider in providers {
            let secrets = source.keys_for(provider).await;
            let entries = secrets
                .into_iter()
                .enumerate()
                .map(|(index, secret)| {
                    Arc::new(ApiKey {
                        provider: provider.to_string(),
                        index,
                        secret,
                        health: Mutex::new(KeyHealth::Healthy),
                        success_count: AtomicUsize::new(0),
                        error_count: AtomicUsize::new(0),
                        rate_limit_count: AtomicUsize::new(0),
                        consecutive_errors: AtomicUsize::new(0),
                        last_used_millis: AtomicU64::new(0),
                        cooling_until_millis: AtomicU64::new(0),
                        last_error_millis: AtomicU64::new(0),
                        weight: Mutex::new(1.0),
                    })
                })
                .collect::<Vec<_>>();
            keys.insert(provider.to_string(), entries);
        }

        KeyPool {
            clock: self.clock,
            keys,
            round_robin: Mutex::new(HashMap::new()),
            consecutive_error_limit: self.consecutive_error_limit,
            disable_error_limit: self.disable_error_limit,
            base_cooldown: self.base_cooldown,
            max_cooldown: self.max_cooldown,
            min_cooldown: self.min_cooldown,
        }
    }
}

impl KeyPool {
    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn keys_for(&self, provider: &str) -> Result<&[Arc<ApiKey>], KeyPoolError> {
        self.keys
            .get(provider)
            .map(|v| v.as_slice())
            .ok_or_else(|| KeyPoolError::UnknownProvider(provider.to_string()))
    }

    /// Returns the best usable key for `provider`, breaking ties between
    /// equally-weighted keys round-robin so two consecutive calls never
    /// reuse the same key while an alternative is healthy.
    pub fn acquire(&self, provider: &str) -> Result<Arc<ApiKey>, KeyPoolError> {
        let now = self.now();
        let candidates = self.keys_for(provider)?;
        let mut usable: Vec<&Arc<ApiKey>> = candidates.iter().filter(|k| k.is_usable(now)).collect();
        if usable.is_empty() {
            return Err(KeyPoolError::NoKeyAvailable(provider.to_string()));
        }

        usable.sort_by(|a, b| {
            let wa = a.effective_weight(now);
            let wb = b.effective_weight(now);
            wb.partial_cmp(&wa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.error_count().cmp(&b.error_count()))
                .then_with(|| {
                    a.last_used_millis
                        .load(Ordering::Relaxed)
                        .cmp(&b.last_used_millis.load(Ordering::Relaxed))
                })
        });

        let top_weight = usable[0].effective_weight(now);
        let top_tier: Vec<&Arc<ApiKey>> = usable
            .iter()
            .take_while(|k| (k.effective_weight(now) - top_weight).abs() < 1e-9)
            .copied()
            .collect();

        let chosen = if top_tier.len() > 1 {
            let mut rr = self.round_robin.lock().unwrap_or_else(|p| p.into_inner());
            let counter = rr.entry(provider.to_string()).or_insert(0);
            let pick = top_tier[*counter % top_tier.len()].clone();
            *counter = counter.wrapping_add(1);
            pick
        } else {
            usable[0].clone()
        };

        chosen.last_used_millis.store(now, Ordering::Relaxed);
        Ok(chosen)
    }

    pub fn mark_success(&self, key: &ApiKey) {
        key.success_count.fetch_add(1, Ordering::Relaxed);
        key.consecutive_errors.store(0, Ordering::Relaxed);
        let mut health = key.health.lock().unwrap_or_else(|p| p.into_inner());
        if *health != KeyHealth::Disabled {
            *health = KeyHealth::Healthy;
        }
        drop(health);
        key.cooling_until_millis.store(0, Ordering::Relaxed);
    }

    pub fn mark_error(&self, key: &ApiKey) {
        key.error_count.fetch_add(1, Ordering::Relaxed);
        let consecutive = key.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        key.last_error_millis.store(self.now(), Ordering::Relaxed);

        let mut health = key.health.lock().unwrap_or_else(|p| p.into_inner());
        if *health == KeyHealth::Disabled {
            return;
        }
        if consecutive >= self.disable_error_limit {
            *health = KeyHealth::Disabled;
            tracing::error!(provider = %key.provider, index = key.index, "key disabled after repeated errors");
            return;
        }
        if consecutive >= self.consecutive_error_limit {
            *health = KeyHealth::Cooling;
            let overflow = consecutive - self.consecutive_error_limit;
            let factor = 2u32.saturating_pow(overflow as u32);
            let cooldown = self
                .base_cooldown
                .checked_mul(factor)
                .unwrap_or(self.max_cooldown)
                .min(self.max_cooldown);
            key.cooling_until_millis
                .store(self.now() + cooldown.as_millis() as u64, Ordering::Relaxed);
            tracing::warn!(provider = %key.provider, index = key.index, ?cooldown, "key cooling");
        } else {
            *health = KeyHealth::Degraded;
        }
    }

    /// Transient network failures take a separate counter path so they never
    /// cross into the auth-disable branch.
    pub fn mark_network_error(&self, key: &ApiKey) {
        self.mark_error(key);
    }

    pub fn mark_auth_error(&self, key: &ApiKey) {
        let mut health = key.health.lock().unwrap_or_else(|p| p.into_inner());
        *health = KeyHealth::Disabled;
        drop(health);
        key.error_count.fetch_add(1, Ordering::Relaxed);
        tracing::error!(provider = %key.provider, index = key.index, "key disabled: authentication error");
    }

    pub fn mark_rate_limit(&self, key: &ApiKey, retry_after: Option<Duration>) {
        key.rate_limit_count.fetch_add(1, Ordering::Relaxed);
        let cooldown = retry_after.unwrap_or(Duration::ZERO).max(self.min_cooldown);
        key.cooling_until_millis
            .store(self.now() + cooldown.as_millis() as u64, Ordering::Relaxed);
        let mut health = key.health.lock().unwrap_or_else(|p| p.into_inner());
        if *health != KeyHealth::Disabled {
            *health = KeyHealth::Cooling;
        }
    }

    pub fn reset_cooldown(&self, provider: &str, index: Option<usize>) -> usize {
        let now = self.now();
        let mut reset = 0;
        if let Some(keys) = self.keys.get(provider) {
            for key in keys {
                if let Some(i) = index {
                    if key.index != i {
                        continue;
                    }
                }
                if key.health() == KeyHealth::Disabled {
                    continue;
                }
                key.cooling_until_millis.store(0, Ordering::Relaxed);
                key.consecutive_errors.store(0, Ordering::Relaxed);
                let mut health = key.health.lock().unwrap_or_else(|p| p.into_inner());
                *health = KeyHealth::Healthy;
                drop(health);
                reset += 1;
            }
        }
        let _ = now;
        reset
    }

    pub fn count_active(&self, provider: &str) -> usize {
        let now = self.now();
        self.keys
            .get(provider)
            .map(|v| v.iter().filter(|k| k.is_usable(now)).count())
            .unwrap_or(0)
    }

    pub fn iter_all(&self, provider: &str) -> impl Iterator<Item = &Arc<ApiKey>> {
        self.keys
            .get(provider)
            .into_iter()
            .flat_map(|v| v.iter())
    }

    /// Fraction (0.0-1.0) of a provider's pool currently COOLING. Used by
    /// `maybe_adapt_breakers` to raise alert state when key rotation is
    /// under sustained pressure.
    pub fn cooling_fraction(&self, provider: &str) -> f64 {
        let keys = match self.keys.get(provider) {
            Some(k) if !k.is_empty() => k,
            _ => return 0.0,
        };
        let cooling = keys.iter().filter(|k| k.health() == KeyHealth::Cooling).count();
        cooling as f64 / keys.len() as f64
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    #[derive(Debug)]
    struct ManualClock(StdAtomicU64);
    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    async fn pool_with(n: usize) -> KeyPool {
        let source = StaticKeySource::new()
            .with_provider("deepseek", (0..n).map(|i| format!("key-{i}")).collect());
        KeyPoolBuilder::new().build(&source, &["deepseek"]).await
    }

    #[tokio::test]
    async fn acquire_fails_for_unknown_provider() {
        let pool = pool_with(1).await;
        assert!(matches!(
            pool.acquire("nope"),
            Err(KeyPoolError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn mark_success_keeps_key_healthy() {
        let pool = pool_with(1).await;
        let key = pool.acquire("deepseek").unwrap();
        pool.mark_success(&key);
        assert_eq!(key.health(), KeyHealth::Healthy);
        assert_eq!(key.success_count(), 1);
    }

    #[tokio::test]
    async fn consecutive_errors_cool_then_disable() {
        let pool = KeyPoolBuilder::new()
            .consecutive_error_limit(2)
            .disable_error_limit(4)
            .build(
                &StaticKeySource::new().with_provider("deepseek", vec!["k0".into()]),
                &["deepseek"],
            )
            .await;
        let key = pool.acquire("deepseek").unwrap();

        pool.mark_error(&key);
        assert_eq!(key.health(), KeyHealth::Degraded);

        pool.mark_error(&key);
        assert_eq!(key.health(), KeyHealth::Cooling);

        pool.mark_error(&key);
        pool.mark_error(&key);
        assert_eq!(key.health(), KeyHealth::Disabled);

        // disabled keys never come back automatically
        pool.mark_success(&key);
        assert_eq!(key.health(), KeyHealth::Disabled);
    }

    #[tokio::test]
    async fn auth_error_disables_regardless_of_prior_state() {
        let pool = pool_with(1).await;
        let key = pool.acquire("deepseek").unwrap();
        pool.mark_success(&key);
        pool.mark_auth_error(&key);
        assert_eq!(key.health(), KeyHealth::Disabled);
        pool.mark_success(&key);
        assert_eq!(key.health(), KeyHealth::Disabled);
    }

    #[tokio::test]
    async fn rate_limit_cools_with_retry_after() {
        let pool = pool_with(1).await;
        let key = pool.acquire("deepseek").unwrap();
        pool.mark_rate_limit(&key, Some(Duration::from_secs(2)));
        assert_eq!(key.health(), KeyHealth::Cooling);
        assert!(pool.acquire("deepseek").is_err());
    }

    #[tokio::test]
    async fn all_keys_cooling_yields_no_key_available() {
        let pool = pool_with(2).await;
        for _ in 0..2 {
            let key = pool.acquire("deepseek").unwrap();
            pool.mark_rate_limit(&key, Some(Duration::from_secs(60)));
        }
        assert!(matches!(
            pool.acquire("deepseek"),
            Err(KeyPoolError::NoKeyAvailable(_))
        ));
    }

    #[tokio::test]
    async fn reset_cooldown_restores_usability() {
        let pool = pool_with(1).await;
        let key = pool.acquire("deepseek").unwrap();
        pool.mark_rate_limit(&key, Some(Duration::from_secs(60)));
        assert!(pool.acquire("deepseek").is_err());
        let reset = pool.reset_cooldown("deepseek", None);
        assert_eq!(reset, 1);
        assert!(pool.acquire("deepseek").is_ok());
    }

    #[tokio::test]
    async fn round_robins_among_equally_healthy_keys() {
        let pool = pool_with(2).await;
        let first = pool.acquire("deepseek").unwrap();
        let second = pool.acquire("deepseek").unwrap();
        assert_ne!(first.index(), second.index());
    }
}
