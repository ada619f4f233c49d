//! Fingerprinted response cache with build coalescing, static fallback
//! table, and degraded handlers.
//!
//! Grounded on `examples/original_source/backend/services/fallback_service.py`:
//! `ResponseCache` (LRU+TTL keyed by `sha256(agent_type:prompt)`),
//! `FallbackService._static_responses` (canonical canned replies), and the
//! cache/static/degraded/synthetic priority cascade in `get_fallback`.

use crate::error::CacheError;
use crate::clock::{Clock, MonotonicClock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Which tier produced a fallback response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    Cached,
    Static,
    Degraded,
    Synthetic,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    content: String,
    fallback_kind: FallbackKind,
    cached_at_millis: u64,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now_millis: u64) -> bool {
        now_millis.saturating_sub(self.cached_at_millis) >= self.ttl.as_millis() as u64
    }
}

/// Snapshot counters for the Stats aggregator.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub valid_entries: usize,
    pub utilization_percent: f64,
}

type BuildGate = Arc<AsyncMutex<Option<Result<String, String>>>>;

/// `sha256(provider:normalized_prompt)` truncated to a stable 32-hex-char
/// prefix, matching `ResponseCache._hash_prompt`'s truncation to 32 chars.
pub fn fingerprint(provider: &str, prompt: &str) -> String {
    let normalized = prompt.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b":");
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..32].to_string()
}

/// Degraded-mode handler: a substring pattern matched against the prompt (or
/// `task_type`), paired with a content generator.
pub struct DegradedHandler {
    pub pattern: String,
    pub responder: Box<dyn Fn(&str) -> String + Send + Sync>,
}

/// LRU+TTL response cache with per-fingerprint build coalescing, a static
/// canned-response table, and registered degraded handlers.
pub struct FallbackCache {
    clock: Arc<dyn Clock>,
    max_size: usize,
    default_ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    order: Mutex<Vec<String>>,
    in_flight: Mutex<HashMap<String, BuildGate>>,
    static_responses: HashMap<&'static str, &'static str>,
    degraded_handlers: Mutex<Vec<DegradedHandler>>,
}

impl FallbackCache {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            clock: Arc::new(MonotonicClock::default()),
            max_size,
            default_ttl,
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            static_responses: default_static_responses(),
            degraded_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn register_degraded_handler(&self, pattern: impl Into<String>, responder: impl Fn(&str) -> String + Send + Sync + 'static) {
        self.degraded_handlers.lock().unwrap_or_else(|p| p.into_inner()).push(DegradedHandler {
            pattern: pattern.into(),
            responder: Box::new(responder),
        });
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Returns a fresh, non-expired entry if present; removes it on access
    /// if expired.
    pub fn get(&self, provider: &str, prompt: &str) -> Option<(String, FallbackKind)> {
        let key = fingerprint(provider, prompt);
        let now = self.now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(&key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(&key);
                self.order.lock().unwrap_or_else(|p| p.into_inner()).retain(|k| k != &key);
                None
            }
            Some(entry) => Some((entry.content.clone(), entry.fallback_kind)),
            None => None,
        }
    }

    pub fn set(&self, provider: &str, prompt: &str, content: impl Into<String>, ttl: Option<Duration>) {
        let key = fingerprint(provider, prompt);
        let now = self.now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let mut order = self.order.lock().unwrap_or_else(|p| p.into_inner());

        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            if let Some(oldest) = order.first().cloned() {
                entries.remove(&oldest);
                order.remove(0);
            }
        }
        order.retain(|k| k != &key);
        order.push(key.clone());
        entries.insert(
            key,
            CacheEntry {
                content: content.into(),
                fallback_kind: FallbackKind::Cached,
                cached_at_millis: now,
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );
    }

    /// Build-coalesced fetch: the first caller for a given fingerprint runs
    /// `build`; every concurrent caller for the same fingerprint blocks on
    /// the same gate and receives the identical result, success or error.
    /// Exactly one upstream dispatch happens per fingerprint per burst (§8 #3).
    pub async fn get_or_build<F, Fut>(
        &self,
        provider: &str,
        prompt: &str,
        ttl: Option<Duration>,
        build: F,
    ) -> Result<String, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, String>>,
    {
        if let Some((content, _)) = self.get(provider, prompt) {
            return Ok(content);
        }

        let key = fingerprint(provider, prompt);
        let (gate, is_builder) = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            match in_flight.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let gate: BuildGate = Arc::new(AsyncMutex::new(None));
                    in_flight.insert(key.clone(), gate.clone());
                    (gate, true)
                }
            }
        };

        if is_builder {
            let mut slot = gate.lock().await;
            let result = build().await;
            *slot = Some(result.clone());
            drop(slot);
            self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).remove(&key);
            match result {
                Ok(content) => {
                    self.set(provider, prompt, content.clone(), ttl);
                    Ok(content)
                }
                Err(msg) => Err(CacheError::BuildFailed(msg)),
            }
        } else {
            let slot = gate.lock().await;
            match slot.clone() {
                Some(Ok(content)) => Ok(content),
                Some(Err(msg)) => Err(CacheError::BuildFailed(msg)),
                None => Err(CacheError::BuildFailed("coalesced build gate closed with no result".into())),
            }
        }
    }

    /// Static-table match. Gating mirrors `_match_static_key`: `health_check`
    /// fires on the `health` task type or prompt substring; `strategy:*`
    /// keys are DeepSeek-gated; `research:market_overview` is
    /// Perplexity-gated and requires an "overview"/"analysis" prompt;
    /// `risk:portfolio` is ungated beyond its own substrings.
    pub fn match_static(&self, provider: &str, prompt: &str, task_type: &str) -> Option<(String, FallbackKind)> {
        let prompt_lower = prompt.to_lowercase();
        let key = if task_type == "health_check" || prompt_lower.contains("health") {
            Some("health_check")
        } else if provider == "deepseek" && prompt_lower.contains("momentum") {
            Some("strategy:momentum")
        } else if provider == "deepseek" && prompt_lower.contains("mean reversion") {
            Some("strategy:mean_reversion")
        } else if provider == "perplexity" && (prompt_lower.contains("overview") || prompt_lower.contains("analysis")) {
            Some("research:market_overview")
        } else if prompt_lower.contains("risk") && prompt_lower.contains("portfolio") {
            Some("risk:portfolio")
        } else {
            None
        };
        key.and_then(|k| self.static_responses.get(k))
            .map(|text| (text.to_string(), FallbackKind::Static))
    }

    pub fn match_degraded(&self, prompt: &str, task_type: &str) -> Option<(String, FallbackKind)> {
        let handlers = self.degraded_handlers.lock().unwrap_or_else(|p| p.into_inner());
        handlers
            .iter()
            .find(|h| prompt.contains(&h.pattern) || task_type == h.pattern)
            .map(|h| ((h.responder)(prompt), FallbackKind::Degraded))
    }

    fn synthetic(&self) -> (String, FallbackKind) {
        ("Service temporarily unavailable. Please try again shortly.".to_string(), FallbackKind::Synthetic)
    }

    /// Priority cascade: fresh cache entry → static match → degraded handler
    /// → synthetic last-resort message. Always returns something.
    pub fn fallback(&self, provider: &str, prompt: &str, task_type: &str) -> (String, FallbackKind) {
        if let Some(hit) = self.get(provider, prompt) {
            return hit;
        }
        if let Some(hit) = self.match_static(provider, prompt, task_type) {
            return hit;
        }
        if let Some(hit) = self.match_degraded(prompt, task_type) {
            return hit;
        }
        self.synthetic()
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.now();
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let total = entries.len();
        let expired = entries.values().filter(|e| e.is_expired(now)).count();
        CacheStats {
            total_entries: total,
            expired_entries: expired,
            valid_entries: total - expired,
            utilization_percent: if self.max_size == 0 { 0.0 } else { (total as f64 / self.max_size as f64) * 100.0 },
        }
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.order.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

fn default_static_responses() -> HashMap<&'static str, &'static str> {
    let mut m = HashMap::new();
    m.insert(
        "strategy:momentum",
        "## Momentum Strategy\n\nMomentum strategies buy assets that have recently outperformed and sell those \
         that have underperformed, on the assumption that trends persist over the chosen horizon. This is a \
         fallback response served while the upstream analysis provider is unavailable.",
    );
    m.insert(
        "strategy:mean_reversion",
        "## Mean Reversion Strategy\n\nMean reversion strategies assume prices oscillate around a fair value and \
         trade against extreme deviations, expecting a return toward the mean. This is a fallback response served \
         while the upstream analysis provider is unavailable.",
    );
    m.insert(
        "research:market_overview",
        "## Market Overview\n\nA general market overview could not be generated live; broad conditions should be \
         confirmed from a live data source once the research provider recovers.",
    );
    m.insert("health_check", "OK - Fallback response (service degraded)");
    m.insert(
        "risk:portfolio",
        "## Portfolio Risk\n\nRisk assessment is temporarily unavailable. Apply conservative position sizing \
         until the upstream risk provider recovers.",
    );
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    struct ManualClock(AtomicU64);
    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }
    impl Clock for Arc<ManualClock> {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn fingerprint_is_stable_and_provider_scoped() {
        let a = fingerprint("deepseek", "  Ping  ");
        let b = fingerprint("deepseek", "ping");
        let c = fingerprint("perplexity", "ping");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn set_then_get_within_ttl_then_expires() {
        let clock = Arc::new(ManualClock(AtomicU64::new(0)));
        let cache = FallbackCache::new(10, Duration::from_secs(60)).with_clock(clock.clone());
        cache.set("deepseek", "ping", "pong", None);
        assert_eq!(cache.get("deepseek", "ping").unwrap().0, "pong");
        clock.0.store(61_000, Ordering::SeqCst);
        assert!(cache.get("deepseek", "ping").is_none());
    }

    #[test]
    fn static_match_gated_by_provider() {
        let cache = FallbackCache::new(10, Duration::from_secs(60));
        assert!(cache.match_static("deepseek", "give me a momentum strategy", "analyze").is_some());
        assert!(cache.match_static("perplexity", "give me a momentum strategy", "analyze").is_none());
    }

    #[test]
    fn risk_portfolio_is_ungated_by_provider() {
        let cache = FallbackCache::new(10, Duration::from_secs(60));
        let hit = cache.match_static("anything", "assess risk for my portfolio", "analyze");
        assert!(hit.is_some());
    }

    #[test]
    fn fallback_cascade_reaches_synthetic_when_nothing_matches() {
        let cache = FallbackCache::new(10, Duration::from_secs(60));
        let (content, kind) = cache.fallback("deepseek", "completely unrelated text", "analyze");
        assert_eq!(kind, FallbackKind::Synthetic);
        assert!(content.contains("temporarily unavailable"));
    }

    #[test]
    fn degraded_handler_matches_before_synthetic() {
        let cache = FallbackCache::new(10, Duration::from_secs(60));
        cache.register_degraded_handler("widget", |_| "degraded widget response".to_string());
        let (content, kind) = cache.fallback("deepseek", "tell me about the widget", "analyze");
        assert_eq!(kind, FallbackKind::Degraded);
        assert_eq!(content, "degraded widget response");
    }

    #[tokio::test]
    async fn build_coalescing_runs_upstream_exactly_once() {
        let cache = Arc::new(FallbackCache::new(10, Duration::from_secs(60)));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build("deepseek", "ping", None, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok("pong".to_string())
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == "pong"));
    }

    #[tokio::test]
    async fn build_coalescing_propagates_identical_error_to_all_waiters() {
        let cache = Arc::new(FallbackCache::new(10, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build("deepseek", "boom", None, || async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err("upstream exploded".to_string())
                    })
                    .await
            }));
        }
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(matches!(err, CacheError::BuildFailed(ref msg) if msg == "upstream exploded"));
        }
    }
}
