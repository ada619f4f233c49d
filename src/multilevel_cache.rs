//! Optional L1 in-process + L2 remote cache layer wrapping [`crate::cache`].
//!
//! Grounded on `examples/original_source/backend/services/multi_level_cache.py`:
//! `L1MemoryCache` (asyncio-lock LRU with access counting) and `L2RedisCache`
//! (lazy connection, returns `None` on any failure rather than raising — the
//! "L2 silently degrades, never blocks" rule this module preserves).

use crate::clock::{Clock, MonotonicClock};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An optional remote key-value layer. Implementations must never block the
/// caller indefinitely and should treat any connectivity failure as a miss,
/// not an error — `MultiLevelCache` has no error path for L2.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl: Duration);
}

#[derive(Debug, Clone)]
struct L1Entry {
    value: String,
    created_at_millis: u64,
    last_accessed_millis: u64,
    access_count: u64,
    ttl: Duration,
}

impl L1Entry {
    fn is_expired(&self, now_millis: u64) -> bool {
        now_millis.saturating_sub(self.created_at_millis) >= self.ttl.as_millis() as u64
    }
}

const LATENCY_WINDOW: usize = 100;

#[derive(Default)]
struct LatencyWindow {
    samples: VecDeque<f64>,
}

impl LatencyWindow {
    fn record(&mut self, millis: f64) {
        if self.samples.len() >= LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(millis);
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// Snapshot for the Stats aggregator.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiLevelCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub avg_hit_latency_ms: f64,
    pub avg_miss_latency_ms: f64,
}

struct Inner {
    l1: HashMap<String, L1Entry>,
    order: Vec<String>,
    l2_access_counts: HashMap<String, u64>,
    hits: u64,
    misses: u64,
    l1_hits: u64,
    l2_hits: u64,
    evictions: u64,
    promotions: u64,
    hit_latency: LatencyWindow,
    miss_latency: LatencyWindow,
}

/// L1 in-process LRU, optionally backed by an L2 remote KV that is consulted
/// on an L1 miss and promoted into L1 after `promote_after` accesses.
pub struct MultiLevelCache {
    clock: Arc<dyn Clock>,
    capacity: usize,
    default_ttl: Duration,
    promote_after: u64,
    l2: Option<Arc<dyn RemoteCache>>,
    inner: Mutex<Inner>,
}

impl MultiLevelCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            clock: Arc::new(MonotonicClock::default()),
            capacity,
            default_ttl,
            promote_after: 3,
            l2: None,
            inner: Mutex::new(Inner {
                l1: HashMap::new(),
                order: Vec::new(),
                l2_access_counts: HashMap::new(),
                hits: 0,
                misses: 0,
                l1_hits: 0,
                l2_hits: 0,
                evictions: 0,
                promotions: 0,
                hit_latency: LatencyWindow::default(),
                miss_latency: LatencyWindow::default(),
            }),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_l2(mut self, l2: Arc<dyn RemoteCache>) -> Self {
        self.l2 = Some(l2);
        self
    }

    pub fn with_promote_after(mut self, n: u64) -> Self {
        self.promote_after = n;
        self
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn l1_touch(inner: &mut Inner, key: &str, now: u64) {
        if let Some(entry) = inner.l1.get_mut(key) {
            entry.last_accessed_millis = now;
            entry.access_count += 1;
        }
        inner.order.retain(|k| k != key);
        inner.order.push(key.to_string());
    }

    fn l1_insert(&self, inner: &mut Inner, key: &str, value: &str, now: u64, ttl: Duration) {
        if !inner.l1.contains_key(key) && inner.l1.len() >= self.capacity {
            if let Some(oldest) = inner.order.first().cloned() {
                inner.l1.remove(&oldest);
                inner.order.remove(0);
                inner.evictions += 1;
            }
        }
        inner.order.retain(|k| k != key);
        inner.order.push(key.to_string());
        inner.l1.insert(
            key.to_string(),
            L1Entry { value: value.to_string(), created_at_millis: now, last_accessed_millis: now, access_count: 0, ttl },
        );
    }

    /// Read path: L1 first; on an L1 miss, consult L2 (if configured and
    /// reachable); after `promote_after` L2 hits for a key it is written
    /// back into L1. A dead L2 is treated exactly like an L2 miss.
    pub async fn get(&self, key: &str) -> Option<String> {
        let started = self.now();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let now = self.now();
            if let Some(entry) = inner.l1.get(key).cloned() {
                if entry.is_expired(now) {
                    inner.l1.remove(key);
                    inner.order.retain(|k| k != key);
                } else {
                    Self::l1_touch(&mut inner, key, now);
                    inner.hits += 1;
                    inner.l1_hits += 1;
                    let elapsed = (self.now().saturating_sub(started)) as f64;
                    inner.hit_latency.record(elapsed);
                    return Some(entry.value);
                }
            }
        }

        if let Some(l2) = &self.l2 {
            if let Some(value) = l2.get(key).await {
                let now = self.now();
                let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
                inner.hits += 1;
                inner.l2_hits += 1;
                let count = inner.l2_access_counts.entry(key.to_string()).or_insert(0);
                *count += 1;
                if *count >= self.promote_after {
                    self.l1_insert(&mut inner, key, &value, now, self.default_ttl);
                    inner.promotions += 1;
                    inner.l2_access_counts.remove(key);
                }
                let elapsed = (self.now().saturating_sub(started)) as f64;
                inner.hit_latency.record(elapsed);
                return Some(value);
            }
        }

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.misses += 1;
        let elapsed = (self.now().saturating_sub(started)) as f64;
        inner.miss_latency.record(elapsed);
        None
    }

    /// Writes always go to L1. Writing through to L2 is an explicit opt-in
    /// per call (`write_l2 = true`), not an automatic dual write.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>, write_l2: bool) {
        let now = self.now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            self.l1_insert(&mut inner, key, value, now, ttl);
        }
        if write_l2 {
            if let Some(l2) = &self.l2 {
                l2.set(key, value, ttl).await;
            }
        }
    }

    pub fn stats(&self) -> MultiLevelCacheStats {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        MultiLevelCacheStats {
            hits: inner.hits,
            misses: inner.misses,
            l1_hits: inner.l1_hits,
            l2_hits: inner.l2_hits,
            evictions: inner.evictions,
            promotions: inner.promotions,
            avg_hit_latency_ms: inner.hit_latency.average(),
            avg_miss_latency_ms: inner.miss_latency.average(),
        }
    }
}
