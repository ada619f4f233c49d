//! Build-coalescing and fallback cascade priority (spec.md §8 S5: concurrent
//! identical requests against a slow upstream dispatch exactly once),
//! driven through `FallbackCache`'s public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use waystation::{fingerprint, FallbackCache, FallbackKind};

#[tokio::test]
async fn s5_ten_concurrent_identical_requests_build_exactly_once() {
    let cache = Arc::new(FallbackCache::new(100, Duration::from_secs(60)));
    let build_count = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let cache = cache.clone();
        let build_count = build_count.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_build("deepseek", "summarize this filing", None, || {
                    let build_count = build_count.clone();
                    async move {
                        build_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<String, String>("built-once".to_string())
                    }
                })
                .await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(build_count.load(Ordering::SeqCst), 1, "exactly one upstream dispatch per fingerprint per burst");
    assert!(results.iter().all(|r| r == "built-once"), "every caller sees the identical coalesced result");
}

#[tokio::test]
async fn a_subsequent_request_within_ttl_is_served_from_cache_without_rebuilding() {
    let cache = FallbackCache::new(100, Duration::from_secs(60));
    let build_count = Arc::new(AtomicUsize::new(0));

    let build = |count: Arc<AtomicUsize>| {
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok::<String, String>("fresh".to_string())
        }
    };

    let first = cache.get_or_build("deepseek", "ping", None, || build(build_count.clone())).await.unwrap();
    assert_eq!(first, "fresh");

    let second = cache.get_or_build("deepseek", "ping", None, || build(build_count.clone())).await.unwrap();
    assert_eq!(second, "fresh");
    assert_eq!(build_count.load(Ordering::SeqCst), 1, "the cache hit must not invoke build again");
}

#[tokio::test]
async fn a_failed_coalesced_build_propagates_the_same_error_to_every_waiter() {
    let cache = Arc::new(FallbackCache::new(100, Duration::from_secs(60)));
    let mut handles = Vec::new();
    for _ in 0..5 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_build("deepseek", "will fail", None, || async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err::<String, String>("upstream down".to_string())
                })
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }
    // A failed build leaves no cache entry behind.
    assert!(cache.get("deepseek", "will fail").is_none());
}

#[test]
fn fingerprint_ignores_surrounding_whitespace_and_case() {
    let a = fingerprint("deepseek", "Summarize This");
    let b = fingerprint("deepseek", "  summarize this  ");
    assert_eq!(a, b);
}

#[test]
fn static_fallback_cascade_prefers_cache_then_static_then_degraded_then_synthetic() {
    let cache = FallbackCache::new(100, Duration::from_secs(60));
    cache.register_degraded_handler("portfolio", |_| "degraded portfolio summary".to_string());

    // No cache entry, no static match, no degraded match: synthetic.
    let (_, kind) = cache.fallback("unknown-provider", "tell me a joke", "chat");
    assert_eq!(kind, FallbackKind::Synthetic);

    // A degraded handler matches before falling through to synthetic.
    let (content, kind) = cache.fallback("unknown-provider", "what about my portfolio today", "chat");
    assert_eq!(kind, FallbackKind::Degraded);
    assert_eq!(content, "degraded portfolio summary");

    // A static rule (risk:portfolio) outranks the degraded handler when both
    // could match.
    let (_, kind) = cache.fallback("unknown-provider", "assess risk in my portfolio", "chat");
    assert_eq!(kind, FallbackKind::Static);

    // A fresh cache entry outranks everything else.
    cache.set("deepseek", "ping", "cached-answer", None);
    let (content, kind) = cache.fallback("deepseek", "ping", "chat");
    assert_eq!(kind, FallbackKind::Cached);
    assert_eq!(content, "cached-answer");
}
