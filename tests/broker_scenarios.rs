//! End-to-end dispatch scenarios (spec.md §8 S1-S3, S6), driven only through
//! `Broker`'s public RPCs against a scripted transport.

mod common;

use std::collections::HashMap;
use waystation::{Channel, FallbackKind, Request};

#[tokio::test]
async fn s1_happy_path_returns_direct_api_success() {
    let broker = common::broker_with_scripted(vec![Ok(waystation::HttpResponse {
        status: 200,
        headers: HashMap::new(),
        body: common::ok_body("pong"),
    })])
    .await;

    let response = broker.send(Request::new("deepseek", "analyze", "ping", 10)).await;

    assert!(response.success);
    assert_eq!(response.content, "pong");
    assert_eq!(response.channel_used, Channel::DirectApi);
    assert_eq!(response.api_key_index, Some(0));
    assert!(response.token_usage.is_some());
}

#[tokio::test]
async fn s2_rate_limit_honors_retry_after_then_succeeds() {
    let mut throttled_headers = HashMap::new();
    throttled_headers.insert("Retry-After".to_string(), "0".to_string());

    let broker = common::broker_with_scripted(vec![
        Ok(waystation::HttpResponse { status: 429, headers: throttled_headers, body: vec![] }),
        Ok(waystation::HttpResponse { status: 200, headers: HashMap::new(), body: common::ok_body("retried-ok") }),
    ])
    .await;

    let response = broker.send(Request::new("deepseek", "analyze", "ping", 10)).await;

    assert!(response.success);
    assert_eq!(response.content, "retried-ok");
    assert_eq!(response.channel_used, Channel::DirectApi);
}

#[tokio::test]
async fn s2_rate_limit_exhausted_after_retries_falls_back() {
    let mut throttled_headers = HashMap::new();
    throttled_headers.insert("Retry-After".to_string(), "0".to_string());

    // ProviderProfile::openai_compatible defaults to 3 retries; script more
    // 429s than that so every attempt is rejected upstream.
    let responses = (0..6)
        .map(|_| Ok(waystation::HttpResponse { status: 429, headers: throttled_headers.clone(), body: vec![] }))
        .collect();

    let broker = common::broker_with_scripted(responses).await;
    let response = broker.send(Request::new("deepseek", "analyze", "ping", 10)).await;

    assert!(!response.success || response.fallback_type.is_some());
    assert_eq!(response.channel_used, Channel::Fallback);
}

#[tokio::test]
async fn s3_auth_error_disables_key_and_retries_with_next_key() {
    let broker = common::broker_with_two_keys(vec![
        Ok(waystation::HttpResponse { status: 401, headers: HashMap::new(), body: vec![] }),
        Ok(waystation::HttpResponse { status: 200, headers: HashMap::new(), body: common::ok_body("second-key-ok") }),
    ])
    .await;

    let response = broker.send(Request::new("deepseek", "analyze", "ping", 10)).await;

    assert!(response.success);
    assert_eq!(response.content, "second-key-ok");
    assert_eq!(response.channel_used, Channel::DirectApi);
}

#[tokio::test]
async fn s6_every_key_disabled_falls_back_to_synthetic() {
    let broker = common::broker_with_scripted(vec![Ok(waystation::HttpResponse {
        status: 401,
        headers: HashMap::new(),
        body: vec![],
    })])
    .await;

    let response = broker.send(Request::new("deepseek", "analyze", "ping", 10)).await;

    assert!(!response.success);
    assert_eq!(response.channel_used, Channel::Fallback);
    assert_eq!(response.fallback_type, Some(FallbackKind::Synthetic));
    assert_eq!(broker.reset_key_cooldown("deepseek", None), 0, "auth-disabled keys stay terminal");
}

#[tokio::test]
async fn unknown_provider_is_rejected_without_fallback() {
    let broker = common::broker_with_scripted(vec![]).await;
    let response = broker.send(Request::new("nope", "analyze", "ping", 10)).await;
    assert!(!response.success);
    assert_eq!(response.channel_used, Channel::DirectApi, "validation errors never enter the fallback cascade");
}

#[tokio::test]
async fn cache_short_circuits_a_repeated_request() {
    let broker = common::broker_with_scripted(vec![Ok(waystation::HttpResponse {
        status: 200,
        headers: HashMap::new(),
        body: common::ok_body("pong"),
    })])
    .await;

    let first = broker.send(Request::new("deepseek", "analyze", "ping", 10)).await;
    assert_eq!(first.channel_used, Channel::DirectApi);

    let second = broker.send(Request::new("deepseek", "analyze", "ping", 10)).await;
    assert_eq!(second.channel_used, Channel::Cache);
    assert_eq!(second.content, "pong");
}

#[tokio::test]
async fn stats_and_service_health_roll_up_through_the_public_api() {
    let broker = common::broker_with_scripted(vec![Ok(waystation::HttpResponse {
        status: 200,
        headers: HashMap::new(),
        body: common::ok_body("pong"),
    })])
    .await;

    broker.send(Request::new("deepseek", "analyze", "ping", 10)).await;
    let snapshot = broker.stats();
    assert_eq!(snapshot.per_provider["deepseek"].requests, 1);
    assert_eq!(snapshot.per_provider["deepseek"].successes, 1);

    broker.register_service_health_update("deepseek", waystation::ServiceHealth::Degraded, None, None, None);
    assert_eq!(broker.service_registry().overall_health(), waystation::ServiceHealth::Degraded);
}

