//! Shared fixtures for the integration suite. Mirrors `broker.rs`'s own
//! `#[cfg(test)]` helpers, but built only from `waystation`'s public API
//! since these binaries compile against the crate as an external consumer.

use std::collections::HashMap;
use std::sync::Arc;

use waystation::test_support::ScriptedTransport;
use waystation::{
    Broker, BrokerBuilder, BrokerConfig, DialectConfig, FallbackConfig, FeatureFlags, HealthConfig,
    HttpResponse, InstantSleeper, NullSink, ProviderClient, ProviderConfig, ProviderProfile,
    StaticKeySource, TokenBudgetConfig, TransportError,
};

pub fn provider_config() -> ProviderConfig {
    ProviderConfig {
        base_url: "https://api.deepseek.com".into(),
        default_model: "deepseek-chat".into(),
        dialect: Some(DialectConfig::OpenaiCompatible),
        timeout_seconds: 60,
        max_retries: 1,
        retry_delay_seconds: 0,
        rate_limit_rpm: None,
        token_budget: TokenBudgetConfig::default(),
    }
}

pub fn config_with_one_provider() -> BrokerConfig {
    let mut providers = HashMap::new();
    providers.insert("deepseek".to_string(), provider_config());
    BrokerConfig {
        providers,
        circuit_breakers: HashMap::new(),
        health: HealthConfig::default(),
        fallback: FallbackConfig::default(),
        features: FeatureFlags::default(),
    }
}

pub fn ok_body(content: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "choices": [{"message": {"content": content}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
    }))
    .unwrap()
}

/// Build a single-provider broker whose `deepseek` client replays `responses`
/// in order through a `ScriptedTransport`, with a single usable key `k0`.
pub async fn broker_with_scripted(
    responses: Vec<Result<HttpResponse, TransportError>>,
) -> Broker<NullSink> {
    broker_with_config_and_scripted(config_with_one_provider(), responses).await
}

pub async fn broker_with_config_and_scripted(
    config: BrokerConfig,
    responses: Vec<Result<HttpResponse, TransportError>>,
) -> Broker<NullSink> {
    let transport = Arc::new(ScriptedTransport::new(responses));
    let profile = ProviderProfile::openai_compatible("deepseek", "https://api.deepseek.com", "deepseek-chat");
    let client = Arc::new(ProviderClient::new(profile, transport).with_sleeper(InstantSleeper));
    let source = StaticKeySource::new().with_provider("deepseek", vec!["k0".into()]);
    BrokerBuilder::new(config).with_provider_client("deepseek", client).build(&source).await
}

/// Same as [`broker_with_scripted`] but wires two keys, `k0` and `k1`, so
/// key-rotation scenarios (S3) have a second credential to fall back onto.
pub async fn broker_with_two_keys(
    responses: Vec<Result<HttpResponse, TransportError>>,
) -> Broker<NullSink> {
    let transport = Arc::new(ScriptedTransport::new(responses));
    let profile = ProviderProfile::openai_compatible("deepseek", "https://api.deepseek.com", "deepseek-chat");
    let client = Arc::new(ProviderClient::new(profile, transport).with_sleeper(InstantSleeper));
    let source = StaticKeySource::new().with_provider("deepseek", vec!["k0".into(), "k1".into()]);
    BrokerBuilder::new(config_with_one_provider())
        .with_provider_client("deepseek", client)
        .build(&source)
        .await
}
