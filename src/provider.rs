//! Provider-agnostic HTTP client: payload shaping, retry, SSE streaming.
//!
//! Grounded on `examples/original_source/backend/agents/llm/base_client.py`'s
//! `OpenAICompatibleClient`/`LLMClientPool`. A single generic client type is
//! parametrized by a [`ProviderProfile`] rather than one struct per
//! provider, and retry/backoff reuse the teacher's `backoff.rs`/`jitter.rs`.

use crate::backoff::Backoff;
use crate::error::ProviderError;
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::transport::{HttpRequest, Transport};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which wire dialect a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireDialect {
    OpenAiCompatible,
    Ollama,
}

/// Static shape of one provider family: base URL, default model, dialect,
/// and any provider-specific payload extensions (Qwen's `enable_thinking`,
/// for instance).
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub name: String,
    pub base_url: String,
    pub default_model: String,
    pub dialect: WireDialect,
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub extensions: Value,
}

impl ProviderProfile {
    pub fn openai_compatible(name: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            default_model: model.into(),
            dialect: WireDialect::OpenAiCompatible,
            timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            extensions: json!({}),
        }
    }

    pub fn ollama(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: "ollama".into(),
            base_url: base_url.into(),
            default_model: model.into(),
            dialect: WireDialect::Ollama,
            timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            extensions: json!({}),
        }
    }

    pub fn with_extensions(mut self, extensions: Value) -> Self {
        self.extensions = extensions;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ProviderCallResult {
    pub content: String,
    pub reasoning_content: Option<String>,
    pub model: String,
    pub token_usage: TokenUsage,
    pub finish_reason: Option<String>,
    pub latency_ms: u64,
}

/// One chat-completion call, common to both dialects.
#[derive(Debug, Clone)]
pub struct ChatCall {
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
}

fn build_payload(profile: &ProviderProfile, call: &ChatCall) -> Value {
    match profile.dialect {
        WireDialect::OpenAiCompatible => {
            let mut body = json!({
                "model": profile.default_model,
                "messages": call.messages,
                "temperature": call.temperature,
                "max_tokens": call.max_tokens,
            });
            if let (Some(obj), Some(ext)) = (body.as_object_mut(), profile.extensions.as_object()) {
                for (k, v) in ext {
                    obj.insert(k.clone(), v.clone());
                }
            }
            body
        }
        WireDialect::Ollama => json!({
            "model": profile.default_model,
            "messages": call.messages,
            "stream": false,
            "options": {
                "temperature": call.temperature,
                "num_predict": call.max_tokens,
            }
        }),
    }
}

fn parse_response(profile: &ProviderProfile, body: &[u8]) -> Result<ProviderCallResult, ProviderError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ProviderError::Decode(e.to_string()))?;

    match profile.dialect {
        WireDialect::OpenAiCompatible => {
            let choice = value
                .get("choices")
                .and_then(|c| c.get(0))
                .ok_or_else(|| ProviderError::Decode("missing choices[0]".into()))?;
            let message = choice
                .get("message")
                .ok_or_else(|| ProviderError::Decode("missing choices[0].message".into()))?;
            let content = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let reasoning_content = message
                .get("reasoning_content")
                .and_then(Value::as_str)
                .map(str::to_string);
            let finish_reason = choice.get("finish_reason").and_then(Value::as_str).map(str::to_string);
            let usage = value.get("usage");
            let token_usage = TokenUsage {
                prompt_tokens: usage.and_then(|u| u.get("prompt_tokens")).and_then(Value::as_u64).unwrap_or(0),
                completion_tokens: usage.and_then(|u| u.get("completion_tokens")).and_then(Value::as_u64).unwrap_or(0),
                total_tokens: usage.and_then(|u| u.get("total_tokens")).and_then(Value::as_u64).unwrap_or(0),
            };
            let model = value.get("model").and_then(Value::as_str).unwrap_or(&profile.default_model).to_string();
            Ok(ProviderCallResult { content, reasoning_content, model, token_usage, finish_reason, latency_ms: 0 })
        }
        WireDialect::Ollama => {
            let content = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let token_usage = TokenUsage {
                prompt_tokens: value.get("prompt_eval_count").and_then(Value::as_u64).unwrap_or(0),
                completion_tokens: value.get("eval_count").and_then(Value::as_u64).unwrap_or(0),
                total_tokens: value.get("prompt_eval_count").and_then(Value::as_u64).unwrap_or(0)
                    + value.get("eval_count").and_then(Value::as_u64).unwrap_or(0),
            };
            let model = value.get("model").and_then(Value::as_str).unwrap_or(&profile.default_model).to_string();
            Ok(ProviderCallResult { content, reasoning_content: None, model, token_usage, finish_reason: None, latency_ms: 0 })
        }
    }
}

fn endpoint(profile: &ProviderProfile) -> String {
    match profile.dialect {
        WireDialect::OpenAiCompatible => format!("{}/chat/completions", profile.base_url.trim_end_matches('/')),
        WireDialect::Ollama => format!("{}/api/chat", profile.base_url.trim_end_matches('/')),
    }
}

/// One provider's HTTP client: persistent transport, retry loop honoring
/// `Retry-After` verbatim on 429, exponential backoff otherwise.
pub struct ProviderClient {
    profile: ProviderProfile,
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    backoff: Backoff,
    jitter: Jitter,
}

impl ProviderClient {
    pub fn new(profile: ProviderProfile, transport: Arc<dyn Transport>) -> Self {
        let backoff = Backoff::exponential(profile.retry_delay).with_max(Duration::from_secs(60));
        Self { profile, transport, sleeper: Arc::new(TokioSleeper), backoff, jitter: Jitter::full() }
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    /// Issue one chat call, retrying transport errors and 429s up to
    /// `max_retries`. A 429's `Retry-After` is honored verbatim and does not
    /// count as a breaker failure at the call site (the caller decides that
    /// by inspecting the returned error kind).
    pub async fn chat(&self, secret: &str, call: &ChatCall) -> Result<ProviderCallResult, ProviderError> {
        let payload = build_payload(&self.profile, &call);
        let body = serde_json::to_vec(&payload).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Authorization".to_string(), format!("Bearer {secret}")),
        ];
        let url = endpoint(&self.profile);

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let start = Instant::now();
            let request = HttpRequest { url: url.clone(), headers: headers.clone(), body: body.clone(), timeout: self.profile.timeout };

            let response = self.transport.post_json(request).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match response {
                Ok(resp) if resp.status == 200 => {
                    let mut parsed = parse_response(&self.profile, &resp.body)?;
                    parsed.latency_ms = elapsed_ms;
                    return Ok(parsed);
                }
                Ok(resp) if resp.status == 429 => {
                    let retry_after = resp
                        .header("Retry-After")
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    if attempt > self.profile.max_retries {
                        tracing::warn!(provider = %self.profile.name, attempt, "rate limited, retries exhausted");
                        return Err(ProviderError::RateLimited { retry_after });
                    }
                    tracing::debug!(provider = %self.profile.name, attempt, ?retry_after, "rate limited, honoring Retry-After");
                    self.sleeper.sleep(retry_after.unwrap_or(Duration::from_secs(30))).await;
                    continue;
                }
                Ok(resp) if resp.status == 401 || resp.status == 403 => {
                    tracing::error!(provider = %self.profile.name, status = resp.status, "authentication error, not retried");
                    return Err(ProviderError::Auth { status: resp.status });
                }
                Ok(resp) if resp.status >= 500 => {
                    if attempt > self.profile.max_retries {
                        tracing::warn!(provider = %self.profile.name, status = resp.status, attempt, "upstream server error, retries exhausted");
                        return Err(ProviderError::UpstreamServer {
                            status: resp.status,
                            body: String::from_utf8_lossy(&resp.body).to_string(),
                        });
                    }
                    tracing::debug!(provider = %self.profile.name, status = resp.status, attempt, "upstream server error, retrying");
                    self.sleep_backoff(attempt).await;
                    continue;
                }
                Ok(resp) => {
                    return Err(ProviderError::Decode(format!("unexpected status {}", resp.status)));
                }
                Err(crate::transport::TransportError::Timeout) => {
                    if attempt > self.profile.max_retries {
                        tracing::warn!(provider = %self.profile.name, attempt, "call timed out, retries exhausted");
                        return Err(ProviderError::Timeout(self.profile.timeout));
                    }
                    tracing::debug!(provider = %self.profile.name, attempt, "call timed out, retrying");
                    self.sleep_backoff(attempt).await;
                    continue;
                }
                Err(crate::transport::TransportError::Connect(msg)) => {
                    if attempt > self.profile.max_retries {
                        tracing::warn!(provider = %self.profile.name, attempt, %msg, "transport error, retries exhausted");
                        return Err(ProviderError::Network(msg));
                    }
                    tracing::debug!(provider = %self.profile.name, attempt, %msg, "transport error, retrying");
                    self.sleep_backoff(attempt).await;
                    continue;
                }
            }
        }
    }

    async fn sleep_backoff(&self, attempt: usize) {
        let delay = self.jitter.apply(self.backoff.delay(attempt));
        self.sleeper.sleep(delay).await;
    }

    /// Consume an SSE-style streaming response, yielding each delta chunk's
    /// text as it arrives, terminated by `data: [DONE]`.
    pub fn parse_sse_chunk(&self, line: &str) -> Option<String> {
        parse_sse_line(self.profile.dialect, line)
    }

    /// Open a streaming chat call. Returns a finite, non-restartable stream
    /// of text deltas; the terminator line is consumed, not yielded.
    pub async fn chat_stream(&self, secret: &str, call: &ChatCall) -> Result<ChatChunkStream, ProviderError> {
        let mut payload = build_payload(&self.profile, call);
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(true));
        }
        let body = serde_json::to_vec(&payload).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Authorization".to_string(), format!("Bearer {secret}")),
        ];
        let url = endpoint(&self.profile);
        let request = HttpRequest { url, headers, body, timeout: self.profile.timeout };

        let byte_stream = self.transport.post_json_stream(request).await.map_err(map_transport_err)?;
        let dialect = self.profile.dialect;

        let stream = futures::stream::unfold((byte_stream, String::new(), false), move |(mut bytes, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);
                    if line.trim() == "data: [DONE]" {
                        return None;
                    }
                    if let Some(content) = parse_sse_line(dialect, &line) {
                        return Some((Ok(content), (bytes, buffer, false)));
                    }
                    continue;
                }
                use futures::StreamExt;
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        continue;
                    }
                    Some(Err(e)) => return Some((Err(map_transport_err(e)), (bytes, String::new(), true))),
                    None => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

fn map_transport_err(e: crate::transport::TransportError) -> ProviderError {
    match e {
        crate::transport::TransportError::Timeout => ProviderError::Timeout(Duration::from_secs(0)),
        crate::transport::TransportError::Connect(msg) => ProviderError::Network(msg),
    }
}

fn parse_sse_line(dialect: WireDialect, line: &str) -> Option<String> {
    let data = line.strip_prefix("data: ")?;
    if data.trim() == "[DONE]" {
        return None;
    }
    let value: Value = serde_json::from_str(data).ok()?;
    match dialect {
        WireDialect::OpenAiCompatible => value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string),
        WireDialect::Ollama => value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Text deltas from a streaming chat call, in arrival order.
pub type ChatChunkStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Optional non-critical-path convenience: round-robin over multiple
/// endpoints of the same logical provider (e.g. several Ollama hosts),
/// with a per-index failure cooldown. Grounded on `base_client.py`'s
/// `LLMClientPool`; the Broker itself talks to `KeyPool` + `ProviderClient`
/// directly and does not use this type on the critical path.
pub struct ProviderClientPool {
    clients: Vec<Arc<ProviderClient>>,
    next: AtomicUsize,
    failed_until_millis: Vec<AtomicUsize>,
    fail_cooldown: Duration,
}

impl ProviderClientPool {
    pub fn new(clients: Vec<Arc<ProviderClient>>) -> Self {
        let n = clients.len();
        Self {
            clients,
            next: AtomicUsize::new(0),
            failed_until_millis: (0..n).map(|_| AtomicUsize::new(0)).collect(),
            fail_cooldown: Duration::from_secs(60),
        }
    }

    /// Pick the next non-cooling client round-robin; falls back to index 0
    /// if every client is currently cooling (better to try than to give up).
    pub fn pick(&self, now_millis: usize) -> Arc<ProviderClient> {
        let n = self.clients.len();
        for _ in 0..n {
            let i = self.next.fetch_add(1, Ordering::Relaxed) % n;
            if self.failed_until_millis[i].load(Ordering::Relaxed) <= now_millis {
                return self.clients[i].clone();
            }
        }
        self.clients[0].clone()
    }

    pub fn mark_failed(&self, index: usize, now_millis: usize) {
        if let Some(slot) = self.failed_until_millis.get(index) {
            slot.store(now_millis + self.fail_cooldown.as_millis() as usize, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedTransport;
    use crate::transport::{HttpResponse, TransportError};
    use std::collections::HashMap;

    fn profile() -> ProviderProfile {
        ProviderProfile::openai_compatible("deepseek", "https://api.deepseek.com", "deepseek-chat")
    }

    fn call() -> ChatCall {
        ChatCall { messages: vec![ChatMessage { role: "user".into(), content: "ping".into(), name: None }], temperature: 0.7, max_tokens: 256 }
    }

    #[tokio::test]
    async fn happy_path_parses_content_and_usage() {
        let body = serde_json::to_vec(&json!({
            "choices": [{"message": {"content": "pong"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
        }))
        .unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(HttpResponse { status: 200, headers: HashMap::new(), body })]));
        let client = ProviderClient::new(profile(), transport).with_sleeper(crate::sleeper::InstantSleeper);
        let result = client.chat("secret", &call()).await.unwrap();
        assert_eq!(result.content, "pong");
        assert_eq!(result.token_usage.total_tokens, 7);
    }

    #[tokio::test]
    async fn retries_on_429_then_succeeds() {
        let ok_body = serde_json::to_vec(&json!({"choices": [{"message": {"content": "ok"}}], "usage": {}})).unwrap();
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "0".to_string());
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(HttpResponse { status: 429, headers, body: vec![] }),
            Ok(HttpResponse { status: 200, headers: HashMap::new(), body: ok_body }),
        ]));
        let client = ProviderClient::new(profile(), transport.clone()).with_sleeper(crate::sleeper::InstantSleeper);
        let result = client.chat("secret", &call()).await.unwrap();
        assert_eq!(result.content, "ok");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn auth_error_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(HttpResponse { status: 401, headers: HashMap::new(), body: vec![] })]));
        let client = ProviderClient::new(profile(), transport.clone()).with_sleeper(crate::sleeper::InstantSleeper);
        let err = client.chat("secret", &call()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth { status: 401 }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausts_retries_on_repeated_5xx() {
        let mut profile = profile();
        profile.max_retries = 1;
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(HttpResponse { status: 500, headers: HashMap::new(), body: b"boom".to_vec() }),
            Ok(HttpResponse { status: 500, headers: HashMap::new(), body: b"boom".to_vec() }),
        ]));
        let client = ProviderClient::new(profile, transport).with_sleeper(crate::sleeper::InstantSleeper);
        let err = client.chat("secret", &call()).await.unwrap_err();
        assert!(matches!(err, ProviderError::UpstreamServer { status: 500, .. }));
    }

    #[tokio::test]
    async fn network_error_surfaces_after_retries() {
        let mut profile = profile();
        profile.max_retries = 0;
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportError::Connect("refused".into()))]));
        let client = ProviderClient::new(profile, transport).with_sleeper(crate::sleeper::InstantSleeper);
        let err = client.chat("secret", &call()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Network(_)));
    }

    #[test]
    fn ollama_payload_shape() {
        let profile = ProviderProfile::ollama("http://localhost:11434", "llama3");
        let payload = build_payload(&profile, &call());
        assert_eq!(payload["stream"], false);
        assert_eq!(payload["options"]["num_predict"], 256);
    }

    #[test]
    fn sse_chunk_parsing_and_done_terminator() {
        let profile = profile();
        let client = ProviderClient::new(profile, Arc::new(ScriptedTransport::new(vec![])));
        let chunk = client.parse_sse_chunk("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}");
        assert_eq!(chunk.as_deref(), Some("hi"));
        assert_eq!(client.parse_sse_chunk("data: [DONE]"), None);
    }

    struct ScriptedStreamTransport {
        body: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedStreamTransport {
        async fn post_json(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            unreachable!("streaming tests only exercise post_json_stream")
        }

        async fn post_json_stream(&self, _request: HttpRequest) -> Result<crate::transport::ByteChunkStream, TransportError> {
            let chunk = self.body.clone();
            Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
        }
    }

    #[tokio::test]
    async fn chat_stream_yields_deltas_then_ends_at_done() {
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\ndata: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\ndata: [DONE]\n";
        let transport = Arc::new(ScriptedStreamTransport { body: sse.as_bytes().to_vec() });
        let client = ProviderClient::new(profile(), transport);
        let mut stream = client.chat_stream("secret", &call()).await.unwrap();

        use futures::StreamExt;
        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(&chunk.unwrap());
        }
        assert_eq!(collected, "hi there");
    }
}
