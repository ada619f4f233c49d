//! Injectable HTTP transport seam for `ProviderClient`.
//!
//! Grounded on the teacher's `Sleeper` trait (`sleeper.rs`): production code
//! depends on a small async trait rather than directly on `reqwest`, so
//! tests can substitute a scripted implementation instead of reaching for an
//! HTTP-mocking crate (none appears anywhere in the retrieved example pack).

use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

/// A minimal request the `ProviderClient` needs to issue.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

/// A minimal response the `ProviderClient` needs to interpret.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout,
    Connect(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "transport timed out"),
            Self::Connect(msg) => write!(f, "transport connect error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Raw body chunks from a streaming response, in arrival order.
pub type ByteChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// The seam `ProviderClient` dispatches through. `ReqwestTransport` is the
/// production implementation; tests inject a scripted one.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Streaming variant for SSE/NDJSON responses. The default rejects;
    /// only transports that actually speak chunked HTTP need implement it.
    async fn post_json_stream(&self, _request: HttpRequest) -> Result<ByteChunkStream, TransportError> {
        Err(TransportError::Connect("streaming not supported by this transport".into()))
    }
}

/// Production transport backed by a shared `reqwest::Client` (one per
/// `ProviderClient`, matching the original's persistent aiohttp session).
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .body(request.body)
            .timeout(request.timeout);
        for (k, v) in &request.headers {
            builder = builder.header(k, v);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, headers, body })
    }

    async fn post_json_stream(&self, request: HttpRequest) -> Result<ByteChunkStream, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .body(request.body)
            .timeout(request.timeout);
        for (k, v) in &request.headers {
            builder = builder.header(k, v);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(TransportError::Connect(format!("unexpected status {}", response.status().as_u16())));
        }

        use futures::StreamExt;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| TransportError::Connect(e.to_string())));
        Ok(Box::pin(stream))
    }
}
