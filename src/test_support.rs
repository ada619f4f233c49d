//! Test-only seams shared between unit tests and the top-level `tests/`
//! integration binaries. Not gated behind `#[cfg(test)]` because integration
//! tests compile against the crate as an external consumer and need a
//! stable path to reach them; kept out of the `prelude` so production code
//! never picks them up.

use crate::clock::Clock;
use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Deterministic clock a test can advance by hand.
#[derive(Debug)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lets a caller retain an `Arc<ManualClock>` handle to advance after
/// handing a clone into a `with_clock` builder that takes `C` by value.
impl Clock for Arc<ManualClock> {
    fn now_millis(&self) -> u64 {
        self.as_ref().now_millis()
    }
}

/// A `Transport` that replays a fixed script of responses in order,
/// recording every request it was asked to send. Takes the place of an
/// HTTP-mocking crate, none of which appears anywhere in the retrieved
/// example pack.
pub struct ScriptedTransport {
    responses: Mutex<Vec<Result<HttpResponse, TransportError>>>,
    pub requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(mut responses: Vec<Result<HttpResponse, TransportError>>) -> Self {
        responses.reverse();
        Self { responses: Mutex::new(responses), requests: Mutex::new(Vec::new()) }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).push(request);
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop()
            .unwrap_or(Err(TransportError::Connect("scripted transport exhausted".into())))
    }
}

/// A `Transport` that always answers the same JSON body, after an optional
/// artificial delay — useful for exercising cache build-coalescing (S5).
pub struct SlowEchoTransport {
    pub body: Vec<u8>,
    pub delay: std::time::Duration,
    pub calls: AtomicU64,
}

impl SlowEchoTransport {
    pub fn new(body: Vec<u8>, delay: std::time::Duration) -> Self {
        Self { body, delay, calls: AtomicU64::new(0) }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SlowEchoTransport {
    async fn post_json(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(HttpResponse {
            status: 200,
            headers: std::collections::HashMap::new(),
            body: self.body.clone(),
        })
    }
}
