//! Scripted LLM client for tests and dry runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::types::{ChatMessage, LlmClient, SchemaDescriptor};
use super::ServiceError;

/// What the scripted responder sees of a call.
#[derive(Debug, Clone)]
pub struct MockRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub schema_name: &'a str,
    pub reasoning_effort: Option<&'a str>,
}

impl MockRequest<'_> {
    /// Content of the last user message.
    pub fn user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == super::Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    /// Content of the instruction message.
    pub fn instructions(&self) -> &str {
        self.messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

type Responder = dyn Fn(&MockRequest<'_>) -> Result<String, ServiceError> + Send + Sync;

/// Mock LLM client. Answers every call through a closure.
///
/// Tracks total calls and the peak number of calls in flight at once.
pub struct MockLlmClient {
    responder: Box<Responder>,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockLlmClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&MockRequest<'_>) -> Result<String, ServiceError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Always answer with the same text.
    pub fn fixed(response: &str) -> Self {
        let response = response.to_string();
        Self::new(move |_| Ok(response.clone()))
    }

    /// Block every call for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl LlmClient for MockLlmClient {
    fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        schema: &SchemaDescriptor,
        _timeout: Duration,
        reasoning_effort: Option<&str>,
    ) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let request = MockRequest {
            model,
            messages,
            schema_name: &schema.name,
            reasoning_effort,
        };
        let result = (self.responder)(&request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
