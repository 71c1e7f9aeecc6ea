use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{ChatMessage, LlmClient, Role, SchemaDescriptor};
use super::{map_transport_error, ServiceError};

/// Default local Ollama instance.
pub const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const TEMPERATURE: f32 = 0.1;

/// Ollama HTTP client for local LLM inference via `/api/chat`.
///
/// Structured output is requested by passing the JSON schema as `format`.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::blocking::Client::new(),
        }
    }
}

/// Request body for Ollama /api/chat
#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    format: &'a serde_json::Value,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Response body from Ollama /api/chat
#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

/// Ollama has no `developer` role; instructions travel as `system`.
fn ollama_role(role: Role) -> &'static str {
    match role {
        Role::Developer | Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

impl LlmClient for OllamaClient {
    fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        schema: &SchemaDescriptor,
        timeout: Duration,
        _reasoning_effort: Option<&str>,
    ) -> Result<String, ServiceError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaChatRequest {
            model,
            messages: messages
                .iter()
                .map(|m| OllamaMessage {
                    role: ollama_role(m.role),
                    content: &m.content,
                })
                .collect(),
            format: &schema.schema,
            stream: false,
            options: OllamaOptions {
                temperature: TEMPERATURE,
            },
        };

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .map_err(|e| map_transport_error(e, &self.base_url, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ServiceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaChatResponse = response
            .json()
            .map_err(|e| ServiceError::ResponseParsing(e.to_string()))?;

        if parsed.message.content.trim().is_empty() {
            return Err(ServiceError::EmptyResponse);
        }
        Ok(parsed.message.content)
    }
}
