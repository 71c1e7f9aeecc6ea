//! Chat-completions client for OpenAI and Azure OpenAI deployments.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{ChatMessage, LlmClient, SchemaDescriptor};
use super::{map_transport_error, ServiceError};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default Azure OpenAI REST API version.
pub const AZURE_DEFAULT_API_VERSION: &str = "2024-10-21";

#[derive(Debug, Clone)]
enum Endpoint {
    OpenAi { base_url: String },
    Azure { endpoint: String, api_version: String },
}

/// Blocking chat-completions client with JSON-schema structured output.
pub struct OpenAiClient {
    endpoint: Endpoint,
    api_key: String,
    client: reqwest::blocking::Client,
}

impl OpenAiClient {
    /// Client for the public OpenAI API.
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, OPENAI_BASE_URL)
    }

    /// Client for any OpenAI-compatible endpoint (proxies, gateways).
    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            endpoint: Endpoint::OpenAi {
                base_url: base_url.trim_end_matches('/').to_string(),
            },
            api_key: api_key.to_string(),
            client: reqwest::blocking::Client::new(),
        }
    }

    /// Client for an Azure OpenAI resource. The model id passed to
    /// `complete` is used as the deployment name.
    pub fn azure(endpoint: &str, api_key: &str, api_version: &str) -> Self {
        Self {
            endpoint: Endpoint::Azure {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                api_version: api_version.to_string(),
            },
            api_key: api_key.to_string(),
            client: reqwest::blocking::Client::new(),
        }
    }

    fn completions_url(&self, model: &str) -> String {
        match &self.endpoint {
            Endpoint::OpenAi { base_url } => format!("{base_url}/chat/completions"),
            Endpoint::Azure {
                endpoint,
                api_version,
            } => format!(
                "{endpoint}/openai/deployments/{model}/chat/completions?api-version={api_version}"
            ),
        }
    }

    fn base_url(&self) -> &str {
        match &self.endpoint {
            Endpoint::OpenAi { base_url } => base_url,
            Endpoint::Azure { endpoint, .. } => endpoint,
        }
    }
}

/// Request body for `/chat/completions`.
#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    response_format: ResponseFormat<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: &'a SchemaDescriptor,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl LlmClient for OpenAiClient {
    fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        schema: &SchemaDescriptor,
        timeout: Duration,
        reasoning_effort: Option<&str>,
    ) -> Result<String, ServiceError> {
        let body = ChatCompletionRequest {
            model,
            messages,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: schema,
            },
            reasoning_effort,
        };

        let request = self
            .client
            .post(self.completions_url(model))
            .timeout(timeout)
            .json(&body);
        let request = match &self.endpoint {
            Endpoint::OpenAi { .. } => request.bearer_auth(&self.api_key),
            Endpoint::Azure { .. } => request.header("api-key", &self.api_key),
        };

        let response = request
            .send()
            .map_err(|e| map_transport_error(e, self.base_url(), timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ServiceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .map_err(|e| ServiceError::ResponseParsing(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ServiceError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_url_trims_trailing_slash() {
        let client = OpenAiClient::with_base_url("k", "http://localhost:8080/v1/");
        assert_eq!(
            client.completions_url("o4-mini"),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn azure_url_uses_deployment_and_version() {
        let client = OpenAiClient::azure("https://res.openai.azure.com/", "k", "2024-10-21");
        assert_eq!(
            client.completions_url("gpt-4o"),
            "https://res.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-10-21"
        );
    }

    #[test]
    fn request_body_carries_json_schema_format() {
        let schema = SchemaDescriptor::string_object("error_report", &["error", "error_reason"]);
        let messages = vec![ChatMessage::developer("check"), ChatMessage::user("report")];
        let body = ChatCompletionRequest {
            model: "o4-mini",
            messages: &messages,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: &schema,
            },
            reasoning_effort: Some("high"),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["response_format"]["type"], "json_schema");
        assert_eq!(value["response_format"]["json_schema"]["name"], "error_report");
        assert_eq!(value["messages"][0]["role"], "developer");
        assert_eq!(value["reasoning_effort"], "high");
    }

    #[test]
    fn reasoning_effort_omitted_by_default() {
        let schema = SchemaDescriptor::string_object("preprocessing", &["findings"]);
        let body = ChatCompletionRequest {
            model: "gpt-4.1-nano",
            messages: &[],
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: &schema,
            },
            reasoning_effort: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("reasoning_effort").is_none());
    }

    #[test]
    fn unreachable_endpoint_is_connection_error() {
        // Port 9 (discard) is essentially never listening on loopback.
        let client = OpenAiClient::with_base_url("k", "http://127.0.0.1:9");
        let schema = SchemaDescriptor::string_object("preprocessing", &["findings"]);
        let err = client
            .complete("m", &[], &schema, Duration::from_secs(2), Some("high"))
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
