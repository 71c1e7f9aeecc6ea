use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ServiceError;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instruction channel of reasoning models (the successor of `system`).
    Developer,
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Developer => "developer",
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn developer(content: impl Into<String>) -> Self {
        Self {
            role: Role::Developer,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Named JSON schema the completion must conform to.
///
/// Serializes in the `json_schema` shape of structured-output APIs:
/// `{"name": .., "strict": .., "schema": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    pub strict: bool,
    pub schema: serde_json::Value,
}

impl SchemaDescriptor {
    /// Object schema whose properties are all required strings.
    pub fn string_object(name: &str, keys: &[&str]) -> Self {
        let properties: serde_json::Map<String, serde_json::Value> = keys
            .iter()
            .map(|k| ((*k).to_string(), serde_json::json!({"type": "string"})))
            .collect();

        Self {
            name: name.to_string(),
            strict: true,
            schema: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": keys,
                "additionalProperties": false,
            }),
        }
    }

    /// Keys listed under `required`, in declaration order.
    pub fn required_keys(&self) -> Vec<&str> {
        self.schema
            .get("required")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Completion service abstraction (allows mocking).
///
/// Implementations block for at most `timeout` and return the raw
/// completion text; decoding it is the caller's job. `reasoning_effort`
/// is a hint for reasoning models and may be ignored by backends that
/// have no such setting.
pub trait LlmClient: Send + Sync {
    fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        schema: &SchemaDescriptor,
        timeout: Duration,
        reasoning_effort: Option<&str>,
    ) -> Result<String, ServiceError>;
}
