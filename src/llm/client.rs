//! OpenAI-compatible chat client
//!
//! Every LLM touchpoint in the agent (intent classification, time parsing,
//! yes/no checks, the delay-gathering tool loop) goes through the
//! `ChatModel` seam; tests script it, production uses `LlmClient`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backoff::{retry_with_deadline, RetryPolicy};
use crate::config::LlmConfig;
use crate::error::{CollabResult, CollaboratorError};

/// Per-call deadline; classification must not hold a phone call hostage.
const LLM_DEADLINE: Duration = Duration::from_secs(10);

/// One chat message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".into(),
            content,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Function definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Value,
}

/// Tool call returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    /// Deterministic, tightly capped request — the shape every classifier uses.
    pub fn deterministic(messages: Vec<ChatMessage>, max_tokens: u32) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            temperature: 0.0,
            max_tokens,
        }
    }
}

/// Model response, normalized.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// The chat seam.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> CollabResult<ChatOutcome>;
}

/// Production client for any OpenAI-compatible endpoint.
pub struct LlmClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool<'a>>>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    r#type: &'static str,
    function: &'a ToolDefinition,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: String,
    /// Arrives as a JSON-encoded string; some models send a bare object.
    #[serde(default)]
    arguments: Value,
}

fn normalize_arguments(raw: Value) -> Value {
    match raw {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::Null),
        other => other,
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn chat(&self, request: ChatRequest) -> CollabResult<ChatOutcome> {
        let url = format!("{}/chat/completions", self.api_base);
        let tools: Option<Vec<WireTool>> = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|function| WireTool { r#type: "function", function })
                    .collect(),
            )
        };
        let wire = WireRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools,
        };
        let body = serde_json::to_value(&wire)
            .map_err(|err| CollaboratorError::invalid("llm", err.to_string()))?;

        let response: WireResponse = retry_with_deadline(
            "llm",
            RetryPolicy::default(),
            LLM_DEADLINE,
            || async {
                let resp = self
                    .http
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|err| CollaboratorError::unavailable("llm", err.to_string()))?
                    .error_for_status()
                    .map_err(|err| CollaboratorError::unavailable("llm", err.to_string()))?;
                resp.json()
                    .await
                    .map_err(|err| CollaboratorError::invalid("llm", err.to_string()))
            },
        )
        .await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CollaboratorError::invalid("llm", "response had no choices"))?;

        Ok(ChatOutcome {
            text: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: normalize_arguments(call.function.arguments),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_response_parses_tool_calls() {
        let raw = r#"{
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{"id": "call_1", "type": "function",
                    "function": {"name": "record_delay_details",
                                 "arguments": "{\"delay_minutes\": 30}"}}]
            }}]
        }"#;
        let parsed: WireResponse = serde_json::from_str(raw).unwrap();
        let call = &parsed.choices[0].message.tool_calls[0];
        assert_eq!(call.function.name, "record_delay_details");
        let args = normalize_arguments(call.function.arguments.clone());
        assert_eq!(args["delay_minutes"], 30);
    }

    #[test]
    fn arguments_accept_bare_objects() {
        let args = normalize_arguments(serde_json::json!({"customer_name": "James"}));
        assert_eq!(args["customer_name"], "James");
    }

    #[test]
    fn tools_are_omitted_when_empty() {
        let request = ChatRequest::deterministic(vec![ChatMessage::user("hi")], 20);
        assert!(request.tools.is_empty());
        assert_eq!(request.temperature, 0.0);
    }
}
