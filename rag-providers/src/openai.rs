//! OpenAI-style and Azure OpenAI chat-completion provider.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use rag_core::agent::message::{Content, ContentPart, ImageSource, Message, Role, ToolCall};
use rag_core::agent::provider::{ChatRequest, Provider, ToolDefinition};
use rag_core::agent::streaming::{StreamingChoice, StreamingResponse};
use rag_core::config::Config;
use rag_core::error::{Error, Result};

use crate::sse::SseBuffer;
use crate::HttpConfig;

/// Which wire shape to speak: OpenAI's public API, or an Azure OpenAI
/// resource (fixed deployment, api-version query param, `api-key` header).
#[derive(Debug, Clone)]
pub enum Endpoint {
    OpenAiStyle { base_url: String },
    Azure {
        endpoint: String,
        deployment: String,
        api_version: String,
    },
}

/// Chat-completion provider backed by either endpoint shape.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: Endpoint,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, endpoint: Endpoint) -> Result<Self> {
        let client = HttpConfig::default().build_client()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint,
        })
    }

    /// Build from process config: an Azure deployment is used when both
    /// `llm_deployment` and `llm_api_version` are set; otherwise falls back
    /// to `llm_endpoint` (or the public OpenAI API when that is also
    /// absent).
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config
            .llm_api_key
            .clone()
            .ok_or_else(|| Error::Provider("llm_api_key not configured".to_string()))?;

        let endpoint = match (&config.llm_deployment, &config.llm_api_version) {
            (Some(deployment), Some(api_version)) => {
                let endpoint = config.llm_endpoint.clone().ok_or_else(|| {
                    Error::Provider("llm_endpoint required for an Azure deployment".to_string())
                })?;
                Endpoint::Azure {
                    endpoint,
                    deployment: deployment.clone(),
                    api_version: api_version.clone(),
                }
            }
            _ => Endpoint::OpenAiStyle {
                base_url: config
                    .llm_endpoint
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            },
        };

        Self::new(api_key, endpoint)
    }

    fn completions_url(&self, model: &str) -> String {
        match &self.endpoint {
            Endpoint::OpenAiStyle { base_url } => format!("{base_url}/chat/completions"),
            Endpoint::Azure {
                endpoint,
                deployment,
                api_version,
            } => {
                let _ = model;
                format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    endpoint.trim_end_matches('/'),
                    deployment,
                    api_version
                )
            }
        }
    }

    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match &self.endpoint {
            Endpoint::OpenAiStyle { .. } => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                        .map_err(|err| Error::Internal(err.to_string()))?,
                );
            }
            Endpoint::Azure { .. } => {
                headers.insert(
                    "api-key",
                    HeaderValue::from_str(&self.api_key)
                        .map_err(|err| Error::Internal(err.to_string()))?,
                );
            }
        }
        Ok(headers)
    }
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireToolFunction,
}

#[derive(Debug, Serialize)]
struct WireToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

fn convert_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<WireMessage> {
    let mut result = Vec::with_capacity(messages.len() + 1);

    if let Some(prompt) = system_prompt {
        result.push(WireMessage {
            role: "system".to_string(),
            content: serde_json::Value::String(prompt.to_string()),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        });
    }

    for msg in messages {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        let mut tool_calls = Vec::new();
        let mut tool_call_id = None;
        let content: serde_json::Value;

        match &msg.content {
            Content::Text(text) => {
                content = serde_json::Value::String(text.clone());
            }
            Content::Parts(parts) => {
                let mut json_parts = Vec::new();
                let mut text_acc = String::new();

                for part in parts {
                    match part {
                        ContentPart::Text { text } => {
                            text_acc.push_str(text);
                            json_parts.push(serde_json::json!({"type": "text", "text": text}));
                        }
                        ContentPart::Image { source } => {
                            let url = match source {
                                ImageSource::Url { url } => url.clone(),
                                ImageSource::Base64 { media_type, data } => {
                                    format!("data:{media_type};base64,{data}")
                                }
                            };
                            json_parts
                                .push(serde_json::json!({"type": "image_url", "image_url": {"url": url}}));
                        }
                        ContentPart::ToolCall {
                            id,
                            name,
                            arguments,
                        } => {
                            tool_calls.push(WireToolCall {
                                id: id.clone(),
                                call_type: "function".to_string(),
                                function: WireFunction {
                                    name: name.clone(),
                                    arguments: arguments.to_string(),
                                },
                            });
                        }
                        ContentPart::ToolResult {
                            tool_call_id: id,
                            content,
                            ..
                        } => {
                            tool_call_id = Some(id.clone());
                            text_acc = content.clone();
                        }
                    }
                }

                if tool_call_id.is_some() || !tool_calls.is_empty() {
                    content = if text_acc.is_empty() {
                        serde_json::Value::Null
                    } else {
                        serde_json::Value::String(text_acc)
                    };
                } else if json_parts.iter().any(|p| p["type"] == "image_url") {
                    content = serde_json::Value::Array(json_parts);
                } else {
                    content = serde_json::Value::String(text_acc);
                }
            }
        }

        result.push(WireMessage {
            role: role.to_string(),
            content,
            name: msg.name.clone(),
            tool_call_id,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        });
    }

    result
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<WireTool> {
    tools
        .iter()
        .map(|t| WireTool {
            tool_type: "function".to_string(),
            function: WireToolFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn stream_completion(&self, request: ChatRequest) -> Result<StreamingResponse> {
        let wire_request = WireRequest {
            model: request.model.clone(),
            messages: convert_messages(request.system_prompt.as_deref(), &request.messages),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools: convert_tools(&request.tools),
            stream: true,
        };

        let response = self
            .client
            .post(self.completions_url(&request.model))
            .headers(self.build_headers()?)
            .json(&wire_request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "{} returned {status}: {text}",
                self.name()
            )));
        }

        let stream = response.bytes_stream();
        Ok(StreamingResponse::from_stream(parse_sse_stream(stream)))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Accumulator state for one in-flight (possibly parallel) tool call.
struct ToolCallState {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

fn parse_sse_stream<S>(stream: S) -> impl Stream<Item = std::result::Result<StreamingChoice, Error>>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    let sse_buffer = SseBuffer::new();
    let text_buffer = String::new();
    let current_tools: HashMap<usize, ToolCallState> = HashMap::new();

    futures::stream::unfold(
        (stream, sse_buffer, text_buffer, current_tools),
        move |(mut stream, mut bytes_buffer, mut text_buffer, mut current_tools)| async move {
            loop {
                if let Some(pos) = text_buffer.find("\n\n") {
                    let message = text_buffer[..pos].to_string();
                    text_buffer = text_buffer[pos + 2..].to_string();

                    if let Some(data) = message.strip_prefix("data: ") {
                        if data.trim() == "[DONE]" {
                            return Some((
                                Ok(StreamingChoice::Done),
                                (stream, bytes_buffer, text_buffer, current_tools),
                            ));
                        }

                        match serde_json::from_str::<StreamChunk>(data) {
                            Ok(chunk) => {
                                if let Some(usage) = chunk.usage {
                                    return Some((
                                        Ok(StreamingChoice::Usage {
                                            prompt_tokens: usage.prompt_tokens,
                                            completion_tokens: usage.completion_tokens,
                                            cached_tokens: usage
                                                .prompt_tokens_details
                                                .map(|d| d.cached_tokens)
                                                .unwrap_or(0),
                                        }),
                                        (stream, bytes_buffer, text_buffer, current_tools),
                                    ));
                                }

                                if let Some(choice) = chunk.choices.first() {
                                    if let Some(content) = &choice.delta.content {
                                        if !content.is_empty() {
                                            return Some((
                                                Ok(StreamingChoice::Message(content.clone())),
                                                (stream, bytes_buffer, text_buffer, current_tools),
                                            ));
                                        }
                                    }

                                    if let Some(tool_calls) = &choice.delta.tool_calls {
                                        for tc in tool_calls {
                                            let index = tc.index.unwrap_or(0);
                                            let state =
                                                current_tools.entry(index).or_insert(ToolCallState {
                                                    id: None,
                                                    name: None,
                                                    arguments: String::new(),
                                                });
                                            if let Some(id) = &tc.id {
                                                state.id = Some(id.clone());
                                            }
                                            if let Some(func) = &tc.function {
                                                if let Some(name) = &func.name {
                                                    state.name = Some(name.clone());
                                                }
                                                if let Some(args) = &func.arguments {
                                                    state.arguments.push_str(args);
                                                }
                                            }
                                        }
                                    }

                                    if choice.finish_reason.as_deref() == Some("tool_calls") {
                                        let mut tools_map = HashMap::new();
                                        for (index, state) in current_tools.drain() {
                                            if let (Some(id), Some(name)) = (state.id, state.name) {
                                                let arguments: serde_json::Value =
                                                    serde_json::from_str(&state.arguments)
                                                        .unwrap_or(serde_json::Value::Null);
                                                tools_map.insert(
                                                    index,
                                                    ToolCall::new(id, name, arguments),
                                                );
                                            }
                                        }
                                        if !tools_map.is_empty() {
                                            return Some((
                                                Ok(StreamingChoice::ParallelToolCalls(tools_map)),
                                                (stream, bytes_buffer, text_buffer, current_tools),
                                            ));
                                        }
                                    }
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%err, "failed to parse chat-completion SSE chunk");
                            }
                        }
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(bytes)) => match bytes_buffer.push_and_get_text(&bytes) {
                        Ok(new_text) => text_buffer.push_str(&new_text),
                        Err(err) => {
                            return Some((
                                Err(err),
                                (stream, bytes_buffer, text_buffer, current_tools),
                            ));
                        }
                    },
                    Some(Err(err)) => {
                        return Some((
                            Err(Error::Http(err)),
                            (stream, bytes_buffer, text_buffer, current_tools),
                        ));
                    }
                    None => return None,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_system_prompt_and_roles() {
        let messages = vec![Message::user("Hello"), Message::assistant("Hi there!")];
        let wire = convert_messages(Some("Be helpful"), &messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");
    }

    #[test]
    fn azure_url_includes_deployment_and_api_version() {
        let provider = OpenAiProvider::new(
            "key",
            Endpoint::Azure {
                endpoint: "https://example.openai.azure.com".to_string(),
                deployment: "gpt-4o-mini".to_string(),
                api_version: "2024-08-01-preview".to_string(),
            },
        )
        .unwrap();
        let url = provider.completions_url("unused");
        assert_eq!(
            url,
            "https://example.openai.azure.com/openai/deployments/gpt-4o-mini/chat/completions?api-version=2024-08-01-preview"
        );
    }

    #[test]
    fn openai_style_url_uses_base_url_and_model_path() {
        let provider = OpenAiProvider::new(
            "key",
            Endpoint::OpenAiStyle {
                base_url: "https://api.openai.com/v1".to_string(),
            },
        )
        .unwrap();
        assert_eq!(
            provider.completions_url("gpt-4.1-mini"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn parses_message_and_done_frames() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n",
            "data: [DONE]\n\n",
        );
        let chunks = futures::stream::iter(vec![Ok::<_, reqwest::Error>(bytes::Bytes::from(
            body,
        ))]);
        let mut parsed = parse_sse_stream(chunks);
        match parsed.next().await {
            Some(Ok(StreamingChoice::Message(text))) => assert_eq!(text, "Hi"),
            other => panic!("unexpected: {other:?}"),
        }
        match parsed.next().await {
            Some(Ok(StreamingChoice::Done)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
