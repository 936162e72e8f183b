//! A scripted provider for tests: no network, deterministic chunking.

use async_trait::async_trait;

use rag_core::agent::provider::{ChatRequest, Provider};
use rag_core::agent::streaming::{MockStreamBuilder, StreamingResponse};
use rag_core::error::Result;

/// Replays a fixed text response, split into 10-character chunks to
/// approximate real streaming, or a single scripted tool call.
pub struct MockProvider {
    response: MockResponse,
}

enum MockResponse {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
}

impl MockProvider {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: MockResponse::Text(response.into()),
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            response: MockResponse::ToolCall {
                id: id.into(),
                name: name.into(),
                arguments,
            },
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn stream_completion(&self, _request: ChatRequest) -> Result<StreamingResponse> {
        let mut builder = MockStreamBuilder::new();
        builder = match &self.response {
            MockResponse::Text(text) => {
                let chunks: Vec<String> = text
                    .chars()
                    .collect::<Vec<_>>()
                    .chunks(10)
                    .map(|c| c.iter().collect())
                    .collect();
                chunks
                    .into_iter()
                    .fold(builder, |builder, chunk| builder.message(chunk))
            }
            MockResponse::ToolCall {
                id,
                name,
                arguments,
            } => builder.tool_call(id.clone(), name.clone(), arguments.clone()),
        };
        Ok(builder.done().build())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use rag_core::agent::message::Message;
    use rag_core::agent::streaming::StreamingChoice;

    #[tokio::test]
    async fn replays_scripted_text() {
        let provider = MockProvider::text("Hello, world!");
        let stream = provider
            .stream_completion(ChatRequest {
                model: "mock".to_string(),
                messages: vec![Message::user("hi")],
                ..Default::default()
            })
            .await
            .unwrap();
        let text = stream.collect_text().await.unwrap();
        assert_eq!(text, "Hello, world!");
    }

    #[tokio::test]
    async fn replays_scripted_tool_call() {
        let provider =
            MockProvider::tool_call("call_1", "search_knowledge", serde_json::json!({"q": "x"}));
        let mut stream = provider
            .stream_completion(ChatRequest::default())
            .await
            .unwrap();
        match stream.next().await {
            Some(Ok(StreamingChoice::ToolCall { name, .. })) => {
                assert_eq!(name, "search_knowledge");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
