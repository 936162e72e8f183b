//! Provider trait for LLM integrations.
//!
//! Implementations live in `rag-providers`; this crate only depends on the
//! trait and the request/response shapes it consumes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::message::Message;
use crate::agent::streaming::StreamingResponse;
use crate::error::Result;

mod resilient;

pub use resilient::{CircuitBreakerConfig, ResilientProvider};

/// Definition of one of the agent's fixed tools, as sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request for a chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub extra_params: Option<serde_json::Value>,
}

/// Trait for LLM providers. Implement this to add support for a new
/// chat-completion backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stream a completion request.
    async fn stream_completion(&self, request: ChatRequest) -> Result<StreamingResponse>;

    /// Provider name, for logging.
    fn name(&self) -> &'static str;

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_tools(&self) -> bool {
        true
    }
}
