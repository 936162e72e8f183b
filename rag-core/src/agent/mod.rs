//! LLM messaging, streaming response, and provider plumbing shared by the
//! research agent's tool-call loop.

pub mod message;
pub mod provider;
pub mod research_agent;
pub mod streaming;

pub use message::{Content, ContentPart, ImageSource, Message, Role, ToolCall};
pub use provider::{ChatRequest, Provider, ToolDefinition};
pub use research_agent::{Citation, ResearchAgent, ResponseEvent, ResponseEventKind};
pub use streaming::{MockStreamBuilder, StreamingChoice, StreamingResponse, StreamingResult};
