//! The agent tool-calling loop (component G, `ResearchAgent`).
//!
//! Bound at construction to one entity. Drives a streaming chat completion
//! against a [`Provider`], dispatching the model's tool calls against the
//! bound [`EntityVectorStore`] and re-issuing the completion with the
//! augmented transcript until the model stops calling tools. Implemented as
//! a `while` loop over a mutable transcript rather than true recursion,
//! guarded by [`MAX_TOOL_HOPS`] as a runaway-loop backstop.

use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use rag_store::{ChunkRecord, EntityVectorStore};

use crate::agent::message::{Content, ContentPart, Message, Role};
use crate::agent::provider::{ChatRequest, Provider, ToolDefinition};
use crate::agent::streaming::StreamingChoice;
use crate::collaborators::Embedder;
use crate::cost::{self, Service, ServiceType};
use crate::error::{Error, Result};
use crate::model::{Node, Relationship, RelationshipLabel};

/// Runaway-loop backstop on the tool-call recursion.
const MAX_TOOL_HOPS: u32 = 15;

/// One citation parsed out of the model's final content, in `[[N](node_id)]`
/// form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    pub number: u32,
    pub node_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseEventKind {
    Delta,
    Update,
    Usage,
    Terminal,
}

/// One event in the turn's response sequence. Exactly one [`ResponseEventKind::Terminal`]
/// event is yielded per outermost turn; `node_ids`/`relationship_ids`/`services_used`
/// are cumulative across the whole turn (see DESIGN.md on the `services_used`
/// aggregation open question), not a diff since the previous event.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub kind: ResponseEventKind,
    pub content: String,
    pub node_ids: Vec<String>,
    pub relationship_ids: Vec<String>,
    pub cited_node_ids: Vec<String>,
    pub services_used: Vec<Service>,
    pub estimated_cost_usd: f64,
    pub citations: Vec<Citation>,
}

impl ResponseEvent {
    fn delta(content: impl Into<String>) -> Self {
        Self {
            kind: ResponseEventKind::Delta,
            content: content.into(),
            node_ids: Vec::new(),
            relationship_ids: Vec::new(),
            cited_node_ids: Vec::new(),
            services_used: Vec::new(),
            estimated_cost_usd: 0.0,
            citations: Vec::new(),
        }
    }
}

fn citation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[\[(\d+)\]\(([^)]+)\)\]").expect("citation regex is valid"))
}

/// Parse `[[N](node_id)]` citations out of accumulated content.
/// `cited_node_ids` is deduplicated by first-seen order; `citations` keeps
/// one entry per distinct citation number, also in first-seen order.
pub fn parse_citations(content: &str) -> (Vec<String>, Vec<Citation>) {
    let mut cited_node_ids = Vec::new();
    let mut citations = Vec::new();
    let mut seen_numbers = std::collections::HashSet::new();

    for caps in citation_pattern().captures_iter(content) {
        let number: u32 = caps[1].parse().unwrap_or(0);
        let node_id = caps[2].to_string();

        if !cited_node_ids.contains(&node_id) {
            cited_node_ids.push(node_id.clone());
        }
        if seen_numbers.insert(number) {
            citations.push(Citation { number, node_id });
        }
    }

    (cited_node_ids, citations)
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default = "default_k")]
    k: usize,
}
fn default_k() -> usize {
    25
}

#[derive(Deserialize)]
struct ChunkRefArgs {
    doc_id: String,
    chunk_order_index: usize,
}

#[derive(Deserialize)]
struct ContextArgs {
    doc_id: String,
    chunk_order_index: usize,
    #[serde(default = "default_context_size")]
    context_size: usize,
}
fn default_context_size() -> usize {
    1
}

#[derive(Deserialize)]
struct DocIdArgs {
    doc_id: String,
}

/// Bound to `(entity_id, entity_name, entity_dir)` at construction via the
/// backing [`EntityVectorStore`]. Stateless across turns: the caller
/// threads the transcript in and reads the terminal event's cumulative
/// fields back out.
pub struct ResearchAgent {
    entity_id: String,
    entity_name: String,
    entity_store: Arc<EntityVectorStore>,
    embedder: Arc<dyn Embedder>,
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f64,
}

impl ResearchAgent {
    pub fn new(
        entity_id: impl Into<String>,
        entity_name: impl Into<String>,
        entity_store: Arc<EntityVectorStore>,
        embedder: Arc<dyn Embedder>,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        temperature: f64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_name: entity_name.into(),
            entity_store,
            embedder,
            provider,
            model: model.into(),
            temperature,
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are a research assistant investigating {name} using only the documents \
             indexed for this entity. Use the navigation tools to search, then follow up \
             with previous/next/context calls to confirm what you find before answering. \
             Prefer a few focused searches over one broad one, and re-query as you learn \
             more. Cite every fact you use with the exact `node_id` from the tool result \
             that supports it, in the form [[N](node_id)] with N counting up from 1. Do \
             not invent a node_id; copy it verbatim from a tool result.",
            name = self.entity_name
        )
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "semantic_search_within_entity".into(),
                description: "Search this entity's documents for chunks relevant to a focused query.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Focused search query"},
                        "k": {"type": "integer", "description": "Number of results (default 25)"}
                    },
                    "required": ["query"]
                }),
            },
            ToolDefinition {
                name: "get_previous_chunk".into(),
                description: "Read the chunk immediately before a given chunk in the same document.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "doc_id": {"type": "string"},
                        "chunk_order_index": {"type": "integer"}
                    },
                    "required": ["doc_id", "chunk_order_index"]
                }),
            },
            ToolDefinition {
                name: "get_next_chunk".into(),
                description: "Read the chunk immediately after a given chunk in the same document.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "doc_id": {"type": "string"},
                        "chunk_order_index": {"type": "integer"}
                    },
                    "required": ["doc_id", "chunk_order_index"]
                }),
            },
            ToolDefinition {
                name: "get_chunk_context".into(),
                description: "Read the chunks surrounding a given chunk (before, current, after).".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "doc_id": {"type": "string"},
                        "chunk_order_index": {"type": "integer"},
                        "context_size": {"type": "integer", "description": "Chunks on each side (default 1)"}
                    },
                    "required": ["doc_id", "chunk_order_index"]
                }),
            },
            ToolDefinition {
                name: "get_entity_documents".into(),
                description: "List the documents available for this entity.".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ToolDefinition {
                name: "get_document_chunks".into(),
                description: "Read a document's first 10 chunks in order, for a broad pass over its content.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"doc_id": {"type": "string"}},
                    "required": ["doc_id"]
                }),
            },
        ]
    }

    fn node_id(&self, doc_id: &str, chunk_order_index: usize) -> String {
        Node::id_for(&self.entity_id, doc_id, chunk_order_index)
    }

    fn track_node(node_ids: &mut Vec<String>, node_id: String) {
        if !node_ids.contains(&node_id) {
            node_ids.push(node_id);
        }
    }

    fn track_edge(relationship_ids: &mut Vec<String>, source: &str, target: &str) {
        let id = Relationship::id_for(source, target);
        if !relationship_ids.contains(&id) {
            relationship_ids.push(id);
        }
    }

    fn chunk_result_json(&self, chunk: &ChunkRecord) -> serde_json::Value {
        json!({
            "content": chunk.content,
            "doc_id": chunk.doc_id,
            "chunk_order_index": chunk.chunk_order_index,
            "source": chunk.source,
            "entity_id": self.entity_id,
            "node_id": self.node_id(&chunk.doc_id, chunk.chunk_order_index),
            "can_navigate": true,
        })
    }

    /// Dispatch one tool call against the bound entity store, tracking
    /// nodes/edges/services as a side effect. Returns the tool result to
    /// feed back to the model as a `tool` message, or a
    /// [`Error::ToolArguments`]/[`Error::ToolExecution`] for the caller to
    /// turn into a user-facing apology without crashing the loop.
    async fn dispatch_tool(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        node_ids: &mut Vec<String>,
        relationship_ids: &mut Vec<String>,
        services: &mut Vec<Service>,
    ) -> Result<String> {
        match name {
            "semantic_search_within_entity" => {
                let args: SearchArgs = serde_json::from_value(arguments.clone())
                    .map_err(|e| Error::tool_arguments(name, e.to_string()))?;

                let embedding = self
                    .embedder
                    .embed(&args.query)
                    .await
                    .map_err(|e| Error::tool_execution(name, e.to_string()))?;
                services.push(Service {
                    service_type: ServiceType::Transformer,
                    breakdown: json!({"query": args.query}),
                    estimated_cost_usd: 0.0,
                });

                let hits = self
                    .entity_store
                    .search(&embedding, args.k, &[])
                    .await
                    .map_err(|e| Error::tool_execution(name, e.to_string()))?;

                let mut results = Vec::with_capacity(hits.len());
                for hit in &hits {
                    let node_id = self.node_id(&hit.chunk.doc_id, hit.chunk.chunk_order_index);
                    Self::track_node(node_ids, node_id.clone());
                    let mut entry = self.chunk_result_json(&hit.chunk);
                    entry["score"] = json!(hit.score);
                    results.push(entry);
                }
                Ok(json!({"results": results}).to_string())
            }

            "get_previous_chunk" => {
                let args: ChunkRefArgs = serde_json::from_value(arguments.clone())
                    .map_err(|e| Error::tool_arguments(name, e.to_string()))?;

                let prev = self
                    .entity_store
                    .get_previous_chunk(&args.doc_id, args.chunk_order_index)
                    .await
                    .map_err(|e| Error::tool_execution(name, e.to_string()))?;

                match prev {
                    Some(chunk) => {
                        let current_id = self.node_id(&args.doc_id, args.chunk_order_index);
                        let prev_id = self.node_id(&chunk.doc_id, chunk.chunk_order_index);
                        Self::track_node(node_ids, current_id.clone());
                        Self::track_node(node_ids, prev_id.clone());
                        Self::track_edge(relationship_ids, &current_id, &prev_id);
                        Ok(self.chunk_result_json(&chunk).to_string())
                    }
                    None => Ok(json!({"found": false}).to_string()),
                }
            }

            "get_next_chunk" => {
                let args: ChunkRefArgs = serde_json::from_value(arguments.clone())
                    .map_err(|e| Error::tool_arguments(name, e.to_string()))?;

                let next = self
                    .entity_store
                    .get_next_chunk(&args.doc_id, args.chunk_order_index)
                    .await
                    .map_err(|e| Error::tool_execution(name, e.to_string()))?;

                match next {
                    Some(chunk) => {
                        let current_id = self.node_id(&args.doc_id, args.chunk_order_index);
                        let next_id = self.node_id(&chunk.doc_id, chunk.chunk_order_index);
                        Self::track_node(node_ids, current_id.clone());
                        Self::track_node(node_ids, next_id.clone());
                        Self::track_edge(relationship_ids, &current_id, &next_id);
                        Ok(self.chunk_result_json(&chunk).to_string())
                    }
                    None => Ok(json!({"found": false}).to_string()),
                }
            }

            "get_chunk_context" => {
                let args: ContextArgs = serde_json::from_value(arguments.clone())
                    .map_err(|e| Error::tool_arguments(name, e.to_string()))?;

                let ctx = self
                    .entity_store
                    .get_chunk_context(&args.doc_id, args.chunk_order_index, args.context_size)
                    .await
                    .map_err(|e| Error::tool_execution(name, e.to_string()))?;

                match ctx {
                    Some(ctx) => {
                        let current_id = self.node_id(&ctx.current.doc_id, ctx.current.chunk_order_index);
                        Self::track_node(node_ids, current_id.clone());
                        for neighbor in ctx.before.iter().chain(ctx.after.iter()) {
                            let neighbor_id = self.node_id(&neighbor.doc_id, neighbor.chunk_order_index);
                            Self::track_node(node_ids, neighbor_id.clone());
                            Self::track_edge(relationship_ids, &current_id, &neighbor_id);
                        }

                        Ok(json!({
                            "before": ctx.before.iter().map(|c| self.chunk_result_json(c)).collect::<Vec<_>>(),
                            "current": self.chunk_result_json(&ctx.current),
                            "after": ctx.after.iter().map(|c| self.chunk_result_json(c)).collect::<Vec<_>>(),
                        })
                        .to_string())
                    }
                    None => Ok(json!({"found": false}).to_string()),
                }
            }

            "get_entity_documents" => {
                let docs = self
                    .entity_store
                    .get_entity_documents()
                    .await
                    .map_err(|e| Error::tool_execution(name, e.to_string()))?;
                Ok(json!({"documents": docs}).to_string())
            }

            "get_document_chunks" => {
                let args: DocIdArgs = serde_json::from_value(arguments.clone())
                    .map_err(|e| Error::tool_arguments(name, e.to_string()))?;

                let all = self
                    .entity_store
                    .get_document_chunks_in_order(&args.doc_id)
                    .await
                    .map_err(|e| Error::tool_execution(name, e.to_string()))?;

                let shown: Vec<&ChunkRecord> = all.iter().take(10).collect();
                let mut previous_id: Option<String> = None;
                for chunk in &shown {
                    let node_id = self.node_id(&chunk.doc_id, chunk.chunk_order_index);
                    Self::track_node(node_ids, node_id.clone());
                    if let Some(prev) = &previous_id {
                        Self::track_edge(relationship_ids, prev, &node_id);
                    }
                    previous_id = Some(node_id);
                }

                let remaining = all.len().saturating_sub(shown.len());
                let mut body = json!({
                    "chunks": shown.iter().map(|c| self.chunk_result_json(c)).collect::<Vec<_>>(),
                });
                if remaining > 0 {
                    body["more"] = json!(format!("…{remaining} more"));
                }
                Ok(body.to_string())
            }

            other => Err(Error::tool_execution(other, "unknown tool")),
        }
    }

    /// Drive one full turn: stream a completion, dispatch any tool calls
    /// against the bound entity store, and recurse (as a loop) until the
    /// model stops calling tools or [`MAX_TOOL_HOPS`] is exceeded.
    /// `on_event` is invoked for every intermediate event; the return value
    /// is always the final (terminal) event.
    pub async fn run_turn(
        &self,
        mut transcript: Vec<Message>,
        mut on_event: impl FnMut(ResponseEvent),
    ) -> Result<ResponseEvent> {
        let mut node_ids = Vec::new();
        let mut relationship_ids = Vec::new();
        let mut services: Vec<Service> = Vec::new();
        let mut content_buffer = String::new();
        let mut hops = 0u32;

        loop {
            hops += 1;
            if hops > MAX_TOOL_HOPS {
                let terminal = ResponseEvent {
                    kind: ResponseEventKind::Terminal,
                    content: "I wasn't able to finish researching this within the allotted \
                              number of tool calls. Please narrow your question and try again."
                        .to_string(),
                    node_ids,
                    relationship_ids,
                    cited_node_ids: Vec::new(),
                    services_used: services,
                    estimated_cost_usd: 0.0,
                    citations: Vec::new(),
                };
                on_event(terminal.clone());
                return Ok(terminal);
            }

            let request = ChatRequest {
                model: self.model.clone(),
                system_prompt: Some(self.system_prompt()),
                messages: transcript.clone(),
                tools: self.tool_definitions(),
                temperature: Some(self.temperature),
                max_tokens: None,
                extra_params: None,
            };

            let mut stream = self.provider.stream_completion(request).await?;
            let mut turn_tool_calls: Vec<(usize, crate::agent::message::ToolCall)> = Vec::new();
            let mut usage: Option<(u64, u64, u64)> = None;

            while let Some(chunk) = stream.next().await {
                match chunk? {
                    StreamingChoice::Message(text) => {
                        content_buffer.push_str(&text);
                        on_event(ResponseEvent::delta(text));
                    }
                    StreamingChoice::ToolCall { id, name, arguments } => {
                        turn_tool_calls.push((
                            0,
                            crate::agent::message::ToolCall::new(id, name, arguments),
                        ));
                    }
                    StreamingChoice::ParallelToolCalls(map) => {
                        for (idx, call) in map {
                            turn_tool_calls.push((idx, call));
                        }
                    }
                    StreamingChoice::Thought(_) => {}
                    StreamingChoice::Usage {
                        prompt_tokens,
                        completion_tokens,
                        cached_tokens,
                    } => {
                        usage = Some((prompt_tokens, completion_tokens, cached_tokens));
                    }
                    StreamingChoice::Done => break,
                }
            }

            if !turn_tool_calls.is_empty() {
                turn_tool_calls.sort_by_key(|(idx, _)| *idx);

                let tool_call_parts: Vec<ContentPart> = turn_tool_calls
                    .iter()
                    .map(|(_, call)| ContentPart::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .collect();
                transcript.push(Message {
                    role: Role::Assistant,
                    content: Content::Parts(tool_call_parts),
                    name: None,
                });

                for (_, call) in &turn_tool_calls {
                    match self
                        .dispatch_tool(&call.name, &call.arguments, &mut node_ids, &mut relationship_ids, &mut services)
                        .await
                    {
                        Ok(result_json) => {
                            transcript.push(Message::tool_result(call.id.clone(), result_json).with_tool_name(call.name.clone()));
                        }
                        Err(err @ Error::ToolArguments { .. }) => {
                            let terminal = ResponseEvent {
                                kind: ResponseEventKind::Terminal,
                                content: "I couldn't understand the arguments for one of my \
                                          research tools, so I have to stop here. Could you \
                                          rephrase your question?"
                                    .to_string(),
                                node_ids,
                                relationship_ids,
                                cited_node_ids: Vec::new(),
                                services_used: services,
                                estimated_cost_usd: 0.0,
                                citations: Vec::new(),
                            };
                            on_event(terminal.clone());
                            tracing::warn!(%err, tool = %call.name, "tool argument parse failure, terminating turn");
                            return Ok(terminal);
                        }
                        Err(err) => {
                            tracing::warn!(%err, tool = %call.name, "tool execution failed");
                            transcript.push(
                                Message::tool_result(call.id.clone(), format!("error: {err}"))
                                    .with_tool_name(call.name.clone()),
                            );
                        }
                    }
                }

                on_event(ResponseEvent {
                    kind: ResponseEventKind::Update,
                    content: String::new(),
                    node_ids: node_ids.clone(),
                    relationship_ids: relationship_ids.clone(),
                    cited_node_ids: Vec::new(),
                    services_used: services.clone(),
                    estimated_cost_usd: 0.0,
                    citations: Vec::new(),
                });

                continue;
            }

            let (cited_node_ids, citations) = parse_citations(&content_buffer);
            let estimated_cost_usd = usage
                .map(|(pt, ct, cached)| cost::cost(&self.model, pt, ct, cached))
                .unwrap_or_else(|| {
                    cost::cost(&self.model, 0, cost::estimate_tokens_from_content(&content_buffer), 0)
                });

            if usage.is_some() {
                on_event(ResponseEvent {
                    kind: ResponseEventKind::Usage,
                    content: String::new(),
                    node_ids: node_ids.clone(),
                    relationship_ids: relationship_ids.clone(),
                    cited_node_ids: cited_node_ids.clone(),
                    services_used: services.clone(),
                    estimated_cost_usd,
                    citations: citations.clone(),
                });
            }

            let terminal = ResponseEvent {
                kind: ResponseEventKind::Terminal,
                content: content_buffer,
                node_ids,
                relationship_ids,
                cited_node_ids,
                services_used: services,
                estimated_cost_usd,
                citations,
            };
            on_event(terminal.clone());
            return Ok(terminal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn citation_parsing_dedupes_and_preserves_order() {
        let content = "Revenue was $50M [[1](e1_D_7)], up 25% [[2](e1_D_8)]. More at [[1](e1_D_7)].";
        let (cited, citations) = parse_citations(content);
        assert_eq!(cited, vec!["e1_D_7".to_string(), "e1_D_8".to_string()]);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].number, 1);
        assert_eq!(citations[1].number, 2);
    }

    #[test]
    fn no_citations_yields_empty() {
        let (cited, citations) = parse_citations("plain text, no markers here");
        assert!(cited.is_empty());
        assert!(citations.is_empty());
    }
}
