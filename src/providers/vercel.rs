//! Adapter for Vercel AI gateway deployments: ModelMessage conversion and
//! the UI-message event stream.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{ChatBackend, Usage};
use super::configs::{ConvertContext, VercelConfig};
use super::sse;
use super::stream::{AbortHandle, ChunkStream};
use super::utils::{
    attachment_text, image_allowed, image_reference_text, parse_flow_params, resolve_image,
    ImagePart,
};
use crate::errors::ProviderError;
use crate::models::chunk::{BlockStart, ChunkDelta, StreamChunk};
use crate::models::content::MessageContent;
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::Tool;

fn vercel_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert one canonical message to zero or more ModelMessages.
pub async fn message_to_vercel_spec(message: &Message, ctx: &ConvertContext<'_>) -> Vec<Value> {
    let role = vercel_role(message.role);

    if let Some(text) = message.as_plain_text() {
        return vec![json!({ "role": role, "content": text })];
    }

    let mut output = Vec::new();
    let mut parts: Vec<Value> = Vec::new();

    for content in &message.content {
        match content {
            MessageContent::Text { text } => {
                if !text.is_empty() {
                    parts.push(json!({ "type": "text", "text": text }));
                }
            }
            MessageContent::ImageUrl { url } => {
                if image_allowed(message.role, ctx) {
                    match resolve_image(url, ctx).await {
                        Some(ImagePart::Remote(remote)) => {
                            parts.push(json!({ "type": "image", "image": remote }));
                        }
                        Some(ImagePart::Inline { media_type, data }) => {
                            parts.push(json!({
                                "type": "image",
                                "image": format!("data:{media_type};base64,{data}"),
                            }));
                        }
                        None => {}
                    }
                }
                if ctx.options.reference_text() {
                    parts.push(json!({ "type": "text", "text": image_reference_text(url) }));
                }
            }
            MessageContent::File { .. }
            | MessageContent::Audio { .. }
            | MessageContent::Video { .. } => {
                let (kind, url) = content.as_attachment().unwrap();
                let text = attachment_text(kind, url, ctx).await;
                parts.push(json!({ "type": "text", "text": text }));
            }
            MessageContent::Thinking { thinking, .. } => {
                if ctx.capability.thinking {
                    parts.push(json!({ "type": "reasoning", "text": thinking }));
                }
            }
            MessageContent::FlowStep {
                flow_id,
                flow_name,
                flow_params,
                flow_results,
            } => {
                if !parts.is_empty() {
                    output.push(
                        json!({ "role": role, "content": parts.drain(..).collect::<Vec<_>>() }),
                    );
                }
                output.push(json!({
                    "role": "assistant",
                    "content": [{
                        "type": "tool-call",
                        "toolCallId": flow_id,
                        "toolName": flow_name,
                        "input": parse_flow_params(flow_params),
                    }]
                }));
                let result_text = flow_results
                    .iter()
                    .map(|result| result.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                output.push(json!({
                    "role": "tool",
                    "content": [{
                        "type": "tool-result",
                        "toolCallId": flow_id,
                        "toolName": flow_name,
                        "output": { "type": "text", "value": result_text },
                    }]
                }));
            }
            MessageContent::Other { .. } => {
                parts.push(json!({ "type": "text", "text": content.fallback_text() }));
            }
        }
    }

    if !parts.is_empty() {
        output.push(json!({ "role": role, "content": parts }));
    }
    output
}

/// Convert the full canonical message list, preserving input order.
pub async fn messages_to_vercel_spec(messages: &[Message], ctx: &ConvertContext<'_>) -> Vec<Value> {
    let converted = futures::future::join_all(
        messages
            .iter()
            .map(|message| message_to_vercel_spec(message, ctx)),
    )
    .await;
    converted.into_iter().flatten().collect()
}

/// Convert internal Tool format to the gateway's tool specification.
pub fn tools_to_vercel_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }
        result.push(json!({
            "type": "function",
            "name": tool.name,
            "description": tool.description,
            "inputSchema": tool.parameters,
        }));
    }

    Ok(result)
}

/// Convert a gateway response body to a canonical assistant message.
pub fn vercel_response_to_message(response: &Value) -> Result<Message> {
    let mut message = Message::assistant();

    if let Some(reasoning) = response.get("reasoning").and_then(|r| r.as_str()) {
        if !reasoning.is_empty() {
            message = message.with_thinking(reasoning, None);
        }
    }
    if let Some(text) = response.get("text").and_then(|t| t.as_str()) {
        if !text.is_empty() {
            message = message.with_text(text);
        }
    }
    if let Some(tool_calls) = response.get("toolCalls").and_then(|c| c.as_array()) {
        for tool_call in tool_calls {
            let id = tool_call["toolCallId"].as_str().unwrap_or_default();
            let name = tool_call["toolName"].as_str().unwrap_or_default();
            let input = tool_call.get("input").cloned().unwrap_or(json!({}));
            message = message.with_flow_step(id, name, input.to_string(), Vec::new());
        }
    }
    if message.content.is_empty() {
        return Err(anyhow!("Invalid response format from Vercel gateway"));
    }
    Ok(message)
}

enum VercelSpan {
    Text,
    Reasoning,
    Tool,
}

/// Normalize a gateway UI-message SSE stream into canonical chunks.
///
/// `text-delta` and `reasoning-delta` events open their span implicitly;
/// `tool-input-start`/`tool-input-delta`/`tool-input-end` carry the
/// incremental argument contract through unchanged.
pub fn vercel_chunks<S, B, E>(source: S, abort: AbortHandle) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let handle = abort.clone();
    let chunks = async_stream::try_stream! {
        let frames = sse::data_frames(source);
        futures::pin_mut!(frames);

        let mut started = false;
        let mut index: usize = 0;
        let mut open: Option<VercelSpan> = None;

        while let Some(frame) = frames.next().await {
            if abort.is_aborted() {
                return;
            }
            let frame = frame.map_err(|error| {
                abort.abort();
                error
            })?;
            if frame.trim() == "[DONE]" {
                break;
            }
            let event: Value = match serde_json::from_str(&frame) {
                Ok(event) => event,
                Err(error) => {
                    tracing::warn!("skipping undecodable stream event: {error}");
                    continue;
                }
            };

            if !started {
                started = true;
                yield StreamChunk::MessageStart;
            }

            let kind = event["type"].as_str().unwrap_or_default();

            // Any event that does not continue the current span closes it.
            let continues_span = matches!(
                (kind, &open),
                ("text-delta", Some(VercelSpan::Text))
                    | ("reasoning-delta", Some(VercelSpan::Reasoning))
                    | ("tool-input-delta", Some(VercelSpan::Tool))
            );
            if !continues_span && open.take().is_some() {
                yield StreamChunk::ContentBlockStop { index };
                index += 1;
            }

            match kind {
                "text-delta" => {
                    if open.is_none() {
                        open = Some(VercelSpan::Text);
                        yield StreamChunk::ContentBlockStart {
                            index,
                            block: BlockStart::Text,
                        };
                    }
                    let text = event["delta"].as_str().unwrap_or_default().to_string();
                    yield StreamChunk::ContentBlockDelta {
                        index,
                        delta: ChunkDelta::TextDelta { text },
                    };
                }
                "reasoning-delta" => {
                    if open.is_none() {
                        open = Some(VercelSpan::Reasoning);
                        yield StreamChunk::ContentBlockStart {
                            index,
                            block: BlockStart::Thinking,
                        };
                    }
                    let thinking = event["delta"].as_str().unwrap_or_default().to_string();
                    yield StreamChunk::ContentBlockDelta {
                        index,
                        delta: ChunkDelta::ThinkingDelta { thinking },
                    };
                }
                "tool-input-start" => {
                    open = Some(VercelSpan::Tool);
                    yield StreamChunk::ContentBlockStart {
                        index,
                        block: BlockStart::ToolUse {
                            id: event["toolCallId"].as_str().unwrap_or_default().to_string(),
                            name: event["toolName"].as_str().unwrap_or_default().to_string(),
                        },
                    };
                }
                "tool-input-delta" => {
                    let partial_json = event["inputTextDelta"]
                        .as_str()
                        .or_else(|| event["delta"].as_str())
                        .unwrap_or_default()
                        .to_string();
                    yield StreamChunk::ContentBlockDelta {
                        index,
                        delta: ChunkDelta::InputJsonDelta { partial_json },
                    };
                }
                "tool-input-end" => {
                    // Close already handled above.
                }
                "finish" => break,
                "error" => {
                    abort.abort();
                    Err(anyhow!("Vercel stream error: {}", event["errorText"]))?;
                }
                _ => {}
            }
        }

        if open.is_some() {
            yield StreamChunk::ContentBlockStop { index };
        }
    };
    ChunkStream::new(chunks, handle)
}

pub struct VercelProvider {
    client: Client,
    config: VercelConfig,
}

impl VercelProvider {
    pub fn new(config: VercelConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(ProviderError::Configuration("missing Vercel host".to_string()).into());
        }
        if config.api_key.is_empty() {
            return Err(ProviderError::Configuration("missing Vercel API key".to_string()).into());
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Usage {
        let usage = &data["usage"];
        let input_tokens = usage
            .get("inputTokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);
        let output_tokens = usage
            .get("outputTokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);
        let total_tokens = usage
            .get("totalTokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);
        Usage::new(input_tokens, output_tokens, total_tokens)
    }

    async fn build_payload(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        ctx: &ConvertContext<'_>,
    ) -> Result<Value> {
        let mut payload = json!({
            "model": ctx.capability.value,
            "messages": messages_to_vercel_spec(messages, ctx).await,
        });

        if !system.is_empty() {
            payload["system"] = json!(system);
        }
        if !tools.is_empty() && ctx.capability.tool_use {
            payload["tools"] = json!(tools_to_vercel_spec(tools)?);
            payload["parallel_tool_calls"] = json!(false);
        }
        if let Some(temp) = ctx.options.temperature {
            payload["temperature"] = json!(temp);
        }
        if let Some(max_tokens) = ctx.options.max_tokens {
            payload["maxOutputTokens"] = json!(max_tokens);
        }
        Ok(payload)
    }

    async fn post(&self, path: &str, payload: Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.config.host.trim_end_matches('/'), path);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Transport {
                    status: status.as_u16(),
                    body,
                }
                .into())
            }
        }
    }
}

#[async_trait]
impl ChatBackend for VercelProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        ctx: &ConvertContext<'_>,
    ) -> Result<(Message, Usage)> {
        let payload = self.build_payload(system, messages, tools, ctx).await?;
        let response: Value = self.post("/v1/generate", payload).await?.json().await?;

        let message = vercel_response_to_message(&response)?;
        let usage = Self::get_usage(&response);

        Ok((message, usage))
    }

    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        ctx: &ConvertContext<'_>,
    ) -> Result<ChunkStream> {
        let payload = self.build_payload(system, messages, tools, ctx).await?;
        let response = self.post("/v1/stream", payload).await?;
        Ok(vercel_chunks(response.bytes_stream(), AbortHandle::new()))
    }
}
