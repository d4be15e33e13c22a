//! Adapter for Anthropic's messages API: content-block conversion, the
//! message-list clamp pass, and the 1:1 streaming-event mapping.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{ChatBackend, Usage};
use super::configs::{AnthropicConfig, ConvertContext};
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

pub const ANTHROPIC_HOST: &str = "https://api.anthropic.com";

/// At most this many blocks keep their cache marker; older markers are
/// cleared first.
pub const MAX_CACHE_MARKERS: usize = 2;

/// Sliding window over the assembled native message list.
pub const MESSAGE_WINDOW: usize = 20;

fn anthropic_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "assistant",
        // System content travels in the top-level `system` field; stray
        // system/tool turns in the list are downgraded to user turns.
        Role::System | Role::User | Role::Tool => "user",
    }
}

/// Convert one canonical message to zero or more Anthropic messages.
pub async fn message_to_anthropic_spec(message: &Message, ctx: &ConvertContext<'_>) -> Vec<Value> {
    let role = anthropic_role(message.role);

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
                    // Only local files are embedded; remote URLs fall back to
                    // the reference line.
                    if let Some(ImagePart::Inline { media_type, data }) =
                        resolve_image(url, ctx).await
                    {
                        parts.push(json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": media_type,
                                "data": data,
                            }
                        }));
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
            MessageContent::Thinking {
                thinking,
                signature,
            } => {
                if ctx.capability.thinking {
                    parts.push(json!({
                        "type": "thinking",
                        "thinking": thinking,
                        "signature": signature.clone().unwrap_or_default(),
                    }));
                }
            }
            MessageContent::FlowStep {
                flow_id,
                flow_name,
                flow_params,
                flow_results,
            } => {
                if !parts.is_empty() {
                    output.push(json!({ "role": role, "content": parts.drain(..).collect::<Vec<_>>() }));
                }
                output.push(json!({
                    "role": "assistant",
                    "content": [{
                        "type": "tool_use",
                        "id": flow_id,
                        "name": flow_name,
                        "input": parse_flow_params(flow_params),
                    }]
                }));
                let result_text = flow_results
                    .iter()
                    .map(|result| result.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                // Tool results are the large recurring blocks; mark them
                // cacheable and let assembly cap the markers.
                output.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": flow_id,
                        "content": result_text,
                        "cache_control": { "type": "ephemeral" },
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
pub async fn messages_to_anthropic_spec(
    messages: &[Message],
    ctx: &ConvertContext<'_>,
) -> Vec<Value> {
    let converted = futures::future::join_all(
        messages
            .iter()
            .map(|message| message_to_anthropic_spec(message, ctx)),
    )
    .await;
    converted.into_iter().flatten().collect()
}

/// Normalization pass over the converted message list, run once per request
/// before dispatch:
/// - empty messages are dropped
/// - a single text block collapses to plain string content
/// - cache markers are capped at [`MAX_CACHE_MARKERS`], oldest cleared first
/// - the list is truncated to the most recent [`MESSAGE_WINDOW`] entries
/// - a leading user message starting with a tool result is dropped, so a
///   request never begins mid-tool-exchange
pub fn assemble_anthropic_messages(mut messages: Vec<Value>) -> Vec<Value> {
    messages.retain(|message| match &message["content"] {
        Value::String(text) => !text.is_empty(),
        Value::Array(blocks) => !blocks.is_empty(),
        _ => false,
    });

    for message in &mut messages {
        let collapsed = match message["content"].as_array() {
            Some(blocks)
                if blocks.len() == 1
                    && blocks[0]["type"] == "text"
                    && blocks[0].get("cache_control").is_none() =>
            {
                Some(blocks[0]["text"].clone())
            }
            _ => None,
        };
        if let Some(text) = collapsed {
            message["content"] = text;
        }
    }

    let mut marked = Vec::new();
    for (message_index, message) in messages.iter().enumerate() {
        if let Some(blocks) = message["content"].as_array() {
            for (block_index, block) in blocks.iter().enumerate() {
                if block.get("cache_control").is_some() {
                    marked.push((message_index, block_index));
                }
            }
        }
    }
    if marked.len() > MAX_CACHE_MARKERS {
        let excess = marked.len() - MAX_CACHE_MARKERS;
        for (message_index, block_index) in marked.into_iter().take(excess) {
            if let Some(block) = messages[message_index]["content"].get_mut(block_index) {
                if let Some(object) = block.as_object_mut() {
                    object.remove("cache_control");
                }
            }
        }
    }

    if messages.len() > MESSAGE_WINDOW {
        let overflow = messages.len() - MESSAGE_WINDOW;
        messages.drain(..overflow);
    }

    let drop_leading = messages.first().is_some_and(|first| {
        first["role"] == "user"
            && first["content"]
                .as_array()
                .and_then(|blocks| blocks.first())
                .is_some_and(|block| block["type"] == "tool_result")
    });
    if drop_leading {
        messages.remove(0);
    }

    messages
}

/// Convert internal Tool format to Anthropic's tool specification
pub fn tools_to_anthropic_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }
        result.push(json!({
            "name": tool.name,
            "description": tool.description,
            "input_schema": tool.parameters,
        }));
    }

    Ok(result)
}

/// Convert an Anthropic response body to a canonical assistant message.
pub fn anthropic_response_to_message(response: &Value) -> Result<Message> {
    let blocks = response
        .get("content")
        .and_then(|content| content.as_array())
        .ok_or_else(|| anyhow!("Invalid response format from Anthropic API"))?;

    let mut message = Message::assistant();
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(text) = block["text"].as_str() {
                    message = message.with_text(text);
                }
            }
            Some("thinking") => {
                let thinking = block["thinking"].as_str().unwrap_or_default();
                let signature = block["signature"].as_str().map(String::from);
                message = message.with_thinking(thinking, signature);
            }
            Some("tool_use") => {
                let id = block["id"].as_str().unwrap_or_default();
                let name = block["name"].as_str().unwrap_or_default();
                let params = block.get("input").cloned().unwrap_or(json!({}));
                message = message.with_flow_step(id, name, params.to_string(), Vec::new());
            }
            _ => {
                tracing::warn!("unrecognized response block, degrading: {block}");
                message = message.with_content(MessageContent::Other {
                    data: block.clone(),
                });
            }
        }
    }
    Ok(message)
}

/// Normalize an Anthropic SSE byte stream into canonical chunks.
///
/// The native event taxonomy already matches the canonical one, so the
/// mapping is 1:1; `ping` and unknown event types are skipped.
pub fn anthropic_chunks<S, B, E>(source: S, abort: AbortHandle) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let handle = abort.clone();
    let chunks = async_stream::try_stream! {
        let frames = sse::data_frames(source);
        futures::pin_mut!(frames);

        while let Some(frame) = frames.next().await {
            if abort.is_aborted() {
                return;
            }
            let frame = frame.map_err(|error| {
                abort.abort();
                error
            })?;
            let event: Value = match serde_json::from_str(&frame) {
                Ok(event) => event,
                Err(error) => {
                    tracing::warn!("skipping undecodable stream event: {error}");
                    continue;
                }
            };

            match event["type"].as_str() {
                Some("message_start") => yield StreamChunk::MessageStart,
                Some("content_block_start") => {
                    let index = event["index"].as_u64().unwrap_or(0) as usize;
                    let native = &event["content_block"];
                    let block = match native["type"].as_str() {
                        Some("tool_use") => BlockStart::ToolUse {
                            id: native["id"].as_str().unwrap_or_default().to_string(),
                            name: native["name"].as_str().unwrap_or_default().to_string(),
                        },
                        Some("thinking") => BlockStart::Thinking,
                        _ => BlockStart::Text,
                    };
                    yield StreamChunk::ContentBlockStart { index, block };
                }
                Some("content_block_delta") => {
                    let index = event["index"].as_u64().unwrap_or(0) as usize;
                    let native = &event["delta"];
                    let delta = match native["type"].as_str() {
                        Some("text_delta") => Some(ChunkDelta::TextDelta {
                            text: native["text"].as_str().unwrap_or_default().to_string(),
                        }),
                        Some("thinking_delta") => Some(ChunkDelta::ThinkingDelta {
                            thinking: native["thinking"].as_str().unwrap_or_default().to_string(),
                        }),
                        Some("signature_delta") => Some(ChunkDelta::SignatureDelta {
                            signature: native["signature"].as_str().unwrap_or_default().to_string(),
                        }),
                        Some("input_json_delta") => Some(ChunkDelta::InputJsonDelta {
                            partial_json: native["partial_json"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string(),
                        }),
                        _ => None,
                    };
                    if let Some(delta) = delta {
                        yield StreamChunk::ContentBlockDelta { index, delta };
                    }
                }
                Some("content_block_stop") => {
                    let index = event["index"].as_u64().unwrap_or(0) as usize;
                    yield StreamChunk::ContentBlockStop { index };
                }
                Some("message_stop") => break,
                Some("error") => {
                    abort.abort();
                    Err(anyhow!("Anthropic stream error: {}", event["error"]))?;
                }
                _ => {} // ping and future event types
            }
        }
    };
    ChunkStream::new(chunks, handle)
}

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(
                ProviderError::Configuration("missing Anthropic API key".to_string()).into(),
            );
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Usage {
        let usage = &data["usage"];
        let input_tokens = usage
            .get("input_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);
        let output_tokens = usage
            .get("output_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);
        let total_tokens = match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        };
        Usage::new(input_tokens, output_tokens, total_tokens)
    }

    async fn build_payload(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        ctx: &ConvertContext<'_>,
    ) -> Result<Value> {
        let converted = messages_to_anthropic_spec(messages, ctx).await;
        let assembled = assemble_anthropic_messages(converted);

        let max_tokens = ctx
            .options
            .max_tokens
            .unwrap_or(ctx.capability.max_tokens as i32);
        let mut payload = json!({
            "model": ctx.capability.value,
            "messages": assembled,
            "max_tokens": max_tokens,
        });

        if !system.is_empty() {
            payload["system"] = json!(system);
        }
        if !tools.is_empty() && ctx.capability.tool_use {
            payload["tools"] = json!(tools_to_anthropic_spec(tools)?);
        }
        if let Some(temp) = ctx.options.temperature {
            payload["temperature"] = json!(temp);
        }
        Ok(payload)
    }

    async fn post(&self, payload: Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2024-02-01")
            .header("anthropic-beta", "messages-2024-02-01-preview")
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
impl ChatBackend for AnthropicProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        ctx: &ConvertContext<'_>,
    ) -> Result<(Message, Usage)> {
        let payload = self.build_payload(system, messages, tools, ctx).await?;
        let response: Value = self.post(payload).await?.json().await?;

        let message = anthropic_response_to_message(&response)?;
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
        let mut payload = self.build_payload(system, messages, tools, ctx).await?;
        payload["stream"] = json!(true);

        let response = self.post(payload).await?;
        Ok(anthropic_chunks(response.bytes_stream(), AbortHandle::new()))
    }
}
