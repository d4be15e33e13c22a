//! Adapter for OpenAI's chat completions API and the many compatible
//! endpoints (Groq, Mistral, DeepSeek, Together, OpenRouter, ...): callers
//! pick the host, the wire format is the same.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{ChatBackend, Usage};
use super::configs::{ConvertContext, OpenAiConfig};
use super::sse;
use super::stream::{AbortHandle, ChunkStream};
use super::utils::{
    attachment_text, check_openai_context_length_error, image_allowed, image_reference_text,
    openai_response_to_message, resolve_image, sanitize_function_name, ImagePart,
};
use crate::errors::ProviderError;
use crate::models::chunk::{BlockStart, ChunkDelta, StreamChunk};
use crate::models::content::MessageContent;
use crate::models::message::Message;
use crate::models::tool::Tool;

pub const OPENAI_HOST: &str = "https://api.openai.com";

/// Convert one canonical message to zero or more OpenAI-style messages.
///
/// Plain parts accumulate into a running buffer; every flow step first
/// flushes the buffer, then emits its tool-call/tool-result pair as two
/// further messages. The pair is never separated or reordered.
pub async fn message_to_openai_spec(message: &Message, ctx: &ConvertContext<'_>) -> Vec<Value> {
    let role = message.role.as_str();

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
                            parts.push(json!({
                                "type": "image_url",
                                "image_url": { "url": remote }
                            }));
                        }
                        Some(ImagePart::Inline { media_type, data }) => {
                            parts.push(json!({
                                "type": "image_url",
                                "image_url": {
                                    "url": format!("data:{};base64,{}", media_type, data)
                                }
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
                    parts.push(json!({ "type": "text", "text": thinking }));
                }
            }
            MessageContent::FlowStep {
                flow_id,
                flow_name,
                flow_params,
                flow_results,
            } => {
                flush_parts(role, &mut parts, &mut output);
                output.push(json!({
                    "role": "assistant",
                    "tool_calls": [{
                        "id": flow_id,
                        "type": "function",
                        "function": {
                            "name": sanitize_function_name(flow_name),
                            "arguments": flow_params,
                        }
                    }]
                }));
                let result_text = flow_results
                    .iter()
                    .map(|result| result.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                output.push(json!({
                    "role": "tool",
                    "tool_call_id": flow_id,
                    "content": result_text,
                }));
            }
            MessageContent::Other { .. } => {
                parts.push(json!({ "type": "text", "text": content.fallback_text() }));
            }
        }
    }

    flush_parts(role, &mut parts, &mut output);
    output
}

fn flush_parts(role: &str, parts: &mut Vec<Value>, output: &mut Vec<Value>) {
    if parts.is_empty() {
        return;
    }
    let drained: Vec<Value> = parts.drain(..).collect();
    // A lone text part collapses to plain string content.
    let content = match drained.as_slice() {
        [only] if only["type"] == "text" => only["text"].clone(),
        _ => json!(drained),
    };
    output.push(json!({ "role": role, "content": content }));
}

/// Convert the full canonical message list. Messages are converted
/// concurrently and joined positionally, so input order is preserved.
pub async fn messages_to_openai_spec(
    messages: &[Message],
    ctx: &ConvertContext<'_>,
) -> Vec<Value> {
    let converted = futures::future::join_all(
        messages
            .iter()
            .map(|message| message_to_openai_spec(message, ctx)),
    )
    .await;
    converted.into_iter().flatten().collect()
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        let mut function = json!({
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        });
        if let Some(strict) = tool.strict {
            function["strict"] = json!(strict);
        }
        result.push(json!({ "type": "function", "function": function }));
    }

    Ok(result)
}

enum OpenSpan {
    Text,
    Tool(u64),
}

/// Normalize an OpenAI-style SSE byte stream into canonical chunks.
///
/// Text and tool-argument fragments arrive as `choices[0].delta`; block
/// lifecycle events are synthesized since the wire format has none.
pub fn openai_chunks<S, B, E>(source: S, abort: AbortHandle) -> ChunkStream
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
        let mut open: Option<OpenSpan> = None;

        while let Some(frame) = frames.next().await {
            if abort.is_aborted() {
                return;
            }
            let frame = frame.map_err(|error| {
                abort.abort();
                error
            })?;
            if frame == "[DONE]" {
                break;
            }
            let value: Value = match serde_json::from_str(&frame) {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!("skipping undecodable stream frame: {error}");
                    continue;
                }
            };

            if !started {
                started = true;
                yield StreamChunk::MessageStart;
            }

            let delta = &value["choices"][0]["delta"];

            if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                if !text.is_empty() {
                    if matches!(open, Some(OpenSpan::Tool(_))) {
                        yield StreamChunk::ContentBlockStop { index };
                        index += 1;
                        open = None;
                    }
                    if open.is_none() {
                        open = Some(OpenSpan::Text);
                        yield StreamChunk::ContentBlockStart {
                            index,
                            block: BlockStart::Text,
                        };
                    }
                    yield StreamChunk::ContentBlockDelta {
                        index,
                        delta: ChunkDelta::TextDelta { text: text.to_string() },
                    };
                }
            }

            if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
                for call in calls {
                    let provider_index = call["index"].as_u64().unwrap_or(0);
                    let same_span =
                        matches!(open, Some(OpenSpan::Tool(open_index)) if open_index == provider_index);
                    if !same_span {
                        if open.is_some() {
                            yield StreamChunk::ContentBlockStop { index };
                            index += 1;
                        }
                        let id = call["id"].as_str().unwrap_or_default().to_string();
                        let name = call["function"]["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        open = Some(OpenSpan::Tool(provider_index));
                        yield StreamChunk::ContentBlockStart {
                            index,
                            block: BlockStart::ToolUse { id, name },
                        };
                    }
                    if let Some(arguments) = call["function"]["arguments"].as_str() {
                        if !arguments.is_empty() {
                            yield StreamChunk::ContentBlockDelta {
                                index,
                                delta: ChunkDelta::InputJsonDelta {
                                    partial_json: arguments.to_string(),
                                },
                            };
                        }
                    }
                }
            }

            if value["choices"][0]
                .get("finish_reason")
                .and_then(|f| f.as_str())
                .is_some()
                && open.take().is_some()
            {
                yield StreamChunk::ContentBlockStop { index };
                index += 1;
            }
        }

        if open.is_some() {
            yield StreamChunk::ContentBlockStop { index };
        }
    };
    ChunkStream::new(chunks, handle)
}

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(ProviderError::Configuration("missing OpenAI API key".to_string()).into());
        }
        if config.host.is_empty() {
            return Err(ProviderError::Configuration("missing OpenAI base URL".to_string()).into());
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Usage {
        let usage = &data["usage"];

        let input_tokens = usage
            .get("prompt_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let output_tokens = usage
            .get("completion_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let total_tokens = usage
            .get("total_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
            .or_else(|| match (input_tokens, output_tokens) {
                (Some(input), Some(output)) => Some(input + output),
                _ => None,
            });

        Usage::new(input_tokens, output_tokens, total_tokens)
    }

    async fn build_payload(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        ctx: &ConvertContext<'_>,
    ) -> Result<Value> {
        let mut messages_array = Vec::new();
        if !system.is_empty() {
            // Models without system-message support get it as a user turn.
            let role = if ctx.capability.system_message_enable {
                "system"
            } else {
                "user"
            };
            messages_array.push(json!({ "role": role, "content": system }));
        }
        messages_array.extend(messages_to_openai_spec(messages, ctx).await);

        let mut payload = json!({
            "model": ctx.capability.value,
            "messages": messages_array,
        });

        if !tools.is_empty() && ctx.capability.tool_use {
            payload["tools"] = json!(tools_to_openai_spec(tools)?);
            // Pinned to false whenever tools are present; observed upstream
            // behavior, preserved as-is.
            payload["parallel_tool_calls"] = json!(false);
        }
        if let Some(temp) = ctx.options.temperature {
            payload["temperature"] = json!(temp);
        }
        if let Some(tokens) = ctx.options.max_tokens {
            payload["max_tokens"] = json!(tokens);
        }
        Ok(payload)
    }

    async fn post(&self, payload: Value) -> Result<reqwest::Response> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

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
impl ChatBackend for OpenAiProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        ctx: &ConvertContext<'_>,
    ) -> Result<(Message, Usage)> {
        let payload = self.build_payload(system, messages, tools, ctx).await?;
        let response: Value = self.post(payload).await?.json().await?;

        if let Some(error) = response.get("error") {
            if let Some(err) = check_openai_context_length_error(error) {
                return Err(err.into());
            }
            return Err(anyhow!("OpenAI API error: {}", error));
        }

        let message = openai_response_to_message(&response)?;
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
        Ok(openai_chunks(response.bytes_stream(), AbortHandle::new()))
    }
}
