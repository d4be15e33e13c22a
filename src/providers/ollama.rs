//! Adapter for Ollama's native chat API. Local deployment, no auth; the
//! stream is newline-delimited JSON with a raw-text-line fallback.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{ChatBackend, Usage};
use super::configs::{ConvertContext, OllamaConfig};
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

pub const OLLAMA_HOST: &str = "http://localhost:11434";

fn ollama_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn flush_native(role: &str, texts: &mut Vec<String>, images: &mut Vec<String>) -> Option<Value> {
    if texts.is_empty() && images.is_empty() {
        return None;
    }
    let mut native = json!({
        "role": role,
        "content": texts.drain(..).collect::<Vec<_>>().join("\n"),
    });
    if !images.is_empty() {
        native["images"] = json!(images.drain(..).collect::<Vec<_>>());
    }
    Some(native)
}

/// Convert one canonical message to zero or more Ollama chat messages.
/// Content is a plain string; images travel in a separate base64 array.
pub async fn message_to_ollama_spec(message: &Message, ctx: &ConvertContext<'_>) -> Vec<Value> {
    let role = ollama_role(message.role);

    if let Some(text) = message.as_plain_text() {
        return vec![json!({ "role": role, "content": text })];
    }

    let mut output = Vec::new();
    let mut texts: Vec<String> = Vec::new();
    let mut images: Vec<String> = Vec::new();

    for content in &message.content {
        match content {
            MessageContent::Text { text } => {
                if !text.is_empty() {
                    texts.push(text.clone());
                }
            }
            MessageContent::ImageUrl { url } => {
                if image_allowed(message.role, ctx) {
                    // Only local files can be embedded; Ollama takes bare
                    // base64, no media type.
                    if let Some(ImagePart::Inline { data, .. }) = resolve_image(url, ctx).await {
                        images.push(data);
                    }
                }
                if ctx.options.reference_text() {
                    texts.push(image_reference_text(url));
                }
            }
            MessageContent::File { .. }
            | MessageContent::Audio { .. }
            | MessageContent::Video { .. } => {
                let (kind, url) = content.as_attachment().unwrap();
                texts.push(attachment_text(kind, url, ctx).await);
            }
            MessageContent::Thinking { thinking, .. } => {
                if ctx.capability.thinking {
                    texts.push(thinking.clone());
                }
            }
            MessageContent::FlowStep {
                flow_name,
                flow_params,
                flow_results,
                ..
            } => {
                if let Some(native) = flush_native(role, &mut texts, &mut images) {
                    output.push(native);
                }
                output.push(json!({
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{
                        "function": {
                            "name": flow_name,
                            "arguments": parse_flow_params(flow_params),
                        }
                    }]
                }));
                let result_text = flow_results
                    .iter()
                    .map(|result| result.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                output.push(json!({ "role": "tool", "content": result_text }));
            }
            MessageContent::Other { .. } => {
                texts.push(content.fallback_text());
            }
        }
    }

    if let Some(native) = flush_native(role, &mut texts, &mut images) {
        output.push(native);
    }
    output
}

/// Convert the full canonical message list, preserving input order.
pub async fn messages_to_ollama_spec(messages: &[Message], ctx: &ConvertContext<'_>) -> Vec<Value> {
    let converted = futures::future::join_all(
        messages
            .iter()
            .map(|message| message_to_ollama_spec(message, ctx)),
    )
    .await;
    converted.into_iter().flatten().collect()
}

/// Convert internal Tool format to Ollama's (OpenAI-shaped) tool spec.
pub fn tools_to_ollama_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }
        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }
        }));
    }

    Ok(result)
}

/// Convert an Ollama response body to a canonical assistant message.
pub fn ollama_response_to_message(response: &Value) -> Result<Message> {
    let native = response
        .get("message")
        .ok_or_else(|| anyhow!("Invalid response format from Ollama API"))?;

    let mut message = Message::assistant();
    if let Some(text) = native.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            message = message.with_text(text);
        }
    }
    if let Some(tool_calls) = native.get("tool_calls").and_then(|c| c.as_array()) {
        for tool_call in tool_calls {
            let name = tool_call["function"]["name"].as_str().unwrap_or_default();
            let args = tool_call["function"]
                .get("arguments")
                .cloned()
                .unwrap_or(json!({}));
            // Ollama does not assign call ids; mint one for pairing.
            let id = format!("call_{}", uuid::Uuid::new_v4().simple());
            message = message.with_flow_step(id, name, args.to_string(), Vec::new());
        }
    }
    Ok(message)
}

/// Normalize an Ollama newline-delimited JSON stream into canonical chunks.
///
/// A line that is not JSON is treated as raw model text: the first non-empty
/// one synthesizes the implicit block start, and the block closes when the
/// transport does.
pub fn ollama_chunks<S, B, E>(source: S, abort: AbortHandle) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let handle = abort.clone();
    let chunks = async_stream::try_stream! {
        let lines = sse::lines(source);
        futures::pin_mut!(lines);

        let mut started = false;
        let mut index: usize = 0;
        let mut text_open = false;

        while let Some(line) = lines.next().await {
            if abort.is_aborted() {
                return;
            }
            let line = line.map_err(|error| {
                abort.abort();
                error
            })?;
            if line.trim().is_empty() {
                continue;
            }
            if !started {
                started = true;
                yield StreamChunk::MessageStart;
            }

            let value: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(_) => {
                    // Raw-text-line mode: the line itself is the delta.
                    if !text_open {
                        text_open = true;
                        yield StreamChunk::ContentBlockStart {
                            index,
                            block: BlockStart::Text,
                        };
                    }
                    yield StreamChunk::ContentBlockDelta {
                        index,
                        delta: ChunkDelta::TextDelta { text: line },
                    };
                    continue;
                }
            };

            if let Some(text) = value["message"]["content"].as_str() {
                if !text.is_empty() {
                    if !text_open {
                        text_open = true;
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

            if let Some(tool_calls) = value["message"]["tool_calls"].as_array() {
                for tool_call in tool_calls {
                    if text_open {
                        text_open = false;
                        yield StreamChunk::ContentBlockStop { index };
                        index += 1;
                    }
                    let name = tool_call["function"]["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    let id = format!("call_{}", uuid::Uuid::new_v4().simple());
                    let args = tool_call["function"]
                        .get("arguments")
                        .cloned()
                        .unwrap_or(json!({}));
                    yield StreamChunk::ContentBlockStart {
                        index,
                        block: BlockStart::ToolUse { id, name },
                    };
                    yield StreamChunk::ContentBlockDelta {
                        index,
                        delta: ChunkDelta::InputJsonDelta {
                            partial_json: args.to_string(),
                        },
                    };
                    yield StreamChunk::ContentBlockStop { index };
                    index += 1;
                }
            }

            if value["done"].as_bool() == Some(true) {
                break;
            }
        }

        if text_open {
            yield StreamChunk::ContentBlockStop { index };
        }
    };
    ChunkStream::new(chunks, handle)
}

pub struct OllamaProvider {
    client: Client,
    config: OllamaConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(ProviderError::Configuration("missing Ollama host".to_string()).into());
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Usage {
        let input_tokens = data
            .get("prompt_eval_count")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);
        let output_tokens = data
            .get("eval_count")
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
        let mut native_messages = Vec::new();
        if !system.is_empty() {
            native_messages.push(json!({ "role": "system", "content": system }));
        }
        native_messages.extend(messages_to_ollama_spec(messages, ctx).await);

        let mut payload = json!({
            "model": ctx.capability.value,
            "messages": native_messages,
        });

        if !tools.is_empty() && ctx.capability.tool_use {
            payload["tools"] = json!(tools_to_ollama_spec(tools)?);
        }

        let mut options = serde_json::Map::new();
        if let Some(temp) = ctx.options.temperature {
            options.insert("temperature".to_string(), json!(temp));
        }
        if let Some(max_tokens) = ctx.options.max_tokens {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }
        if !options.is_empty() {
            payload["options"] = Value::Object(options);
        }
        Ok(payload)
    }

    async fn post(&self, payload: Value) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.config.host.trim_end_matches('/'));

        let response = self.client.post(&url).json(&payload).send().await?;

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
impl ChatBackend for OllamaProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        ctx: &ConvertContext<'_>,
    ) -> Result<(Message, Usage)> {
        let mut payload = self.build_payload(system, messages, tools, ctx).await?;
        payload["stream"] = json!(false);

        let response: Value = self.post(payload).await?.json().await?;
        let message = ollama_response_to_message(&response)?;
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
        Ok(ollama_chunks(response.bytes_stream(), AbortHandle::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::capability::ModelCapability;
    use crate::models::content::FlowResult;
    use crate::providers::configs::RequestOptions;
    use std::convert::Infallible;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_string_shortcut() {
        let capability = ModelCapability::fallback("llama3.2");
        let options = RequestOptions::default();
        let ctx = ConvertContext::new(&capability, &options);

        let message = Message::user().with_text("Hello");
        let spec = message_to_ollama_spec(&message, &ctx).await;
        assert_eq!(spec, vec![json!({"role": "user", "content": "Hello"})]);
    }

    #[tokio::test]
    async fn test_flow_step_pair_order() {
        let capability = ModelCapability::fallback("llama3.2");
        let options = RequestOptions::default();
        let ctx = ConvertContext::new(&capability, &options);

        let message = Message::assistant().with_text("checking").with_flow_step(
            "call_1",
            "get_weather",
            r#"{"location":"SF"}"#,
            vec![FlowResult::new("Sunny")],
        );
        let spec = message_to_ollama_spec(&message, &ctx).await;

        assert_eq!(spec.len(), 3);
        assert_eq!(spec[0], json!({"role": "assistant", "content": "checking"}));
        assert_eq!(
            spec[1]["tool_calls"][0]["function"]["arguments"],
            json!({"location": "SF"})
        );
        assert_eq!(spec[2], json!({"role": "tool", "content": "Sunny"}));
    }

    #[tokio::test]
    async fn test_multiple_texts_joined() {
        let capability = ModelCapability::fallback("llama3.2");
        let options = RequestOptions::default();
        let ctx = ConvertContext::new(&capability, &options);

        let message = Message::user().with_text("a").with_text("b");
        let spec = message_to_ollama_spec(&message, &ctx).await;
        assert_eq!(spec, vec![json!({"role": "user", "content": "a\nb"})]);
    }

    fn line_source(
        lines: Vec<String>,
    ) -> impl Stream<Item = std::result::Result<Vec<u8>, Infallible>> {
        futures::stream::iter(
            lines
                .into_iter()
                .map(|line| Ok(format!("{line}\n").into_bytes())),
        )
    }

    #[tokio::test]
    async fn test_ollama_chunks_ndjson() {
        let lines = vec![
            json!({"message": {"content": "Hel"}, "done": false}).to_string(),
            json!({"message": {"content": "lo"}, "done": false}).to_string(),
            json!({"message": {"content": ""}, "done": true}).to_string(),
        ];
        let mut stream = ollama_chunks(line_source(lines), AbortHandle::new());
        let chunks: Vec<_> = stream
            .consume()
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        assert_eq!(
            chunks,
            vec![
                StreamChunk::MessageStart,
                StreamChunk::ContentBlockStart {
                    index: 0,
                    block: BlockStart::Text
                },
                StreamChunk::ContentBlockDelta {
                    index: 0,
                    delta: ChunkDelta::TextDelta {
                        text: "Hel".to_string()
                    }
                },
                StreamChunk::ContentBlockDelta {
                    index: 0,
                    delta: ChunkDelta::TextDelta {
                        text: "lo".to_string()
                    }
                },
                StreamChunk::ContentBlockStop { index: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn test_ollama_chunks_raw_text_lines() {
        let lines = vec!["".to_string(), "first".to_string(), "second".to_string()];
        let mut stream = ollama_chunks(line_source(lines), AbortHandle::new());
        let chunks: Vec<_> = stream
            .consume()
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        // The implicit block opens on the first non-empty line and closes at
        // transport close.
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0], StreamChunk::MessageStart);
        assert_eq!(
            chunks[2],
            StreamChunk::ContentBlockDelta {
                index: 0,
                delta: ChunkDelta::TextDelta {
                    text: "first".to_string()
                }
            }
        );
        assert_eq!(chunks[4], StreamChunk::ContentBlockStop { index: 0 });
    }

    #[tokio::test]
    async fn test_ollama_chunks_cancellation_is_silent() {
        let lines = vec![
            json!({"message": {"content": "first"}, "done": false}).to_string(),
            json!({"message": {"content": "late"}, "done": false}).to_string(),
            json!({"message": {"content": "later"}, "done": true}).to_string(),
        ];
        let mut stream = ollama_chunks(line_source(lines), AbortHandle::new());
        let handle = stream.abort_handle();

        let mut inner = stream.consume().unwrap();
        assert!(inner.next().await.unwrap().is_ok());
        handle.abort();

        let rest: Vec<_> = inner.collect().await;
        assert!(rest.iter().all(|chunk| chunk.is_ok()));
        assert!(!rest.iter().any(|chunk| matches!(
            chunk.as_ref().unwrap(),
            StreamChunk::ContentBlockDelta {
                delta: ChunkDelta::TextDelta { text },
                ..
            } if text == "late" || text == "later"
        )));
    }

    #[tokio::test]
    async fn test_complete_basic() -> Result<()> {
        let mock_server = MockServer::start().await;
        let response_body = json!({
            "model": "llama3.2",
            "message": {"role": "assistant", "content": "Hello! How can I help?"},
            "done": true,
            "prompt_eval_count": 5,
            "eval_count": 8
        });
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
            .mount(&mock_server)
            .await;

        let provider = OllamaProvider::new(OllamaConfig {
            host: mock_server.uri(),
        })?;

        let capability = ModelCapability::fallback("llama3.2");
        let options = RequestOptions::default();
        let ctx = ConvertContext::new(&capability, &options);
        let messages = vec![Message::user().with_text("Hi")];

        let (message, usage) = provider.complete("", &messages, &[], &ctx).await?;
        assert_eq!(message.text(), "Hello! How can I help?");
        assert_eq!(usage.total_tokens, Some(13));
        Ok(())
    }
}
