//! Adapter for Google's Gemini generateContent API.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{ChatBackend, Usage};
use super::configs::{ConvertContext, GoogleConfig};
use super::sse;
use super::stream::{AbortHandle, ChunkStream};
use super::utils::{
    attachment_text, image_allowed, image_reference_text, parse_flow_params, resolve_image,
    scrub_schema, ImagePart,
};
use crate::errors::ProviderError;
use crate::models::chunk::{BlockStart, ChunkDelta, StreamChunk};
use crate::models::content::MessageContent;
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::Tool;

pub const GOOGLE_HOST: &str = "https://generativelanguage.googleapis.com";

fn google_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        Role::System | Role::User | Role::Tool => "user",
    }
}

/// Convert one canonical message to zero or more Gemini `contents` entries.
pub async fn message_to_google_spec(message: &Message, ctx: &ConvertContext<'_>) -> Vec<Value> {
    let role = google_role(message.role);

    if let Some(text) = message.as_plain_text() {
        return vec![json!({ "role": role, "parts": [{ "text": text }] })];
    }

    let mut output = Vec::new();
    let mut parts: Vec<Value> = Vec::new();

    for content in &message.content {
        match content {
            MessageContent::Text { text } => {
                if !text.is_empty() {
                    parts.push(json!({ "text": text }));
                }
            }
            MessageContent::ImageUrl { url } => {
                if image_allowed(message.role, ctx) {
                    // Gemini only takes inline data; remote URLs stay as the
                    // reference line.
                    if let Some(ImagePart::Inline { media_type, data }) =
                        resolve_image(url, ctx).await
                    {
                        parts.push(json!({
                            "inline_data": { "mime_type": media_type, "data": data }
                        }));
                    }
                }
                if ctx.options.reference_text() {
                    parts.push(json!({ "text": image_reference_text(url) }));
                }
            }
            MessageContent::File { .. }
            | MessageContent::Audio { .. }
            | MessageContent::Video { .. } => {
                let (kind, url) = content.as_attachment().unwrap();
                let text = attachment_text(kind, url, ctx).await;
                parts.push(json!({ "text": text }));
            }
            MessageContent::Thinking { thinking, .. } => {
                if ctx.capability.thinking {
                    parts.push(json!({ "text": thinking }));
                }
            }
            MessageContent::FlowStep {
                flow_name,
                flow_params,
                flow_results,
                ..
            } => {
                if !parts.is_empty() {
                    output.push(
                        json!({ "role": role, "parts": parts.drain(..).collect::<Vec<_>>() }),
                    );
                }
                output.push(json!({
                    "role": "model",
                    "parts": [{
                        "functionCall": {
                            "name": flow_name,
                            "args": parse_flow_params(flow_params),
                        }
                    }]
                }));
                let result_text = flow_results
                    .iter()
                    .map(|result| result.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                output.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": flow_name,
                            "response": { "content": result_text },
                        }
                    }]
                }));
            }
            MessageContent::Other { .. } => {
                parts.push(json!({ "text": content.fallback_text() }));
            }
        }
    }

    if !parts.is_empty() {
        output.push(json!({ "role": role, "parts": parts }));
    }
    output
}

/// Convert the full canonical message list, preserving input order.
pub async fn messages_to_google_spec(messages: &[Message], ctx: &ConvertContext<'_>) -> Vec<Value> {
    let converted = futures::future::join_all(
        messages
            .iter()
            .map(|message| message_to_google_spec(message, ctx)),
    )
    .await;
    converted.into_iter().flatten().collect()
}

/// Convert internal Tool format to Gemini function declarations. Gemini
/// rejects several JSON-schema fields, so parameters are scrubbed first.
pub fn tools_to_google_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut declarations = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }
        declarations.push(json!({
            "name": tool.name,
            "description": tool.description,
            "parameters": scrub_schema(&tool.parameters),
        }));
    }

    Ok(declarations)
}

/// Convert a Gemini response body to a canonical assistant message.
pub fn google_response_to_message(response: &Value) -> Result<Message> {
    let parts = response["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or_else(|| anyhow!("Invalid response format from Google API"))?;

    let mut message = Message::assistant();
    for part in parts {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            if !text.is_empty() {
                message = message.with_text(text);
            }
        } else if let Some(call) = part.get("functionCall") {
            let name = call["name"].as_str().unwrap_or_default();
            let args = call.get("args").cloned().unwrap_or(json!({}));
            // Gemini does not assign call ids; mint one for pairing.
            let id = format!("call_{}", uuid::Uuid::new_v4().simple());
            message = message.with_flow_step(id, name, args.to_string(), Vec::new());
        } else {
            tracing::warn!("unrecognized response part, degrading: {part}");
            message = message.with_content(MessageContent::Other { data: part.clone() });
        }
    }
    Ok(message)
}

/// Normalize a Gemini SSE byte stream into canonical chunks.
///
/// Gemini frames carry complete parts rather than lifecycle events, so block
/// start/stop are synthesized: one text span for the running text parts, and
/// one self-contained tool_use block per functionCall part.
pub fn google_chunks<S, B, E>(source: S, abort: AbortHandle) -> ChunkStream
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
        let mut text_open = false;

        while let Some(frame) = frames.next().await {
            if abort.is_aborted() {
                return;
            }
            let frame = frame.map_err(|error| {
                abort.abort();
                error
            })?;
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

            let candidate = &value["candidates"][0];
            if let Some(parts) = candidate["content"]["parts"].as_array() {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
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
                    } else if let Some(call) = part.get("functionCall") {
                        if text_open {
                            text_open = false;
                            yield StreamChunk::ContentBlockStop { index };
                            index += 1;
                        }
                        let name = call["name"].as_str().unwrap_or_default().to_string();
                        let id = format!("call_{}", uuid::Uuid::new_v4().simple());
                        let args = call.get("args").cloned().unwrap_or(json!({}));
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
            }

            if candidate.get("finishReason").is_some() && text_open {
                text_open = false;
                yield StreamChunk::ContentBlockStop { index };
                index += 1;
            }
        }

        if text_open {
            yield StreamChunk::ContentBlockStop { index };
        }
    };
    ChunkStream::new(chunks, handle)
}

pub struct GoogleProvider {
    client: Client,
    config: GoogleConfig,
}

impl GoogleProvider {
    pub fn new(config: GoogleConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(ProviderError::Configuration("missing Google API key".to_string()).into());
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Usage {
        let metadata = &data["usageMetadata"];
        let input_tokens = metadata
            .get("promptTokenCount")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);
        let output_tokens = metadata
            .get("candidatesTokenCount")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);
        let total_tokens = metadata
            .get("totalTokenCount")
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
            "contents": messages_to_google_spec(messages, ctx).await,
        });

        if !system.is_empty() {
            payload["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if !tools.is_empty() && ctx.capability.tool_use {
            payload["tools"] = json!([{ "functionDeclarations": tools_to_google_spec(tools)? }]);
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(temp) = ctx.options.temperature {
            generation_config.insert("temperature".to_string(), json!(temp));
        }
        if let Some(max_tokens) = ctx.options.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
        }
        Ok(payload)
    }

    async fn post(
        &self,
        model: &str,
        action: &str,
        query: &[(&str, &str)],
        payload: Value,
    ) -> Result<reqwest::Response> {
        let url = format!(
            "{}/v1beta/models/{}:{}",
            self.config.host.trim_end_matches('/'),
            model,
            action,
        );

        let response = self
            .client
            .post(&url)
            .query(query)
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
impl ChatBackend for GoogleProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        ctx: &ConvertContext<'_>,
    ) -> Result<(Message, Usage)> {
        let payload = self.build_payload(system, messages, tools, ctx).await?;
        let response: Value = self
            .post(
                &ctx.capability.value,
                "generateContent",
                &[("key", self.config.api_key.as_str())],
                payload,
            )
            .await?
            .json()
            .await?;

        let message = google_response_to_message(&response)?;
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
        let response = self
            .post(
                &ctx.capability.value,
                "streamGenerateContent",
                &[("alt", "sse"), ("key", self.config.api_key.as_str())],
                payload,
            )
            .await?;
        Ok(google_chunks(response.bytes_stream(), AbortHandle::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::capability::ModelCapability;
    use crate::models::content::FlowResult;
    use crate::providers::configs::RequestOptions;
    use std::convert::Infallible;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_string_shortcut() {
        let capability = ModelCapability::fallback("gemini");
        let options = RequestOptions::default();
        let ctx = ConvertContext::new(&capability, &options);

        let message = Message::user().with_text("Hello");
        let spec = message_to_google_spec(&message, &ctx).await;
        assert_eq!(
            spec,
            vec![json!({"role": "user", "parts": [{"text": "Hello"}]})]
        );
    }

    #[tokio::test]
    async fn test_flow_step_pair_order() {
        let capability = ModelCapability::fallback("gemini");
        let options = RequestOptions::default();
        let ctx = ConvertContext::new(&capability, &options);

        let message = Message::assistant().with_flow_step(
            "call_1",
            "get_weather",
            r#"{"location":"SF"}"#,
            vec![FlowResult::new("Sunny")],
        );
        let spec = message_to_google_spec(&message, &ctx).await;

        assert_eq!(spec.len(), 2);
        assert_eq!(spec[0]["role"], "model");
        assert_eq!(
            spec[0]["parts"][0]["functionCall"]["args"],
            json!({"location": "SF"})
        );
        assert_eq!(spec[1]["role"], "user");
        assert_eq!(
            spec[1]["parts"][0]["functionResponse"]["response"]["content"],
            "Sunny"
        );
    }

    #[test]
    fn test_tools_spec_scrubs_schema() -> Result<()> {
        let tool = Tool::new(
            "search",
            "Search the web",
            json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {"q": {"type": "string", "default": "x"}}
            }),
        );
        let spec = tools_to_google_spec(&[tool])?;

        assert!(spec[0]["parameters"].get("additionalProperties").is_none());
        assert!(spec[0]["parameters"]["properties"]["q"]
            .get("default")
            .is_none());
        Ok(())
    }

    #[test]
    fn test_response_with_function_call() -> Result<()> {
        let response = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "Let me check."},
                        {"functionCall": {"name": "get_weather", "args": {"location": "SF"}}}
                    ]
                }
            }]
        });
        let message = google_response_to_message(&response)?;

        assert_eq!(message.content.len(), 2);
        if let MessageContent::FlowStep {
            flow_name,
            flow_params,
            ..
        } = &message.content[1]
        {
            assert_eq!(flow_name, "get_weather");
            assert_eq!(
                serde_json::from_str::<Value>(flow_params)?,
                json!({"location": "SF"})
            );
        } else {
            panic!("Expected FlowStep content");
        }
        Ok(())
    }

    fn sse_source(
        frames: Vec<Value>,
    ) -> impl Stream<Item = std::result::Result<Vec<u8>, Infallible>> {
        futures::stream::iter(
            frames
                .into_iter()
                .map(|frame| Ok(format!("data: {frame}\n\n").into_bytes())),
        )
    }

    #[tokio::test]
    async fn test_google_chunks_text_then_tool() {
        let frames = vec![
            json!({"candidates": [{"content": {"parts": [{"text": "Hel"}]}}]}),
            json!({"candidates": [{"content": {"parts": [{"text": "lo"}]}}]}),
            json!({"candidates": [{
                "content": {"parts": [{"functionCall": {"name": "add", "args": {"a": 1}}}]},
                "finishReason": "STOP"
            }]}),
        ];
        let mut stream = google_chunks(sse_source(frames), AbortHandle::new());
        let chunks: Vec<_> = stream
            .consume()
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        assert_eq!(chunks[0], StreamChunk::MessageStart);
        assert_eq!(
            chunks[1],
            StreamChunk::ContentBlockStart {
                index: 0,
                block: BlockStart::Text
            }
        );
        // Two text deltas, then the text block closes before the tool block.
        assert_eq!(chunks[4], StreamChunk::ContentBlockStop { index: 0 });
        assert!(matches!(
            chunks[5],
            StreamChunk::ContentBlockStart {
                index: 1,
                block: BlockStart::ToolUse { .. }
            }
        ));
        assert_eq!(
            chunks[6],
            StreamChunk::ContentBlockDelta {
                index: 1,
                delta: ChunkDelta::InputJsonDelta {
                    partial_json: r#"{"a":1}"#.to_string()
                }
            }
        );
        assert_eq!(chunks[7], StreamChunk::ContentBlockStop { index: 1 });
        assert_eq!(chunks.len(), 8);
    }

    #[tokio::test]
    async fn test_google_chunks_cancellation_is_silent() {
        let frames = vec![
            json!({"candidates": [{"content": {"parts": [{"text": "first"}]}}]}),
            json!({"candidates": [{"content": {"parts": [{"text": "late"}]}}]}),
            json!({"candidates": [{"content": {"parts": [{"text": "later"}]}}]}),
        ];
        let mut stream = google_chunks(sse_source(frames), AbortHandle::new());
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
    async fn test_stream_request_carries_key_and_alt_params() -> Result<()> {
        let mock_server = MockServer::start().await;
        let frame =
            json!({"candidates": [{"content": {"parts": [{"text": "Hi"}]}, "finishReason": "STOP"}]});
        Mock::given(method("POST"))
            .and(path(
                "/v1beta/models/gemini-2.0-flash:streamGenerateContent",
            ))
            .and(query_param("alt", "sse"))
            .and(query_param("key", "test_api_key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(format!("data: {frame}\n\n"), "text/event-stream"),
            )
            .mount(&mock_server)
            .await;

        let provider = GoogleProvider::new(GoogleConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
        })?;

        let capability = ModelCapability::fallback("gemini-2.0-flash");
        let options = RequestOptions::default();
        let ctx = ConvertContext::new(&capability, &options);
        let messages = vec![Message::user().with_text("Hi")];

        // An unmatched mock would come back 404 and surface as a transport
        // error before any chunk is yielded.
        let mut stream = provider.stream("", &messages, &[], &ctx).await?;
        let chunks: Vec<_> = stream
            .consume()?
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert!(chunks.contains(&StreamChunk::ContentBlockDelta {
            index: 0,
            delta: ChunkDelta::TextDelta {
                text: "Hi".to_string()
            }
        }));
        Ok(())
    }

    #[tokio::test]
    async fn test_complete_basic() -> Result<()> {
        let mock_server = MockServer::start().await;
        let response_body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello there!"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 7,
                "candidatesTokenCount": 3,
                "totalTokenCount": 10
            }
        });
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
            .mount(&mock_server)
            .await;

        let provider = GoogleProvider::new(GoogleConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
        })?;

        let capability = ModelCapability::fallback("gemini-2.0-flash");
        let options = RequestOptions::default();
        let ctx = ConvertContext::new(&capability, &options);
        let messages = vec![Message::user().with_text("Hi")];

        let (message, usage) = provider.complete("", &messages, &[], &ctx).await?;
        assert_eq!(message.text(), "Hello there!");
        assert_eq!(usage.total_tokens, Some(10));
        Ok(())
    }
}
