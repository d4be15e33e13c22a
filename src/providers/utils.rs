use std::path::{Path, PathBuf};

use anyhow::Result;
use regex::Regex;
use serde_json::{json, Value};

use super::configs::ConvertContext;
use crate::errors::ProviderError;
use crate::models::content::MessageContent;
use crate::models::message::Message;
use crate::models::role::Role;

/// Image extensions accepted for binary embedding across providers.
pub const SUPPORTED_IMAGE_EXTENSIONS: [&str; 5] = ["jpeg", "jpg", "png", "webp", "gif"];

pub fn sanitize_function_name(name: &str) -> String {
    let re = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    re.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    let re = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
    re.is_match(name)
}

/// Parse a flow step's JSON-encoded arguments. Malformed JSON degrades to an
/// empty object with a warning; it never raises.
pub fn parse_flow_params(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            tracing::warn!("flow params are not a JSON object, wrapping: {other}");
            json!({ "value": other })
        }
        Err(error) => {
            tracing::warn!("malformed flow params, using empty object: {error}");
            json!({})
        }
    }
}

/// The media type for a URL whose extension is in the supported image set.
pub fn image_media_type(url: &str) -> Option<&'static str> {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let ext = trimmed.rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpeg" | "jpg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

pub fn is_remote_url(url: &str) -> bool {
    matches!(
        url::Url::parse(url).map(|u| u.scheme().to_string()),
        Ok(scheme) if scheme == "http" || scheme == "https"
    )
}

/// The local filesystem path for a `file://` URL or a bare path.
pub fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if url::Url::parse(url).is_ok() {
        // Some other scheme (an opaque asset key); not a local file.
        return None;
    }
    Some(PathBuf::from(url))
}

/// A prepared image part: either passed by reference or embedded as base64.
#[derive(Debug, Clone, PartialEq)]
pub enum ImagePart {
    Remote(String),
    Inline { media_type: String, data: String },
}

/// Prepare an image for embedding. Returns None when the extension is
/// unsupported or a local file cannot be read. Local files are compressed
/// before encoding.
pub async fn resolve_image(url: &str, ctx: &ConvertContext<'_>) -> Option<ImagePart> {
    let media_type = image_media_type(url)?;
    if is_remote_url(url) {
        return Some(ImagePart::Remote(url.to_string()));
    }
    let path = local_path(url)?;
    let path = ctx.media.compress_image(Path::new(&path)).await;
    let data = ctx.media.file_to_base64(&path).await?;
    Some(ImagePart::Inline {
        media_type: media_type.to_string(),
        data,
    })
}

/// Whether binary image data may be attached for this message.
pub fn image_allowed(role: Role, ctx: &ConvertContext<'_>) -> bool {
    role == Role::User && ctx.capability.vision_enable
}

/// The reference line appended after an image for tool-use traceability.
pub fn image_reference_text(url: &str) -> String {
    format!("# image url: {url}")
}

/// Resolve an attachment to embeddable text via the attachment reader; when
/// nothing can be extracted, a neutral sentence naming the URL is used
/// instead.
pub async fn attachment_text(kind: &str, url: &str, ctx: &ConvertContext<'_>) -> String {
    match ctx.attachments.read_text(url, kind).await {
        Some(text) if !text.trim().is_empty() => {
            format!("# {kind} file url: {url}\n# {kind} file transcript: {text}")
        }
        _ => format!("The user attached a {kind} file at {url}; it is included for reference only."),
    }
}

/// Deep-copy a JSON schema with fields some providers reject removed
/// (`additionalProperties`, `$schema`, `default`). The caller's schema is
/// never mutated.
pub fn scrub_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut scrubbed = serde_json::Map::new();
            for (key, value) in map {
                if key == "additionalProperties" || key == "$schema" || key == "default" {
                    continue;
                }
                scrubbed.insert(key.clone(), scrub_schema(value));
            }
            Value::Object(scrubbed)
        }
        Value::Array(items) => Value::Array(items.iter().map(scrub_schema).collect()),
        other => other.clone(),
    }
}

/// Convert an OpenAI-style response body to a canonical assistant message.
///
/// Tool calls become flow steps with no results yet; a call with an invalid
/// name is degraded to a catch-all block, never an error.
pub fn openai_response_to_message(response: &Value) -> Result<Message> {
    let original = &response["choices"][0]["message"];
    let mut message = Message::assistant();

    if let Some(text) = original.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            message = message.with_text(text);
        }
    }

    if let Some(reasoning) = original.get("reasoning_content").and_then(|c| c.as_str()) {
        if !reasoning.is_empty() {
            message = message.with_thinking(reasoning, None);
        }
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(|c| c.as_array()) {
        for tool_call in tool_calls {
            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
            let function_name = tool_call["function"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default()
                .to_string();

            if !is_valid_function_name(&function_name) {
                tracing::warn!(
                    "provider returned invalid function name '{function_name}', degrading to text"
                );
                message = message.with_content(MessageContent::Other {
                    data: tool_call.clone(),
                });
                continue;
            }
            if serde_json::from_str::<Value>(&arguments).is_err() {
                tracing::warn!("could not interpret tool arguments for id {id}; keeping raw string");
            }
            message = message.with_flow_step(id, function_name, arguments, Vec::new());
        }
    }

    Ok(message)
}

/// Detect a context-length failure in an OpenAI-style error payload.
pub fn check_openai_context_length_error(error: &Value) -> Option<ProviderError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ProviderError::ContextLengthExceeded(message))
    } else {
        None
    }
}
