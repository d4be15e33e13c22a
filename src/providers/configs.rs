//! Per-provider configuration and request-scoped options.
//!
//! Credentials are injected explicitly by the host for each backend; nothing
//! here reads the process environment or persists secrets.

use crate::attachments::{AttachmentReader, MediaStore, LOCAL_MEDIA, NOOP_ATTACHMENTS};
use crate::models::capability::ModelCapability;

// Define specific config structs for each provider
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub host: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub host: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub host: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct VercelConfig {
    pub host: String,
    pub api_key: String,
}

// Unified enum to wrap different provider configurations
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAi(OpenAiConfig),
    Anthropic(AnthropicConfig),
    Google(GoogleConfig),
    Ollama(OllamaConfig),
    Vercel(VercelConfig),
}

/// Small bag of request-scoped flags and sampling parameters.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Whether the request originates from agent mode
    pub agent_mode: bool,
    /// Append a text line naming each attachment URL for tool-use
    /// traceability
    pub include_reference_text: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

impl RequestOptions {
    /// Whether reference lines naming attachment URLs should be appended.
    pub fn reference_text(&self) -> bool {
        self.agent_mode || self.include_reference_text
    }
}

/// Everything a converter needs besides the message itself: the selected
/// model's capability record, request options, and the attachment/media
/// collaborators.
pub struct ConvertContext<'a> {
    pub capability: &'a ModelCapability,
    pub options: &'a RequestOptions,
    pub attachments: &'a dyn AttachmentReader,
    pub media: &'a dyn MediaStore,
}

impl<'a> ConvertContext<'a> {
    /// A context backed by the default collaborators: no attachment
    /// extraction, local files embedded as-is.
    pub fn new(capability: &'a ModelCapability, options: &'a RequestOptions) -> Self {
        ConvertContext {
            capability,
            options,
            attachments: &NOOP_ATTACHMENTS,
            media: &LOCAL_MEDIA,
        }
    }

    pub fn with_attachments(mut self, attachments: &'a dyn AttachmentReader) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_media(mut self, media: &'a dyn MediaStore) -> Self {
        self.media = media;
        self
    }
}
