//! Static provider registry: provider id to backend construction, with no
//! dynamic loading.

use anyhow::Result;
use strum_macros::EnumIter;

use super::anthropic::AnthropicProvider;
use super::base::ChatBackend;
use super::configs::ProviderConfig;
use super::google::GoogleProvider;
use super::ollama::OllamaProvider;
use super::openai::OpenAiProvider;
use super::vercel::VercelProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Ollama,
    Vercel,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Vercel => "vercel",
        }
    }
}

impl From<&ProviderConfig> for ProviderKind {
    fn from(config: &ProviderConfig) -> Self {
        match config {
            ProviderConfig::OpenAi(_) => ProviderKind::OpenAi,
            ProviderConfig::Anthropic(_) => ProviderKind::Anthropic,
            ProviderConfig::Google(_) => ProviderKind::Google,
            ProviderConfig::Ollama(_) => ProviderKind::Ollama,
            ProviderConfig::Vercel(_) => ProviderKind::Vercel,
        }
    }
}

/// Construct the backend for a provider configuration. Configuration errors
/// (missing keys, missing host) surface here, before any network call.
pub fn get_backend(config: ProviderConfig) -> Result<Box<dyn ChatBackend>> {
    match config {
        ProviderConfig::OpenAi(config) => Ok(Box::new(OpenAiProvider::new(config)?)),
        ProviderConfig::Anthropic(config) => Ok(Box::new(AnthropicProvider::new(config)?)),
        ProviderConfig::Google(config) => Ok(Box::new(GoogleProvider::new(config)?)),
        ProviderConfig::Ollama(config) => Ok(Box::new(OllamaProvider::new(config)?)),
        ProviderConfig::Vercel(config) => Ok(Box::new(VercelProvider::new(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use crate::providers::configs::{OllamaConfig, OpenAiConfig};
    use strum::IntoEnumIterator;

    #[test]
    fn test_kind_names_are_unique() {
        let names: std::collections::HashSet<_> =
            ProviderKind::iter().map(|kind| kind.name()).collect();
        assert_eq!(names.len(), ProviderKind::iter().count());
    }

    #[test]
    fn test_get_backend_ollama() {
        let backend = get_backend(ProviderConfig::Ollama(OllamaConfig {
            host: "http://localhost:11434".to_string(),
        }));
        assert!(backend.is_ok());
    }

    #[test]
    fn test_get_backend_missing_key_fails_fast() {
        let result = get_backend(ProviderConfig::OpenAi(OpenAiConfig {
            host: "https://api.openai.com".to_string(),
            api_key: String::new(),
        }));
        let error = result.err().unwrap();
        assert!(matches!(
            error.downcast_ref::<ProviderError>(),
            Some(ProviderError::Configuration(_))
        ));
    }
}
