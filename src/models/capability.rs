use serde::{Deserialize, Serialize};

/// Per-model metadata used to decide which conversion path and parameters
/// apply: context window, pricing, and supported modalities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCapability {
    /// The model identifier sent on the wire
    pub value: String,
    /// Human-readable name
    pub title: String,
    /// Context window in tokens
    pub context: u32,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Price per million input tokens, USD
    #[serde(default)]
    pub input_price: f64,
    /// Price per million output tokens, USD
    #[serde(default)]
    pub output_price: f64,
    pub tool_use: bool,
    pub vision_enable: bool,
    #[serde(default)]
    pub audio_enable: bool,
    #[serde(default)]
    pub image_generation: bool,
    #[serde(default = "default_true")]
    pub system_message_enable: bool,
    /// Whether thinking blocks are passed through to the provider
    #[serde(default)]
    pub thinking: bool,
}

fn default_true() -> bool {
    true
}

impl ModelCapability {
    /// Permissive default for unregistered model ids: conversion proceeds
    /// with vision and tool use disabled and an 8000-token context.
    pub fn fallback(model_id: &str) -> Self {
        ModelCapability {
            value: model_id.to_string(),
            title: model_id.to_string(),
            context: 8000,
            max_tokens: 4096,
            input_price: 0.0,
            output_price: 0.0,
            tool_use: false,
            vision_enable: false,
            audio_enable: false,
            image_generation: false,
            system_message_enable: true,
            thinking: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_defaults() {
        let capability = ModelCapability::fallback("mystery-model");
        assert_eq!(capability.value, "mystery-model");
        assert_eq!(capability.context, 8000);
        assert!(!capability.tool_use);
        assert!(!capability.vision_enable);
        assert!(capability.system_message_enable);
    }

    #[test]
    fn test_deserialize_partial_record() {
        let json = r#"{
            "value": "gpt-4o",
            "title": "GPT-4o",
            "context": 128000,
            "maxTokens": 16384,
            "toolUse": true,
            "visionEnable": true
        }"#;
        let capability: ModelCapability = serde_json::from_str(json).unwrap();
        assert!(capability.tool_use);
        assert!(capability.system_message_enable);
        assert!(!capability.thinking);
    }
}
