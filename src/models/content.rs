use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One textual result produced by a completed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResult {
    pub text: String,
}

impl FlowResult {
    pub fn new<S: Into<String>>(text: S) -> Self {
        FlowResult { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Content passed inside a canonical message
pub enum MessageContent {
    Text {
        text: String,
    },
    /// An image reference: http(s) URL, `file://` URL, local path, or an
    /// opaque remote asset key.
    ImageUrl {
        url: String,
    },
    File {
        file_url: String,
    },
    Audio {
        file_url: String,
    },
    Video {
        file_url: String,
    },
    /// A reasoning trace. `signature` is provider-opaque.
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// One completed tool invocation from conversation history: the call and
    /// its results bundled together. Converters always expand this into a
    /// tool-call message followed by a tool-result message; the pair is never
    /// separated or reordered.
    FlowStep {
        flow_id: String,
        flow_name: String,
        /// JSON-encoded arguments as received; parsed lazily at convert time.
        flow_params: String,
        #[serde(default)]
        flow_results: Vec<FlowResult>,
    },
    /// Catch-all for block shapes this crate does not model. Converters
    /// degrade it to a text block holding its JSON representation.
    Other {
        data: Value,
    },
}

impl MessageContent {
    pub fn text<S: Into<String>>(text: S) -> Self {
        MessageContent::Text { text: text.into() }
    }

    pub fn image_url<S: Into<String>>(url: S) -> Self {
        MessageContent::ImageUrl { url: url.into() }
    }

    pub fn thinking<S: Into<String>>(thinking: S, signature: Option<String>) -> Self {
        MessageContent::Thinking {
            thinking: thinking.into(),
            signature,
        }
    }

    pub fn flow_step<I, N, P>(id: I, name: N, params: P, results: Vec<FlowResult>) -> Self
    where
        I: Into<String>,
        N: Into<String>,
        P: Into<String>,
    {
        MessageContent::FlowStep {
            flow_id: id.into(),
            flow_name: name.into(),
            flow_params: params.into(),
            flow_results: results,
        }
    }

    /// Get the text content if this is a Text variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } => Some(text),
            _ => None,
        }
    }

    /// The attachment kind and URL for file-like blocks.
    pub fn as_attachment(&self) -> Option<(&'static str, &str)> {
        match self {
            MessageContent::File { file_url } => Some(("file", file_url)),
            MessageContent::Audio { file_url } => Some(("audio", file_url)),
            MessageContent::Video { file_url } => Some(("video", file_url)),
            _ => None,
        }
    }

    /// Textual fallback for blocks a target provider cannot represent.
    pub fn fallback_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "[unrepresentable content]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tagged_serialization() {
        let block = MessageContent::text("hi");
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value, json!({"type": "text", "text": "hi"}));

        let block = MessageContent::image_url("https://example.com/a.png");
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "image_url");
    }

    #[test]
    fn test_flow_step_roundtrip() {
        let block = MessageContent::flow_step(
            "call_1",
            "get_weather",
            r#"{"location":"SF"}"#,
            vec![FlowResult::new("Sunny")],
        );
        let serialized = serde_json::to_string(&block).unwrap();
        let deserialized: MessageContent = serde_json::from_str(&serialized).unwrap();
        assert_eq!(block, deserialized);
    }

    #[test]
    fn test_as_attachment() {
        let block = MessageContent::Audio {
            file_url: "file:///tmp/a.mp3".to_string(),
        };
        assert_eq!(block.as_attachment(), Some(("audio", "file:///tmp/a.mp3")));
        assert_eq!(MessageContent::text("x").as_attachment(), None);
    }

    #[test]
    fn test_fallback_text_is_json() {
        let block = MessageContent::Other {
            data: json!({"custom": 1}),
        };
        let fallback = block.fallback_text();
        let value: serde_json::Value = serde_json::from_str(&fallback).unwrap();
        assert_eq!(value["data"]["custom"], 1);
    }
}
