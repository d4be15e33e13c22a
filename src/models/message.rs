use chrono::Utc;

use super::content::{FlowResult, MessageContent};
use super::role::Role;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
/// A message to or from an LLM
pub struct Message {
    pub role: Role,
    pub created: i64,
    pub content: Vec<MessageContent>,
}

impl Message {
    fn with_role(role: Role) -> Self {
        Message {
            role,
            created: Utc::now().timestamp(),
            content: Vec::new(),
        }
    }

    /// Create a new system message with the current timestamp
    pub fn system() -> Self {
        Self::with_role(Role::System)
    }

    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Self::with_role(Role::User)
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Self::with_role(Role::Assistant)
    }

    /// Create a new tool message with the current timestamp
    pub fn tool() -> Self {
        Self::with_role(Role::Tool)
    }

    /// Add any MessageContent to the message
    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content.push(content);
        self
    }

    /// Add text content to the message
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(MessageContent::text(text))
    }

    /// Add an image reference to the message
    pub fn with_image_url<S: Into<String>>(self, url: S) -> Self {
        self.with_content(MessageContent::image_url(url))
    }

    /// Add a reasoning trace to the message
    pub fn with_thinking<S: Into<String>>(self, thinking: S, signature: Option<String>) -> Self {
        self.with_content(MessageContent::thinking(thinking, signature))
    }

    /// Add a completed tool invocation to the message
    pub fn with_flow_step<I, N, P>(
        self,
        id: I,
        name: N,
        params: P,
        results: Vec<FlowResult>,
    ) -> Self
    where
        I: Into<String>,
        N: Into<String>,
        P: Into<String>,
    {
        self.with_content(MessageContent::flow_step(id, name, params, results))
    }

    /// The string-content shortcut: a message whose content is exactly one
    /// text block converts to a single native message with plain string
    /// content, with no further processing.
    pub fn as_plain_text(&self) -> Option<&str> {
        match self.content.as_slice() {
            [MessageContent::Text { text }] => Some(text),
            _ => None,
        }
    }

    /// Concatenated text of all text blocks
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|content| content.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let message = Message::user().with_text("hello");
        assert_eq!(message.role, Role::User);
        assert_eq!(message.text(), "hello");

        let message = Message::assistant()
            .with_text("a")
            .with_thinking("because", None);
        assert_eq!(message.content.len(), 2);
    }

    #[test]
    fn test_plain_text_shortcut() {
        let message = Message::user().with_text("just a string");
        assert_eq!(message.as_plain_text(), Some("just a string"));

        let message = Message::user().with_text("a").with_text("b");
        assert_eq!(message.as_plain_text(), None);

        let message = Message::user().with_image_url("https://x/y.png");
        assert_eq!(message.as_plain_text(), None);
    }

    #[test]
    fn test_serialization() {
        let message = Message::assistant().with_flow_step(
            "call_1",
            "search",
            r#"{"q":"rust"}"#,
            vec![FlowResult::new("ten results")],
        );
        let serialized = serde_json::to_string(&message).unwrap();
        let deserialized: Message = serde_json::from_str(&serialized).unwrap();
        assert_eq!(message, deserialized);
    }
}
