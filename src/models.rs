//! These models are the canonical vocabulary shared by every provider adapter
//!
//! There are several provider wire formats we need to interact with:
//! - openai-style messages/tools, used verbatim by many compatible vendors
//! - anthropic content blocks and streaming events
//! - google gemini Content/Part objects
//! - ollama chat messages and newline-delimited streaming
//! - vercel ai-gateway ModelMessage and tool-input events
//!
//! These all overlap to varying degrees. Callers construct the canonical
//! structs below; each adapter converts to its native format on the way out
//! and normalizes streamed output back into canonical chunks on the way in.
//! Because of the need for compatibility, the canonical models are not an
//! exact match to any single wire format.
pub mod capability;
pub mod chunk;
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
