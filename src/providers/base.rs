use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::configs::ConvertContext;
use super::stream::ChunkStream;
use crate::models::message::Message;
use crate::models::tool::Tool;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }
}

/// Capability-set interface every provider adapter implements: build and
/// issue the native request, and normalize the native response.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Issue a non-streaming call and wrap the response into a single
    /// canonical assistant message
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        ctx: &ConvertContext<'_>,
    ) -> Result<(Message, Usage)>;

    /// Issue a streaming call and normalize the native event stream into a
    /// canonical chunk stream
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        ctx: &ConvertContext<'_>,
    ) -> Result<ChunkStream>;
}
