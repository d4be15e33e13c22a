use serde::{Deserialize, Serialize};

/// The opening shape of a streamed content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    Text,
    Thinking,
    /// A tool call. Argument fragments follow as `InputJsonDelta`s; the
    /// consumer concatenates them and parses the JSON only once the block
    /// stops.
    ToolUse {
        id: String,
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}

/// One canonical streaming event. Chunks are replayed in emission order to
/// reconstruct a message; there is no random access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    MessageStart,
    ContentBlockStart { index: usize, block: BlockStart },
    ContentBlockDelta { index: usize, delta: ChunkDelta },
    ContentBlockStop { index: usize },
}
