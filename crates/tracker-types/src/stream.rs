use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Push events delivered on a job's live stream, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk {
        #[serde(default)]
        content: String,
    },
    ToolCallStart {
        #[serde(default)]
        tool: String,
        #[serde(default)]
        call_id: Option<String>,
    },
    ToolCallEnd {
        #[serde(default)]
        tool: String,
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        result: Option<Value>,
    },
    End,
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::ToolCallStart { .. } => "tool_call_start",
            StreamEvent::ToolCallEnd { .. } => "tool_call_end",
            StreamEvent::End => "end",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn closes_stream(&self) -> bool {
        matches!(self, StreamEvent::End | StreamEvent::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Done,
}

/// A materialized timeline row; this is also the persisted transcript shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEntry {
    Text {
        content: String,
    },
    Tool {
        id: String,
        label: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
}
