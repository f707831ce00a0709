// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Typed turn events decoded from the assistant's output stream

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One decoded unit of a turn.
///
/// A turn ends with exactly one terminal event: `Result`, `Aborted` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The assistant announced (or changed) the session identifier
    SessionMarker { session_id: String },

    /// Echo of a user message; `uuid` is the rewindable checkpoint id
    UserEcho {
        uuid: Option<String>,
        content: String,
    },

    /// Assistant output; `content` is the concatenated text of `blocks`
    AssistantChunk {
        content: String,
        blocks: Vec<ContentBlock>,
    },

    /// A tool invocation or its result
    ToolActivity {
        kind: ToolActivityKind,
        payload: Value,
    },

    /// Final record of the turn
    Result {
        text: String,
        exit_state: ExitState,
        metrics: ResultMetrics,
    },

    /// System records and anything the decoder does not recognise
    SystemNotice {
        subtype: Option<String>,
        payload: Value,
    },

    /// The turn was cancelled before the assistant finished
    Aborted,

    /// Transport-level failure; output yielded before it stays valid
    Failed { failure: TurnFailure },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::Result { .. } | TurnEvent::Aborted | TurnEvent::Failed { .. }
        )
    }

    /// Short kind name used in logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            TurnEvent::SessionMarker { .. } => "session_marker",
            TurnEvent::UserEcho { .. } => "user_echo",
            TurnEvent::AssistantChunk { .. } => "assistant_chunk",
            TurnEvent::ToolActivity { .. } => "tool_activity",
            TurnEvent::Result { .. } => "result",
            TurnEvent::SystemNotice { .. } => "system_notice",
            TurnEvent::Aborted => "aborted",
            TurnEvent::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolActivityKind {
    Use,
    Result,
}

/// How the assistant reported the end of a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExitState {
    Success,
    Error { subtype: String },
}

/// Optional accounting attached to a `result` record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub total_cost_usd: Option<f64>,
}

/// Content block of an assistant or user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
    /// Block kinds this crate does not model, kept verbatim
    Other {
        raw: Value,
    },
}

impl ContentBlock {
    /// Parse a block leniently; unknown or malformed blocks become `Other`.
    pub fn from_value(value: &Value) -> Self {
        let text_field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        match value.get("type").and_then(Value::as_str) {
            Some("text") => match text_field("text") {
                Some(text) => ContentBlock::Text { text },
                None => ContentBlock::Other { raw: value.clone() },
            },
            Some("thinking") => ContentBlock::Thinking {
                thinking: text_field("thinking").unwrap_or_default(),
            },
            Some("tool_use") => ContentBlock::ToolUse {
                id: text_field("id").unwrap_or_default(),
                name: text_field("name").unwrap_or_default(),
                input: value.get("input").cloned().unwrap_or(Value::Null),
            },
            Some("tool_result") => ContentBlock::ToolResult {
                tool_use_id: text_field("tool_use_id").unwrap_or_default(),
                content: value.get("content").cloned().unwrap_or(Value::Null),
                is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            },
            _ => ContentBlock::Other { raw: value.clone() },
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnFailureKind {
    /// Binary missing, or the process died without producing usable output
    ProcessLaunch,
    /// Reading the output stream failed
    Transport,
    /// The process exited before emitting a `result` record
    Incomplete,
}

/// Terminal error attached to a turn's event sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnFailure {
    pub kind: TurnFailureKind,
    pub message: String,
    /// Captured error-channel text, when there was any
    pub stderr: Option<String>,
}

impl TurnFailure {
    pub fn new(kind: TurnFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stderr: None,
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        if !stderr.trim().is_empty() {
            self.stderr = Some(stderr);
        }
        self
    }
}

impl fmt::Display for TurnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(stderr) = &self.stderr {
            write!(f, " (stderr: {})", stderr.trim())?;
        }
        Ok(())
    }
}
