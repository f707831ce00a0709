// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Newline-delimited JSON decoder for the assistant's output stream
//!
//! Each non-blank line is one record. Records are mapped to [`TurnEvent`]s by
//! their `type` field; kinds the decoder does not know are forwarded as
//! `SystemNotice` so newer assistant versions keep working. A malformed line
//! yields a [`DecodeError`] for that line only; the caller skips it and keeps
//! reading.

use crate::error::DecodeError;
use crate::events::{ContentBlock, ExitState, ResultMetrics, ToolActivityKind, TurnEvent};
use serde_json::{Map, Value};

/// Stateful line decoder.
///
/// Tracks the last session id seen so a `SessionMarker` is only emitted when
/// the id first appears or changes.
#[derive(Debug, Default, Clone)]
pub struct StreamDecoder {
    session_id: Option<String>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The decoder's current view of the session id; not authoritative
    pub fn current_session(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn decode_line(&mut self, line: &str) -> Result<Vec<TurnEvent>, DecodeError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let record: Value =
            serde_json::from_str(trimmed).map_err(|e| DecodeError::new(trimmed, e.to_string()))?;
        let Value::Object(record) = record else {
            return Err(DecodeError::new(trimmed, "record is not a JSON object"));
        };

        let mut events = Vec::new();
        if let Some(session_id) = str_field(&record, "session_id").filter(|id| !id.is_empty()) {
            if self.session_id.as_deref() != Some(session_id) {
                self.session_id = Some(session_id.to_string());
                events.push(TurnEvent::SessionMarker {
                    session_id: session_id.to_string(),
                });
            }
        }

        let kind = str_field(&record, "type").map(str::to_string);
        match kind.as_deref() {
            Some("user") => decode_user(&record, &mut events),
            Some("assistant") => decode_assistant(&record, &mut events),
            Some("result") => events.push(decode_result(&record)),
            Some("system") => events.push(TurnEvent::SystemNotice {
                subtype: str_field(&record, "subtype").map(str::to_string),
                payload: Value::Object(record),
            }),
            _ => events.push(TurnEvent::SystemNotice {
                subtype: kind.clone(),
                payload: Value::Object(record),
            }),
        }

        Ok(events)
    }
}

fn str_field<'a>(record: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

fn message_content(record: &Map<String, Value>) -> Option<&Value> {
    record.get("message").and_then(|message| message.get("content"))
}

fn content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(text)) => vec![ContentBlock::Text { text: text.clone() }],
        Some(Value::Array(items)) => items.iter().map(ContentBlock::from_value).collect(),
        _ => Vec::new(),
    }
}

fn joined_text(blocks: &[ContentBlock]) -> String {
    blocks.iter().filter_map(ContentBlock::text).collect::<Vec<_>>().join("")
}

fn decode_user(record: &Map<String, Value>, events: &mut Vec<TurnEvent>) {
    // Tool results travel as user-role records but are not user turns.
    if let Some(Value::Array(items)) = message_content(record) {
        let all_tool_results = !items.is_empty()
            && items.iter().all(|item| item.get("type").and_then(Value::as_str) == Some("tool_result"));
        if all_tool_results {
            events.extend(items.iter().map(|item| TurnEvent::ToolActivity {
                kind: ToolActivityKind::Result,
                payload: item.clone(),
            }));
            return;
        }
    }

    let blocks = content_blocks(message_content(record));
    events.push(TurnEvent::UserEcho {
        uuid: str_field(record, "uuid").filter(|uuid| !uuid.is_empty()).map(str::to_string),
        content: joined_text(&blocks),
    });
}

fn decode_assistant(record: &Map<String, Value>, events: &mut Vec<TurnEvent>) {
    let raw_blocks = match message_content(record) {
        Some(Value::Array(items)) => items.as_slice(),
        _ => &[],
    };
    let blocks = content_blocks(message_content(record));

    if blocks.iter().any(|block| !block.is_tool()) || blocks.is_empty() {
        events.push(TurnEvent::AssistantChunk {
            content: joined_text(&blocks),
            blocks: blocks.clone(),
        });
    }

    for (block, raw) in blocks.iter().zip(raw_blocks) {
        if matches!(block, ContentBlock::ToolUse { .. }) {
            events.push(TurnEvent::ToolActivity {
                kind: ToolActivityKind::Use,
                payload: raw.clone(),
            });
        }
    }
}

fn decode_result(record: &Map<String, Value>) -> TurnEvent {
    let is_error = record.get("is_error").and_then(Value::as_bool).unwrap_or(false);
    let subtype = str_field(record, "subtype").unwrap_or("success");
    let exit_state = if is_error || subtype != "success" {
        ExitState::Error {
            subtype: subtype.to_string(),
        }
    } else {
        ExitState::Success
    };

    TurnEvent::Result {
        text: str_field(record, "result").unwrap_or_default().to_string(),
        exit_state,
        metrics: ResultMetrics {
            duration_ms: record.get("duration_ms").and_then(Value::as_u64),
            num_turns: record
                .get("num_turns")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok()),
            total_cost_usd: record.get("total_cost_usd").and_then(Value::as_f64),
        },
    }
}
