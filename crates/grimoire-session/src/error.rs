// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the session rewind/fork/edit core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for session operations
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by sends, rewinds and edits
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to launch assistant process {binary}: {stderr}")]
    ProcessLaunch { binary: String, stderr: String },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Checkpoint {0} is the first in the conversation and has no prior checkpoint")]
    NoPriorCheckpoint(String),

    #[error("Rewind failed: {0}")]
    RewindFailed(String),

    #[error("Lineage is busy with another operation")]
    LineageBusy,

    #[error("No active session; send a message first")]
    NoActiveSession,

    #[error("Prompt text is empty")]
    EmptyPrompt,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    pub fn process_launch(binary: impl Into<String>, stderr: impl Into<String>) -> Self {
        SessionError::ProcessLaunch {
            binary: binary.into(),
            stderr: stderr.into(),
        }
    }
}

/// A single stream line that could not be decoded.
///
/// Never fatal: the decoder reports it and moves on to the next line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to decode stream record ({message}): {line}")]
pub struct DecodeError {
    /// Offending line, clipped for logging
    pub line: String,
    pub message: String,
}

const DECODE_ERROR_LINE_LIMIT: usize = 200;

impl DecodeError {
    pub fn new(line: &str, message: impl Into<String>) -> Self {
        let line = match line.char_indices().nth(DECODE_ERROR_LINE_LIMIT) {
            Some((cut, _)) => format!("{}…", &line[..cut]),
            None => line.to_string(),
        };
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Soft failure reported alongside a successful conversation rewind when the
/// checkpoint's file state could not be restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("File state for checkpoint {checkpoint} could not be restored: {reason}")]
pub struct FileRewindUnavailableWarning {
    pub checkpoint: String,
    pub reason: String,
}
