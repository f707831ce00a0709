// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Rewind control plane
//!
//! Rewinds do not go through the turn channel. They use a second surface that
//! can resume a session as of a checkpoint, optionally fork it onto a new
//! session id and optionally roll back files touched by earlier tool calls.
//! The orchestrator only sees the [`ControlPlane`] trait; [`CliControlPlane`]
//! drives the assistant binary's control protocol.

use crate::config::AssistantConfig;
use crate::decoder::StreamDecoder;
use crate::error::{SessionError, SessionResult};
use crate::events::{ExitState, TurnEvent};
use crate::transport::{resolve_binary, spawn_with_input, user_envelope, TurnExit};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One rewind as the control plane sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewindRequest {
    /// Session being rewound
    pub session_id: String,
    /// Checkpoint uuid to resume at
    pub checkpoint: String,
    /// Continue on a new session id instead of rewriting the current one
    pub fork: bool,
    /// Also roll back files changed after the checkpoint
    pub rewind_files: bool,
    pub working_directory: PathBuf,
    pub config_dir: Option<PathBuf>,
    /// Turn text that makes the collaborator execute the rewind
    pub placeholder: String,
}

/// Progress reported while a rewind executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// The rewound conversation now lives under this session id
    SessionAssigned { session_id: String },
    /// The collaborator restored these paths itself
    FilesRestored { paths: Vec<String> },
    /// Checkpointed content of one file; `None` means the file did not exist
    FileSnapshot {
        path: String,
        content: Option<String>,
    },
    /// The checkpoint has no restorable file state
    FileRewindUnavailable { reason: String },
    /// Conversation-level rewind succeeded
    Completed,
    /// Conversation-level rewind was refused or failed
    Rejected { reason: String },
}

pub type ControlStream = BoxStream<'static, SessionResult<ControlEvent>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Start a rewind and return its event stream.
    ///
    /// An `Err` here means the request could not be issued at all.
    async fn open(&self, request: RewindRequest) -> SessionResult<ControlStream>;
}

/// Control plane backed by the assistant binary
#[derive(Debug, Clone)]
pub struct CliControlPlane {
    config: AssistantConfig,
}

impl CliControlPlane {
    pub fn new(config: AssistantConfig) -> Self {
        Self { config }
    }

    pub fn rewind_args(&self, request: &RewindRequest) -> Vec<String> {
        let mut args = self.config.base_args();
        args.push("--resume".to_string());
        args.push(request.session_id.clone());
        args.push("--resume-session-at".to_string());
        args.push(request.checkpoint.clone());
        if request.fork {
            args.push("--fork-session".to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    /// Stdin script: initialize, optional file rewind, placeholder turn.
    ///
    /// `rewind_files` precedes the placeholder, so the assistant may restore
    /// files before it confirms the conversation rewind.
    pub fn input_lines(request: &RewindRequest, rewind_request_id: Option<&str>) -> Vec<String> {
        let mut lines = vec![json!({
            "type": "control_request",
            "request_id": format!("req_init_{}", Uuid::new_v4().simple()),
            "request": {"subtype": "initialize"},
        })
        .to_string()];
        if let Some(request_id) = rewind_request_id {
            lines.push(
                json!({
                    "type": "control_request",
                    "request_id": request_id,
                    "request": {
                        "subtype": "rewind_files",
                        "user_message_id": request.checkpoint,
                    },
                })
                .to_string(),
            );
        }
        lines.push(user_envelope(&request.placeholder, Some(&request.session_id)).to_string());
        lines
    }
}

#[async_trait]
impl ControlPlane for CliControlPlane {
    async fn open(&self, request: RewindRequest) -> SessionResult<ControlStream> {
        let binary = resolve_binary(&self.config.binary)?;
        let rewind_request_id = request
            .rewind_files
            .then(|| format!("req_rewind_{}", Uuid::new_v4().simple()));

        let mut cmd = Command::new(&binary);
        cmd.args(self.rewind_args(&request))
            .current_dir(&request.working_directory);
        self.config.apply_env(&mut cmd, request.config_dir.as_deref());

        info!(
            session_id = %request.session_id,
            checkpoint = %request.checkpoint,
            fork = request.fork,
            rewind_files = request.rewind_files,
            "Opening rewind control plane"
        );

        let input = Self::input_lines(&request, rewind_request_id.as_deref());
        let mut channel = spawn_with_input(binary.display().to_string(), cmd, input).await?;

        let (tx, rx) = mpsc::channel(32);
        let mut translator = ControlTranslator::new(request.session_id, rewind_request_id);
        tokio::spawn(async move {
            while let Some(line) = channel.lines.next().await {
                let events = match line {
                    Ok(line) => translator.translate_line(&line),
                    Err(e) => {
                        let _ = tx.send(Err(SessionError::Io(e))).await;
                        return;
                    }
                };
                for event in events {
                    if tx.send(Ok(event)).await.is_err() {
                        debug!("Control stream dropped; stopping rewind process");
                        return;
                    }
                }
            }
            let events = match channel.completion.await {
                Ok(exit) => translator.finish(&exit),
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }
}

/// Maps the control process's output records onto [`ControlEvent`]s
#[derive(Debug)]
struct ControlTranslator {
    decoder: StreamDecoder,
    original_session: String,
    announced_session: Option<String>,
    rewind_request_id: Option<String>,
    saw_result: bool,
}

impl ControlTranslator {
    fn new(original_session: String, rewind_request_id: Option<String>) -> Self {
        Self {
            decoder: StreamDecoder::new(),
            original_session,
            announced_session: None,
            rewind_request_id,
            saw_result: false,
        }
    }

    fn translate_line(&mut self, line: &str) -> Vec<ControlEvent> {
        let events = match self.decoder.decode_line(line) {
            Ok(events) => events,
            Err(e) => {
                warn!(line = %e.line, "Skipping undecodable control record: {}", e.message);
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for event in events {
            match event {
                TurnEvent::SessionMarker { session_id } => {
                    if session_id != self.original_session
                        && self.announced_session.as_deref() != Some(session_id.as_str())
                    {
                        self.announced_session = Some(session_id.clone());
                        out.push(ControlEvent::SessionAssigned { session_id });
                    }
                }
                TurnEvent::SystemNotice {
                    subtype: Some(subtype),
                    payload,
                } if subtype == "control_response" => {
                    if let Some(event) = self.file_outcome(&payload) {
                        out.extend(event);
                    }
                }
                TurnEvent::Result {
                    text, exit_state, ..
                } => {
                    self.saw_result = true;
                    out.push(match exit_state {
                        ExitState::Success => ControlEvent::Completed,
                        ExitState::Error { subtype } => ControlEvent::Rejected {
                            reason: if text.is_empty() { subtype } else { text },
                        },
                    });
                }
                _ => {}
            }
        }
        out
    }

    /// File outcome carried by the response to our `rewind_files` request.
    ///
    /// A success response can still refuse: `canRewind: false` or a non-empty
    /// `error` means the checkpoint has no usable file state. A body with no
    /// file list at all is only trusted when `canRewind` is explicitly true.
    fn file_outcome(&self, payload: &Value) -> Option<Vec<ControlEvent>> {
        let response = payload.get("response")?;
        let request_id = response.get("request_id").and_then(Value::as_str)?;
        if self.rewind_request_id.as_deref() != Some(request_id) {
            return None;
        }

        if response.get("subtype").and_then(Value::as_str) == Some("error") {
            let reason = non_empty_str(response.get("error"))
                .unwrap_or("file rewind failed")
                .to_string();
            return Some(vec![ControlEvent::FileRewindUnavailable { reason }]);
        }

        let body = response.get("response");
        let field = |name: &str| body.and_then(|b| b.get(name));
        let can_rewind = field("canRewind").and_then(Value::as_bool);
        if let Some(error) = non_empty_str(field("error")) {
            return Some(vec![ControlEvent::FileRewindUnavailable {
                reason: error.to_string(),
            }]);
        }
        if can_rewind == Some(false) {
            return Some(vec![ControlEvent::FileRewindUnavailable {
                reason: "files cannot be rewound to this checkpoint".to_string(),
            }]);
        }

        let files = field("files").and_then(Value::as_array);
        let changed = field("filesChanged").and_then(Value::as_array);
        if files.is_none() && changed.is_none() && can_rewind != Some(true) {
            return Some(vec![ControlEvent::FileRewindUnavailable {
                reason: "file rewind response did not list any files".to_string(),
            }]);
        }

        let mut restored = Vec::new();
        let mut events = Vec::new();
        for file in files.into_iter().flatten().chain(changed.into_iter().flatten()) {
            match file {
                Value::String(path) => {
                    if !restored.contains(path) {
                        restored.push(path.clone());
                    }
                }
                Value::Object(entry) => {
                    if let Some(path) = entry.get("path").and_then(Value::as_str) {
                        events.push(ControlEvent::FileSnapshot {
                            path: path.to_string(),
                            content: entry.get("content").and_then(Value::as_str).map(str::to_string),
                        });
                    }
                }
                _ => {}
            }
        }
        if !restored.is_empty() || events.is_empty() {
            events.insert(0, ControlEvent::FilesRestored { paths: restored });
        }
        Some(events)
    }

    fn finish(&mut self, exit: &TurnExit) -> Vec<ControlEvent> {
        if self.saw_result {
            return Vec::new();
        }
        let mut reason = match exit.code {
            Some(code) => format!("{} exited with status {} before completing", exit.program, code),
            None => format!("{} was terminated before completing", exit.program),
        };
        let stderr = exit.stderr.trim();
        if !stderr.is_empty() {
            reason.push_str(": ");
            reason.push_str(stderr);
        }
        vec![ControlEvent::Rejected { reason }]
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}
