// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process scripted assistant used by the integration tests.
//!
//! Implements both the turn transport and the rewind control plane over a
//! shared model of sessions, so conversations can be driven end to end
//! without the real binary. Understands a few prompt shapes:
//!
//! - `my name is X` / `what is my name`
//! - `write <path> <content>` (performs the write in the working directory)
//! - anything else is echoed back

#![allow(dead_code)]

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use grimoire_session::{
    AssistantConfig, ControlEvent, ControlPlane, ControlStream, Conversation, RewindRequest,
    SessionError, SessionResult, TurnChannel, TurnExit, TurnRequest, TurnTransport,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct FakeTurn {
    pub uuid: String,
    pub prompt: String,
    /// path -> (content before the turn, content after the turn)
    pub touched: BTreeMap<String, (Option<String>, Option<String>)>,
}

#[derive(Debug, Default)]
struct FakeState {
    next_id: u64,
    sessions: HashMap<String, Vec<FakeTurn>>,
    turn_requests: Vec<TurnRequest>,
    rewind_requests: Vec<RewindRequest>,
    fail_rewinds: bool,
    files_unavailable: bool,
    inject_malformed_line: bool,
    stall_after_echo: bool,
}

impl FakeState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeAssistant {
    state: Arc<Mutex<FakeState>>,
}

impl FakeAssistant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation(&self, working_directory: &Path) -> Conversation {
        Conversation::with_collaborators(
            working_directory,
            AssistantConfig::default(),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    pub fn fail_rewinds(&self, fail: bool) {
        self.state.lock().unwrap().fail_rewinds = fail;
    }

    pub fn files_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().files_unavailable = unavailable;
    }

    pub fn inject_malformed_line(&self, inject: bool) {
        self.state.lock().unwrap().inject_malformed_line = inject;
    }

    /// Stop turns right after the user echo and keep them open until aborted
    pub fn stall_after_echo(&self, stall: bool) {
        self.state.lock().unwrap().stall_after_echo = stall;
    }

    pub fn turn_requests(&self) -> Vec<TurnRequest> {
        self.state.lock().unwrap().turn_requests.clone()
    }

    pub fn rewind_requests(&self) -> Vec<RewindRequest> {
        self.state.lock().unwrap().rewind_requests.clone()
    }

    /// Prompts the assistant remembers for `session_id`
    pub fn history(&self, session_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .map(|turns| turns.iter().map(|t| t.prompt.clone()).collect())
            .unwrap_or_default()
    }
}

fn reply(history: &[FakeTurn], prompt: &str) -> String {
    let lower = prompt.to_lowercase();
    if lower.contains("what is my name") {
        let name = history.iter().rev().find_map(|turn| {
            let lower = turn.prompt.to_lowercase();
            lower
                .find("my name is ")
                .map(|at| turn.prompt[at + "my name is ".len()..].trim().to_string())
        });
        return match name {
            Some(name) => format!("Your name is {name}."),
            None => "I don't know your name yet.".to_string(),
        };
    }
    if let Some(at) = lower.find("my name is ") {
        return format!("Nice to meet you, {}!", prompt[at + "my name is ".len()..].trim());
    }
    format!("ok: {prompt}")
}

fn apply_write(working_directory: &Path, prompt: &str) -> Option<(String, Option<String>, String)> {
    let rest = prompt.strip_prefix("write ")?;
    let (path, content) = rest.split_once(' ')?;
    let target = working_directory.join(path);
    let before = std::fs::read_to_string(&target).ok();
    std::fs::write(&target, content).ok()?;
    Some((path.to_string(), before, content.to_string()))
}

#[async_trait]
impl TurnTransport for FakeAssistant {
    async fn spawn_turn(&self, request: TurnRequest) -> SessionResult<TurnChannel> {
        let mut state = self.state.lock().unwrap();
        state.turn_requests.push(request.clone());

        let session_id = match &request.resume_session_id {
            Some(id) if state.sessions.contains_key(id) => id.clone(),
            Some(id) => {
                return Err(SessionError::process_launch(
                    "fake-assistant",
                    format!("No conversation found with session ID: {id}"),
                ))
            }
            None => {
                let id = state.next("sess");
                state.sessions.insert(id.clone(), Vec::new());
                id
            }
        };
        let uuid = state.next("msg");
        let inject_malformed = state.inject_malformed_line;
        let stall = state.stall_after_echo;

        let history = state.sessions.get(&session_id).cloned().unwrap_or_default();
        let answer = reply(&history, &request.prompt);

        let mut lines = vec![
            json!({"type": "system", "subtype": "init", "session_id": session_id}).to_string(),
            json!({
                "type": "user", "session_id": session_id, "uuid": uuid,
                "message": {"role": "user", "content": [{"type": "text", "text": request.prompt}]}
            })
            .to_string(),
        ];
        if stall {
            // The assistant has already stored the user message
            if let Some(turns) = state.sessions.get_mut(&session_id) {
                turns.push(FakeTurn {
                    uuid,
                    prompt: request.prompt.clone(),
                    touched: BTreeMap::new(),
                });
            }
            return Ok(TurnChannel {
                lines: futures::stream::iter(lines.into_iter().map(Ok))
                    .chain(futures::stream::pending())
                    .boxed(),
                completion: futures::future::pending().boxed(),
            });
        }
        if inject_malformed {
            lines.push("{\"type\": \"assistant\", \"message\": {".to_string());
        }

        let mut touched = BTreeMap::new();
        if let Some((path, before, after)) = apply_write(&request.working_directory, &request.prompt) {
            lines.push(
                json!({
                    "type": "assistant", "session_id": session_id,
                    "message": {"content": [{"type": "tool_use", "id": "toolu_1", "name": "Write",
                        "input": {"file_path": path, "content": after}}]}
                })
                .to_string(),
            );
            lines.push(
                json!({
                    "type": "user", "session_id": session_id,
                    "message": {"role": "user", "content": [{"type": "tool_result",
                        "tool_use_id": "toolu_1", "content": "written"}]}
                })
                .to_string(),
            );
            touched.insert(path, (before, Some(after)));
        }

        lines.push(
            json!({
                "type": "assistant", "session_id": session_id,
                "message": {"content": [{"type": "text", "text": answer}]}
            })
            .to_string(),
        );
        lines.push(
            json!({
                "type": "result", "subtype": "success", "is_error": false,
                "result": answer, "session_id": session_id, "num_turns": 1
            })
            .to_string(),
        );

        if let Some(turns) = state.sessions.get_mut(&session_id) {
            turns.push(FakeTurn {
                uuid,
                prompt: request.prompt.clone(),
                touched,
            });
        }

        Ok(TurnChannel {
            lines: futures::stream::iter(lines.into_iter().map(Ok)).boxed(),
            completion: futures::future::ready(Ok(TurnExit {
                program: "fake-assistant".to_string(),
                code: Some(0),
                stderr: String::new(),
            }))
            .boxed(),
        })
    }
}

#[async_trait]
impl ControlPlane for FakeAssistant {
    async fn open(&self, request: RewindRequest) -> SessionResult<ControlStream> {
        let mut state = self.state.lock().unwrap();
        state.rewind_requests.push(request.clone());

        let mut events = Vec::new();
        let history = state.sessions.get(&request.session_id).cloned();
        let index = history
            .as_ref()
            .and_then(|turns| turns.iter().position(|t| t.uuid == request.checkpoint));

        let (history, index) = match (history, index) {
            _ if state.fail_rewinds => {
                events.push(ControlEvent::Rejected {
                    reason: "control plane unavailable".to_string(),
                });
                return Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed());
            }
            (Some(history), Some(index)) => (history, index),
            _ => {
                events.push(ControlEvent::Rejected {
                    reason: format!("message {} not found", request.checkpoint),
                });
                return Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed());
            }
        };

        let kept = history[..=index].to_vec();
        if request.fork {
            let new_id = state.next("sess");
            state.sessions.insert(new_id.clone(), kept);
            events.push(ControlEvent::SessionAssigned { session_id: new_id });
        } else {
            state.sessions.insert(request.session_id.clone(), kept);
        }

        if request.rewind_files {
            if state.files_unavailable {
                events.push(ControlEvent::FileRewindUnavailable {
                    reason: "file checkpointing was not enabled for this session".to_string(),
                });
            } else {
                // Earliest "before" of each path touched after the checkpoint
                let mut restore: BTreeMap<String, Option<String>> = BTreeMap::new();
                for turn in &history[index + 1..] {
                    for (path, (before, _)) in &turn.touched {
                        restore.entry(path.clone()).or_insert_with(|| before.clone());
                    }
                }
                if restore.is_empty() {
                    events.push(ControlEvent::FilesRestored { paths: Vec::new() });
                }
                for (path, content) in restore {
                    events.push(ControlEvent::FileSnapshot { path, content });
                }
            }
        }

        events.push(ControlEvent::Completed);
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }
}
