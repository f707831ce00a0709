// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Conversation orchestrator: send, rewind, edit
//!
//! One [`Conversation`] owns one lineage. Operations that start a process
//! (sends, rewinds, edits) are serialized by a single-permit gate; a second
//! attempt while one is in flight fails with [`SessionError::LineageBusy`]
//! instead of queueing.
//!
//! Rewinds are all-or-nothing at the conversation level: the session id and
//! the checkpoint ledger change only after the control plane has confirmed
//! the rewind. File restoration is best effort and reported separately.

use crate::checkpoints::{Checkpoint, CheckpointTracker};
use crate::config::AssistantConfig;
use crate::control_plane::{CliControlPlane, ControlEvent, ControlPlane, RewindRequest};
use crate::error::{FileRewindUnavailableWarning, SessionError, SessionResult};
use crate::file_restore::{FileRestorer, FileSnapshot};
use crate::lineage::{LineageController, LineageSnapshot, LineageState};
use crate::transport::{ProcessTransport, TurnRequest, TurnTransport};
use crate::turn::{self, TurnStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mutable lineage state shared with running turn pumps
#[derive(Debug)]
pub(crate) struct LineageCore {
    pub(crate) controller: LineageController,
    pub(crate) tracker: CheckpointTracker,
    /// Bumped by `terminate`; pumps of older generations stop writing here
    pub(crate) generation: u64,
    pub(crate) active_turn: Option<CancellationToken>,
}

pub(crate) type SharedCore = Arc<Mutex<LineageCore>>;

pub(crate) fn lock_core(core: &SharedCore) -> MutexGuard<'_, LineageCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewindOptions {
    /// Continue on a new session id (default)
    pub fork: bool,
    /// Also restore files to their state at the checkpoint
    pub rewind_files: bool,
}

impl Default for RewindOptions {
    fn default() -> Self {
        Self {
            fork: true,
            rewind_files: false,
        }
    }
}

impl RewindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fork(mut self, fork: bool) -> Self {
        self.fork = fork;
        self
    }

    pub fn rewind_files(mut self, rewind_files: bool) -> Self {
        self.rewind_files = rewind_files;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOptions {
    pub rewind_files: bool,
}

/// Result of a successful rewind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewindOutcome {
    /// Authoritative session id after the rewind
    pub session_id: String,
    pub forked: bool,
    /// Ledger length after truncation
    pub checkpoints_kept: usize,
    /// Paths restored or removed during file rewind
    pub restored_files: Vec<PathBuf>,
    /// Set when file state was requested but could not be fully restored
    pub file_warning: Option<FileRewindUnavailableWarning>,
}

/// What the control plane reported for one rewind
#[derive(Debug, Default)]
struct ControlReport {
    new_session: Option<String>,
    restored: Vec<String>,
    snapshots: Vec<FileSnapshot>,
    unavailable: Option<String>,
    files_reported: bool,
}

/// Rolls a fork back to its source session unless disarmed
struct RewindGuard<'a> {
    core: &'a SharedCore,
    generation: u64,
    armed: bool,
}

impl RewindGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RewindGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut core = lock_core(self.core);
        if core.generation == self.generation {
            core.controller.abort_rewind();
        }
    }
}

/// One open conversation
pub struct Conversation {
    config: AssistantConfig,
    transport: Arc<dyn TurnTransport>,
    control_plane: Arc<dyn ControlPlane>,
    core: SharedCore,
    gate: Arc<Semaphore>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("config", &self.config)
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl Conversation {
    /// Conversation driven by the assistant binary described by `config`
    pub fn new(working_directory: impl Into<PathBuf>, config: AssistantConfig) -> Self {
        let transport = Arc::new(ProcessTransport::new(config.clone()));
        let control_plane = Arc::new(CliControlPlane::new(config.clone()));
        Self::with_collaborators(working_directory, config, transport, control_plane)
    }

    pub fn with_collaborators(
        working_directory: impl Into<PathBuf>,
        config: AssistantConfig,
        transport: Arc<dyn TurnTransport>,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Self {
        let controller = LineageController::new(working_directory, config.config_dir.clone());
        Self {
            config,
            transport,
            control_plane,
            core: Arc::new(Mutex::new(LineageCore {
                controller,
                tracker: CheckpointTracker::new(),
                generation: 0,
                active_turn: None,
            })),
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    /// Resume an existing session rather than starting fresh.
    ///
    /// The ledger starts empty: checkpoints from before this process are not known.
    pub fn with_session(self, session_id: impl Into<String>) -> Self {
        lock_core(&self.core).controller.adopt(session_id);
        self
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    pub fn working_directory(&self) -> PathBuf {
        lock_core(&self.core).controller.working_directory().to_path_buf()
    }

    pub fn session_id(&self) -> Option<String> {
        lock_core(&self.core).controller.session_id().map(str::to_string)
    }

    pub fn state(&self) -> LineageState {
        lock_core(&self.core).controller.state().clone()
    }

    pub fn snapshot(&self) -> LineageSnapshot {
        let core = lock_core(&self.core);
        core.controller.snapshot(core.tracker.len())
    }

    /// Rewind targets in causal order
    pub fn list_rewind_points(&self) -> Vec<Checkpoint> {
        lock_core(&self.core).tracker.list_checkpoints()
    }

    /// Whether a send, rewind or edit is in flight
    pub fn is_busy(&self) -> bool {
        self.gate.available_permits() == 0
    }

    /// Send one user turn.
    ///
    /// Fails immediately when the assistant cannot be started at all. Once the
    /// stream is returned, later failures arrive as its terminal event.
    pub async fn send_message(&self, text: &str) -> SessionResult<TurnStream> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyPrompt);
        }
        let permit = self.acquire()?;
        self.start_turn(text, permit).await
    }

    /// Rewind the conversation to `checkpoint`.
    ///
    /// On failure the session id and the ledger are exactly as before.
    pub async fn rewind(
        &self,
        checkpoint: &str,
        options: RewindOptions,
    ) -> SessionResult<RewindOutcome> {
        let _permit = self.acquire()?;
        self.rewind_held(checkpoint, options).await
    }

    /// Replace the user message at `checkpoint` with `text`: rewind (forking)
    /// to the checkpoint before it, then send `text`.
    pub async fn edit_message(
        &self,
        checkpoint: &str,
        text: &str,
        options: EditOptions,
    ) -> SessionResult<TurnStream> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyPrompt);
        }
        let permit = self.acquire()?;

        let prior = lock_core(&self.core).tracker.prior_to(checkpoint)?.uuid.clone();
        debug!(checkpoint, prior = %prior, "Editing message by rewinding to prior checkpoint");

        let outcome = self
            .rewind_held(
                &prior,
                RewindOptions {
                    fork: true,
                    rewind_files: options.rewind_files,
                },
            )
            .await?;
        if let Some(warning) = &outcome.file_warning {
            warn!(checkpoint = %warning.checkpoint, "Edit continues without file rewind: {}", warning.reason);
        }

        self.start_turn(text, permit).await
    }

    /// Reset to `Fresh`: abort any running turn and forget the ledger
    pub fn terminate(&self) {
        let mut core = lock_core(&self.core);
        core.generation += 1;
        if let Some(cancel) = core.active_turn.take() {
            cancel.cancel();
        }
        core.controller.terminate();
        core.tracker.clear();
        info!("Conversation reset");
    }

    fn acquire(&self) -> SessionResult<OwnedSemaphorePermit> {
        self.gate
            .clone()
            .try_acquire_owned()
            .map_err(|_| SessionError::LineageBusy)
    }

    async fn start_turn(&self, text: &str, permit: OwnedSemaphorePermit) -> SessionResult<TurnStream> {
        let (request, generation) = {
            let core = lock_core(&self.core);
            let request = TurnRequest {
                prompt: text.to_string(),
                resume_session_id: core.controller.session_id().map(str::to_string),
                working_directory: core.controller.working_directory().to_path_buf(),
                config_dir: core.controller.config_dir().map(PathBuf::from),
            };
            (request, core.generation)
        };

        let channel = match self.transport.spawn_turn(request).await {
            Ok(channel) => channel,
            Err(e) => {
                let mut core = lock_core(&self.core);
                if core.generation == generation {
                    core.controller.record_failure(e.to_string());
                }
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        {
            let mut core = lock_core(&self.core);
            if core.generation == generation {
                core.active_turn = Some(cancel.clone());
            } else {
                // Reset while the process was starting
                cancel.cancel();
            }
        }
        Ok(turn::start(self.core.clone(), generation, channel, cancel, permit))
    }

    /// Rewind with the gate already held by the caller
    async fn rewind_held(
        &self,
        checkpoint: &str,
        options: RewindOptions,
    ) -> SessionResult<RewindOutcome> {
        let (request, source_session, generation) = {
            let mut core = lock_core(&self.core);
            if core.tracker.position(checkpoint).is_none() {
                return Err(SessionError::CheckpointNotFound(checkpoint.to_string()));
            }
            let source_session = core.controller.begin_rewind(checkpoint, options.fork)?;
            let request = RewindRequest {
                session_id: source_session.clone(),
                checkpoint: checkpoint.to_string(),
                fork: options.fork,
                rewind_files: options.rewind_files,
                working_directory: core.controller.working_directory().to_path_buf(),
                config_dir: core.controller.config_dir().map(PathBuf::from),
                placeholder: self.config.rewind_placeholder.clone(),
            };
            (request, source_session, core.generation)
        };
        let mut guard = RewindGuard {
            core: &self.core,
            generation,
            armed: true,
        };

        info!(
            session_id = %source_session,
            checkpoint,
            fork = options.fork,
            rewind_files = options.rewind_files,
            "Rewinding conversation"
        );

        // With rewind_files the assistant restores its own tracked files in
        // this control session, before the conversation rewind is confirmed.
        // Only FileSnapshot events wait for the commit below.
        let report = self.run_control_plane(request).await.map_err(|e| {
            warn!(session_id = %source_session, checkpoint, "Rewind failed: {}", e);
            e
        })?;

        let session_id = if options.fork {
            match report.new_session.clone().filter(|id| *id != source_session) {
                Some(id) => id,
                None => {
                    return Err(SessionError::RewindFailed(
                        "fork completed without a new session id".to_string(),
                    ))
                }
            }
        } else {
            if let Some(reported) = &report.new_session {
                debug!(reported = %reported, "Ignoring session id reported by in-place rewind");
            }
            source_session.clone()
        };

        let checkpoints_kept = {
            let mut core = lock_core(&self.core);
            if core.generation != generation {
                return Err(SessionError::RewindFailed(
                    "conversation was reset while the rewind ran".to_string(),
                ));
            }
            let dropped = core.tracker.truncate_after(checkpoint)?;
            core.controller.complete_rewind(session_id.clone());
            guard.disarm();
            info!(
                from = %source_session,
                to = %session_id,
                dropped,
                "Rewind complete"
            );
            core.tracker.len()
        };

        let (restored_files, file_warning) = if options.rewind_files {
            self.restore_files(checkpoint, report).await
        } else {
            (Vec::new(), None)
        };

        Ok(RewindOutcome {
            session_id,
            forked: options.fork,
            checkpoints_kept,
            restored_files,
            file_warning,
        })
    }

    async fn run_control_plane(&self, request: RewindRequest) -> SessionResult<ControlReport> {
        let mut events = self
            .control_plane
            .open(request)
            .await
            .map_err(|e| SessionError::RewindFailed(format!("control plane unavailable: {e}")))?;

        let mut report = ControlReport::default();
        let mut completed = false;
        while let Some(event) = events.next().await {
            match event.map_err(|e| SessionError::RewindFailed(e.to_string()))? {
                ControlEvent::SessionAssigned { session_id } => report.new_session = Some(session_id),
                ControlEvent::FilesRestored { paths } => {
                    report.files_reported = true;
                    report.restored.extend(paths);
                }
                ControlEvent::FileSnapshot { path, content } => {
                    report.files_reported = true;
                    report.snapshots.push(FileSnapshot { path, content });
                }
                ControlEvent::FileRewindUnavailable { reason } => {
                    report.files_reported = true;
                    report.unavailable = Some(reason);
                }
                ControlEvent::Completed => completed = true,
                ControlEvent::Rejected { reason } => return Err(SessionError::RewindFailed(reason)),
            }
        }

        if !completed {
            return Err(SessionError::RewindFailed(
                "control plane ended without confirming the rewind".to_string(),
            ));
        }
        Ok(report)
    }

    async fn restore_files(
        &self,
        checkpoint: &str,
        report: ControlReport,
    ) -> (Vec<PathBuf>, Option<FileRewindUnavailableWarning>) {
        let mut restored: Vec<PathBuf> = report.restored.iter().map(PathBuf::from).collect();
        let mut problems = Vec::new();

        if let Some(reason) = report.unavailable {
            problems.push(reason);
        }
        if !report.snapshots.is_empty() {
            let restorer = FileRestorer::new(self.working_directory());
            let applied = restorer.apply(&report.snapshots).await;
            if !applied.is_clean() {
                problems.push(format!("not restored: {}", applied.refused_summary()));
            }
            restored.extend(applied.restored);
            restored.extend(applied.removed);
        }
        if !report.files_reported {
            problems.push("no file state was reported for this checkpoint".to_string());
        }

        let warning = (!problems.is_empty()).then(|| FileRewindUnavailableWarning {
            checkpoint: checkpoint.to_string(),
            reason: problems.join("; "),
        });
        if let Some(warning) = &warning {
            warn!(checkpoint, "File rewind incomplete: {}", warning.reason);
        }
        (restored, warning)
    }
}
