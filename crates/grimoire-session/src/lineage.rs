// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session lineage state
//!
//! A lineage is the chain of assistant session ids one conversation has
//! occupied: a fork moves it onto a new id, an in-place rewind keeps the id.
//!
//! ```text
//! Fresh --first session marker--> Active
//! Active --rewind(fork)--> Forking --success--> Active(new id)
//!                                  --failure--> Active(old id)
//! Fresh --send fails--> Error --next session marker--> Active
//! any --terminate--> Fresh
//! ```

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LineageState {
    /// No session id yet
    Fresh,
    Active {
        session_id: String,
    },
    /// A forking rewind is in flight from `session_id` at `checkpoint`
    Forking {
        session_id: String,
        checkpoint: String,
    },
    /// The lineage never got a session; the last attempt failed
    Error {
        last_error: String,
    },
}

/// Point-in-time view of a lineage, for display and diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageSnapshot {
    pub state: LineageState,
    pub session_id: Option<String>,
    pub working_directory: PathBuf,
    pub config_dir: Option<PathBuf>,
    pub checkpoints: usize,
}

#[derive(Debug, Clone)]
pub struct LineageController {
    working_directory: PathBuf,
    config_dir: Option<PathBuf>,
    state: LineageState,
}

impl LineageController {
    pub fn new(working_directory: impl Into<PathBuf>, config_dir: Option<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            config_dir,
            state: LineageState::Fresh,
        }
    }

    pub fn state(&self) -> &LineageState {
        &self.state
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn config_dir(&self) -> Option<&Path> {
        self.config_dir.as_deref()
    }

    /// Current session id; while forking this is still the source session
    pub fn session_id(&self) -> Option<&str> {
        match &self.state {
            LineageState::Active { session_id } | LineageState::Forking { session_id, .. } => {
                Some(session_id)
            }
            LineageState::Fresh | LineageState::Error { .. } => None,
        }
    }

    /// Resume an existing session instead of starting fresh
    pub fn adopt(&mut self, session_id: impl Into<String>) {
        self.state = LineageState::Active {
            session_id: session_id.into(),
        };
    }

    /// Apply a session marker seen on a turn's output stream
    pub fn observe_session(&mut self, session_id: &str) {
        match &self.state {
            LineageState::Active { session_id: current } if current == session_id => {}
            LineageState::Forking { .. } => {
                debug!(session_id, "Ignoring session marker while a fork is in flight");
            }
            LineageState::Active { session_id: current } => {
                info!(from = %current, to = session_id, "Assistant reassigned the session id");
                self.adopt(session_id);
            }
            LineageState::Fresh | LineageState::Error { .. } => {
                info!(session_id, "Session established");
                self.adopt(session_id);
            }
        }
    }

    /// Record a failed send. Only a lineage without a session enters `Error`.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        if matches!(self.state, LineageState::Fresh | LineageState::Error { .. }) {
            self.state = LineageState::Error {
                last_error: message.into(),
            };
        }
    }

    /// Start a rewind at `checkpoint`, returning the source session id
    pub fn begin_rewind(&mut self, checkpoint: &str, fork: bool) -> SessionResult<String> {
        let session_id = match &self.state {
            LineageState::Active { session_id } => session_id.clone(),
            LineageState::Forking { .. } => return Err(SessionError::LineageBusy),
            LineageState::Fresh | LineageState::Error { .. } => {
                return Err(SessionError::NoActiveSession)
            }
        };
        if fork {
            self.state = LineageState::Forking {
                session_id: session_id.clone(),
                checkpoint: checkpoint.to_string(),
            };
        }
        Ok(session_id)
    }

    /// Finish a rewind; the lineage continues on `session_id`
    pub fn complete_rewind(&mut self, session_id: impl Into<String>) {
        self.adopt(session_id);
    }

    /// Roll a failed fork back to its source session
    pub fn abort_rewind(&mut self) {
        if let LineageState::Forking { session_id, .. } = &self.state {
            self.state = LineageState::Active {
                session_id: session_id.clone(),
            };
        }
    }

    pub fn terminate(&mut self) {
        self.state = LineageState::Fresh;
    }

    pub fn snapshot(&self, checkpoints: usize) -> LineageSnapshot {
        LineageSnapshot {
            state: self.state.clone(),
            session_id: self.session_id().map(str::to_string),
            working_directory: self.working_directory.clone(),
            config_dir: self.config_dir.clone(),
            checkpoints,
        }
    }
}
