// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Assistant process configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Binary looked up on PATH when nothing else is configured
pub const DEFAULT_BINARY: &str = "claude";

/// Environment variable that isolates the assistant's config/credential directory
pub const CONFIG_DIR_ENV: &str = "CLAUDE_CONFIG_DIR";

/// Environment flag that makes the assistant record file checkpoints per user turn
pub const FILE_CHECKPOINTING_ENV: &str = "CLAUDE_CODE_ENABLE_SDK_FILE_CHECKPOINTING";

/// Turn text sent through the control plane so the assistant actually executes a rewind
pub const DEFAULT_REWIND_PLACEHOLDER: &str = "continue";

/// How to launch and drive the external assistant process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AssistantConfig {
    /// Binary name (looked up on PATH) or explicit path
    pub binary: PathBuf,

    /// Extra arguments appended after the generated ones
    pub extra_args: Vec<String>,

    /// Pass the permission-bypass flag (required for unattended driving)
    pub bypass_permissions: bool,

    /// Optional model override
    pub model: Option<String>,

    /// Isolated configuration directory, exported as `CLAUDE_CONFIG_DIR`
    pub config_dir: Option<PathBuf>,

    /// Additional environment variables
    pub env: BTreeMap<String, String>,

    /// Ask the assistant to keep file checkpoints so file state can be rewound
    pub file_checkpointing: bool,

    /// Placeholder turn the control plane sends to execute a rewind.
    ///
    /// The collaborator does not apply a resume-at-checkpoint until a turn runs.
    /// Whether this is essential or an artifact of the current control plane is
    /// unconfirmed, so it stays an explicit step.
    pub rewind_placeholder: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_BINARY),
            extra_args: Vec::new(),
            bypass_permissions: true,
            model: None,
            config_dir: None,
            env: BTreeMap::new(),
            file_checkpointing: true,
            rewind_placeholder: DEFAULT_REWIND_PLACEHOLDER.to_string(),
        }
    }
}

impl AssistantConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn bypass_permissions(mut self, bypass: bool) -> Self {
        self.bypass_permissions = bypass;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn file_checkpointing(mut self, enabled: bool) -> Self {
        self.file_checkpointing = enabled;
        self
    }

    pub fn rewind_placeholder(mut self, text: impl Into<String>) -> Self {
        self.rewind_placeholder = text.into();
        self
    }

    /// Arguments shared by turn and control-plane invocations: print mode with
    /// structured streaming on both ends and user-message replay (which is what
    /// makes checkpoint uuids visible).
    pub fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--replay-user-messages".to_string(),
        ];
        if self.bypass_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }

    /// Apply the environment contract to a command.
    ///
    /// `config_dir` overrides the configured directory for a single lineage.
    pub fn apply_env(&self, cmd: &mut Command, config_dir: Option<&Path>) {
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = config_dir.or(self.config_dir.as_deref()) {
            cmd.env(CONFIG_DIR_ENV, dir);
        }
        if self.file_checkpointing {
            cmd.env(FILE_CHECKPOINTING_ENV, "1");
        }
    }
}
