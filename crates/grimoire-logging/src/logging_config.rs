// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `[logging]` section of the Grimoire config file

use crate::{CliLogLevel, CliLoggingArgs, LogFormat};
use serde::{Deserialize, Serialize};

/// Logging settings read from a config file; command-line flags win
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(rename = "log-level")]
    pub level: Option<CliLogLevel>,
    #[serde(rename = "log-format")]
    pub format: Option<LogFormat>,
    #[serde(rename = "log-dir")]
    pub dir: Option<String>,
    #[serde(rename = "log-file")]
    pub file: Option<String>,
}

impl CliLoggingArgs {
    /// Fill unset flags from the config file
    pub fn with_config_defaults(mut self, config: &LoggingConfig) -> Self {
        self.log_level = self.log_level.or(config.level);
        self.log_format = self.log_format.or(config.format);
        self.log_dir = self.log_dir.or_else(|| config.dir.clone());
        self.log_file = self.log_file.or_else(|| config.file.clone());
        self
    }
}
