// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration file loading for the `grimoire` binary.
//!
//! Layers, lowest to highest: built-in defaults, the config file,
//! environment variables, command-line flags.

use crate::Cli;
use anyhow::{Context, Result};
use grimoire_logging::LoggingConfig;
use grimoire_session::AssistantConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory holding `config.toml`; overrides the platform config dir
pub const HOME_ENV: &str = "GRIMOIRE_HOME";
/// Assistant binary override
pub const ASSISTANT_BIN_ENV: &str = "GRIMOIRE_ASSISTANT_BIN";
/// Assistant config directory override
pub const CONFIG_DIR_ENV: &str = "GRIMOIRE_CONFIG_DIR";

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrimoireConfig {
    pub assistant: AssistantConfig,
    pub logging: LoggingConfig,
}

impl GrimoireConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read `explicit` if given (it must exist), else the default location if
    /// it exists, else built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.is_file() => path,
                _ => {
                    debug!("No config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Apply `GRIMOIRE_*` variables from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(binary) = lookup(ASSISTANT_BIN_ENV).filter(|v| !v.is_empty()) {
            self.assistant.binary = PathBuf::from(binary);
        }
        if let Some(dir) = lookup(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
            self.assistant.config_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn apply_flags(&mut self, cli: &Cli) {
        if let Some(binary) = &cli.binary {
            self.assistant.binary = binary.clone();
        }
        if let Some(dir) = &cli.config_dir {
            self.assistant.config_dir = Some(dir.clone());
        }
        if let Some(model) = &cli.model {
            self.assistant.model = Some(model.clone());
        }
    }

    /// Full resolution for a parsed command line
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut config = Self::load(cli.config.as_deref())?;
        config.apply_env();
        config.apply_flags(cli);
        Ok(config)
    }

    /// Assistant environment overrides with their values redacted
    pub fn env_summary(&self) -> Vec<String> {
        self.assistant
            .env
            .iter()
            .map(|(key, value)| format!("{key}={}", grimoire_logging::redact(value)))
            .collect()
    }
}

/// `$GRIMOIRE_HOME/config.toml`, else `<config dir>/grimoire/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(home).join(CONFIG_FILE));
    }
    dirs::config_dir().map(|dir| dir.join("grimoire").join(CONFIG_FILE))
}
