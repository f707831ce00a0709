// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use grimoire_logging::CliLoggingArgs;
use std::path::PathBuf;

pub use clap::Parser;

pub mod config;
pub mod repl;
pub mod send;

/// Log component name for the `grimoire` binary
pub const COMPONENT: &str = "grimoire";

#[derive(clap::Parser, Debug)]
#[command(
    name = "grimoire",
    about = "Drive an assistant conversation with rewind, fork and edit",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Config file (default: $GRIMOIRE_HOME/config.toml or the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Working directory for the assistant (default: current directory)
    #[arg(long, global = true)]
    pub cwd: Option<PathBuf>,

    /// Assistant binary name or path
    #[arg(long, global = true)]
    pub binary: Option<PathBuf>,

    /// Isolated assistant config directory
    #[arg(long = "config-dir", global = true)]
    pub config_dir: Option<PathBuf>,

    /// Model override passed to the assistant
    #[arg(long, global = true)]
    pub model: Option<String>,

    #[command(flatten)]
    pub logging: CliLoggingArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Interactive conversation; type /help for commands
    Chat,
    /// Send one prompt and print the turn's events as JSON lines
    Send(send::SendArgs),
}

impl Cli {
    pub fn is_interactive(&self) -> bool {
        matches!(self.command, Commands::Chat)
    }

    pub fn working_directory(&self) -> anyhow::Result<PathBuf> {
        match &self.cwd {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_with_globals() {
        let cli = Cli::try_parse_from([
            "grimoire",
            "--binary",
            "/opt/claude",
            "send",
            "--resume",
            "sess-1",
            "what",
            "is",
            "my",
            "name",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.binary, Some(PathBuf::from("/opt/claude")));
        assert_eq!(
            cli.logging.log_level,
            Some(grimoire_logging::CliLogLevel::Debug)
        );
        match cli.command {
            Commands::Send(args) => {
                assert_eq!(args.resume.as_deref(), Some("sess-1"));
                assert_eq!(args.prompt_text(), "what is my name");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_chat_is_interactive() {
        let cli = Cli::try_parse_from(["grimoire", "chat", "--cwd", "/tmp"]).unwrap();
        assert!(cli.is_interactive());
        assert_eq!(cli.working_directory().unwrap(), PathBuf::from("/tmp"));
    }

    #[test]
    fn test_send_requires_prompt() {
        assert!(Cli::try_parse_from(["grimoire", "send"]).is_err());
    }
}
