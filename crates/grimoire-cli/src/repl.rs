// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `grimoire chat`: a line-oriented loop over one conversation.
//!
//! Plain lines are prompts. Lines starting with `/` are commands; `//` sends
//! a prompt that starts with a literal slash. Ctrl-C aborts the running turn.

use anyhow::Result;
use futures::StreamExt;
use grimoire_session::{
    Checkpoint, Conversation, EditOptions, ExitState, LineageState, RewindOptions, SessionError,
    ToolActivityKind, TurnEvent, TurnStream,
};
use std::io::Write;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

pub const HELP: &str = "\
Commands:
  /checkpoints                          list rewind points
  /rewind <n|uuid> [--no-fork] [--files] rewind to a checkpoint
  /edit <n|uuid> [--files] <text>       replace a message and resend
  /session                              show the current session
  /reset                                start a new conversation
  /help                                 show this help
  /quit                                 exit
";

/// A checkpoint named by 1-based position or by uuid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointRef {
    Index(usize),
    Uuid(String),
}

impl CheckpointRef {
    pub fn parse(token: &str) -> Self {
        match token.parse::<usize>() {
            Ok(index) => CheckpointRef::Index(index),
            Err(_) => CheckpointRef::Uuid(token.to_string()),
        }
    }

    /// Uuids pass through unchecked; the conversation validates them
    pub fn resolve(&self, checkpoints: &[Checkpoint]) -> Result<String, CommandError> {
        match self {
            CheckpointRef::Uuid(uuid) => Ok(uuid.clone()),
            CheckpointRef::Index(index) => index
                .checked_sub(1)
                .and_then(|i| checkpoints.get(i))
                .map(|c| c.uuid.clone())
                .ok_or(CommandError::NoSuchCheckpoint {
                    index: *index,
                    available: checkpoints.len(),
                }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Unknown command /{0}; try /help")]
    UnknownCommand(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Unknown option {option} for /{command}")]
    UnknownOption {
        command: &'static str,
        option: String,
    },

    #[error("No checkpoint #{index}; {available} available")]
    NoSuchCheckpoint { index: usize, available: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Prompt(String),
    Checkpoints,
    Rewind {
        target: CheckpointRef,
        options: RewindOptions,
    },
    Edit {
        target: CheckpointRef,
        text: String,
        files: bool,
    },
    Session,
    Reset,
    Help,
    Quit,
}

/// Parse one input line; blank lines yield `None`
pub fn parse_command(line: &str) -> Result<Option<ReplCommand>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if let Some(literal) = line.strip_prefix("//") {
        return Ok(Some(ReplCommand::Prompt(format!("/{literal}"))));
    }
    let Some(command_line) = line.strip_prefix('/') else {
        return Ok(Some(ReplCommand::Prompt(line.to_string())));
    };

    let (name, rest) = match command_line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command_line, ""),
    };

    let command = match name {
        "checkpoints" | "cp" => ReplCommand::Checkpoints,
        "session" => ReplCommand::Session,
        "reset" => ReplCommand::Reset,
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" | "q" => ReplCommand::Quit,
        "rewind" => parse_rewind(rest)?,
        "edit" => {
            const USAGE: &str = "/edit <n|uuid> [--files] <text>";
            let (target, text) = rest
                .split_once(char::is_whitespace)
                .ok_or(CommandError::Usage(USAGE))?;
            let mut text = text.trim();
            // Only a leading --files is a flag; the rest is message text
            let files = match text.split_once(char::is_whitespace) {
                Some(("--files", after)) => {
                    text = after.trim_start();
                    true
                }
                None if text == "--files" => {
                    text = "";
                    true
                }
                _ => false,
            };
            if text.is_empty() {
                return Err(CommandError::Usage(USAGE));
            }
            ReplCommand::Edit {
                target: CheckpointRef::parse(target),
                text: text.to_string(),
                files,
            }
        }
        other => return Err(CommandError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

fn parse_rewind(rest: &str) -> Result<ReplCommand, CommandError> {
    const USAGE: &str = "/rewind <n|uuid> [--no-fork] [--files]";
    let mut target = None;
    let mut options = RewindOptions::default();
    for token in rest.split_whitespace() {
        match token {
            "--no-fork" => options.fork = false,
            "--files" => options.rewind_files = true,
            flag if flag.starts_with("--") => {
                return Err(CommandError::UnknownOption {
                    command: "rewind",
                    option: flag.to_string(),
                })
            }
            _ if target.is_some() => return Err(CommandError::Usage(USAGE)),
            value => target = Some(CheckpointRef::parse(value)),
        }
    }
    let target = target.ok_or(CommandError::Usage(USAGE))?;
    Ok(ReplCommand::Rewind { target, options })
}

/// Text shown for one event in chat, if any
pub fn render_event(event: &TurnEvent) -> Option<String> {
    match event {
        TurnEvent::AssistantChunk { content, .. } if !content.is_empty() => {
            Some(format!("{content}\n"))
        }
        TurnEvent::ToolActivity {
            kind: ToolActivityKind::Use,
            payload,
        } => {
            let name = payload.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
            Some(format!("[tool] {name}\n"))
        }
        TurnEvent::Result {
            exit_state: ExitState::Error { subtype },
            text,
            ..
        } => Some(format!("[error: {subtype}] {text}\n")),
        TurnEvent::Aborted => Some("[aborted]\n".to_string()),
        TurnEvent::Failed { failure } => Some(format!("[failed] {failure}\n")),
        _ => None,
    }
}

fn describe_state(state: &LineageState) -> String {
    match state {
        LineageState::Fresh => "fresh (no session yet)".to_string(),
        LineageState::Active { session_id } => format!("active on {session_id}"),
        LineageState::Forking {
            session_id,
            checkpoint,
        } => format!("forking {session_id} at {checkpoint}"),
        LineageState::Error { last_error } => format!("error: {last_error}"),
    }
}

pub struct Chat<W: Write> {
    conversation: Conversation,
    out: W,
}

impl<W: Write> Chat<W> {
    pub fn new(conversation: Conversation, out: W) -> Self {
        Self { conversation, out }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Read commands until `/quit` or end of input
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> Result<()> {
        let mut lines = input.lines();
        self.prompt_marker()?;
        while let Some(line) = lines.next_line().await? {
            let keep_going = match parse_command(&line) {
                Ok(Some(command)) => self.execute(command).await?,
                Ok(None) => true,
                Err(err) => {
                    writeln!(self.out, "{err}")?;
                    true
                }
            };
            if !keep_going {
                break;
            }
            self.prompt_marker()?;
        }
        Ok(())
    }

    /// Run one command; `Ok(false)` means quit.
    ///
    /// Session errors are printed and the loop continues.
    pub async fn execute(&mut self, command: ReplCommand) -> Result<bool> {
        debug!(?command, "Executing chat command");
        let outcome = match command {
            ReplCommand::Quit => return Ok(false),
            ReplCommand::Help => {
                write!(self.out, "{HELP}")?;
                Ok(())
            }
            ReplCommand::Checkpoints => self.list_checkpoints(),
            ReplCommand::Session => {
                let snapshot = self.conversation.snapshot();
                writeln!(
                    self.out,
                    "{} in {} ({} checkpoints)",
                    describe_state(&snapshot.state),
                    snapshot.working_directory.display(),
                    snapshot.checkpoints
                )?;
                Ok(())
            }
            ReplCommand::Reset => {
                self.conversation.terminate();
                writeln!(self.out, "Started a new conversation")?;
                Ok(())
            }
            ReplCommand::Prompt(text) => match self.conversation.send_message(&text).await {
                Ok(turn) => self.stream_turn(turn).await,
                Err(err) => self.report(err),
            },
            ReplCommand::Rewind { target, options } => self.rewind(target, options).await,
            ReplCommand::Edit {
                target,
                text,
                files,
            } => self.edit(target, &text, files).await,
        };
        outcome.map(|()| true)
    }

    fn prompt_marker(&mut self) -> Result<()> {
        write!(self.out, "> ")?;
        self.out.flush()?;
        Ok(())
    }

    fn list_checkpoints(&mut self) -> Result<()> {
        let checkpoints = self.conversation.list_rewind_points();
        if checkpoints.is_empty() {
            writeln!(self.out, "No checkpoints yet")?;
        }
        for (i, checkpoint) in checkpoints.iter().enumerate() {
            writeln!(
                self.out,
                "{:>3}  {}  {}",
                i + 1,
                checkpoint.uuid,
                checkpoint.observed_at.format("%H:%M:%S")
            )?;
        }
        Ok(())
    }

    async fn rewind(&mut self, target: CheckpointRef, options: RewindOptions) -> Result<()> {
        let uuid = match target.resolve(&self.conversation.list_rewind_points()) {
            Ok(uuid) => uuid,
            Err(err) => {
                writeln!(self.out, "{err}")?;
                return Ok(());
            }
        };

        match self.conversation.rewind(&uuid, options).await {
            Ok(outcome) => {
                writeln!(
                    self.out,
                    "Rewound to #{} ({}); {} session {}",
                    outcome.checkpoints_kept,
                    uuid,
                    if outcome.forked { "forked to" } else { "kept" },
                    outcome.session_id
                )?;
                for path in &outcome.restored_files {
                    writeln!(self.out, "  restored {}", path.display())?;
                }
                if let Some(warning) = &outcome.file_warning {
                    writeln!(self.out, "warning: {warning}")?;
                }
                Ok(())
            }
            Err(err) => self.report(err),
        }
    }

    async fn edit(&mut self, target: CheckpointRef, text: &str, files: bool) -> Result<()> {
        let uuid = match target.resolve(&self.conversation.list_rewind_points()) {
            Ok(uuid) => uuid,
            Err(err) => {
                writeln!(self.out, "{err}")?;
                return Ok(());
            }
        };

        match self
            .conversation
            .edit_message(&uuid, text, EditOptions { rewind_files: files })
            .await
        {
            Ok(turn) => self.stream_turn(turn).await,
            Err(err) => self.report(err),
        }
    }

    async fn stream_turn(&mut self, mut turn: TurnStream) -> Result<()> {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;

        loop {
            tokio::select! {
                event = turn.next() => {
                    let Some(event) = event else { break };
                    if let Some(text) = render_event(&event) {
                        write!(self.out, "{text}")?;
                        self.out.flush()?;
                    }
                }
                _ = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    turn.abort();
                }
            }
        }
        Ok(())
    }

    fn report(&mut self, err: SessionError) -> Result<()> {
        warn!(error = %err, "Chat command failed");
        writeln!(self.out, "error: {err}")?;
        Ok(())
    }
}

/// Chat over stdin/stdout
pub async fn run_chat(conversation: Conversation) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut chat = Chat::new(conversation, std::io::stdout());
    chat.run(stdin).await
}
