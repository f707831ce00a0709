// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `grimoire send`: one turn, events printed as JSON lines

use anyhow::{bail, Result};
use futures::StreamExt;
use grimoire_session::{Conversation, TurnEvent};
use std::io::Write;
use tracing::info;

#[derive(clap::Args, Debug, Clone)]
pub struct SendArgs {
    /// Resume this session instead of starting a new one
    #[arg(long)]
    pub resume: Option<String>,

    /// Prompt text; words are joined with spaces
    #[arg(required = true, trailing_var_arg = true)]
    pub prompt: Vec<String>,
}

impl SendArgs {
    pub fn prompt_text(&self) -> String {
        self.prompt.join(" ")
    }

    /// Run the turn, writing every event to `out`.
    ///
    /// A turn that fails or is aborted is reported as an error after its
    /// events have been written.
    pub async fn run(&self, conversation: Conversation, out: &mut impl Write) -> Result<()> {
        let conversation = match &self.resume {
            Some(session_id) => conversation.with_session(session_id.clone()),
            None => conversation,
        };

        let prompt = self.prompt_text();
        info!(
            prompt = %grimoire_logging::prompt_summary(&prompt),
            resume = ?self.resume,
            "Sending prompt"
        );

        let mut turn = conversation.send_message(&prompt).await?;
        let mut terminal = None;
        while let Some(event) = turn.next().await {
            writeln!(out, "{}", serde_json::to_string(&event)?)?;
            if event.is_terminal() {
                terminal = Some(event);
            }
        }
        out.flush()?;

        match terminal {
            Some(TurnEvent::Result { .. }) => Ok(()),
            Some(TurnEvent::Failed { failure }) => bail!("Turn failed: {}", failure),
            Some(TurnEvent::Aborted) => bail!("Turn aborted"),
            _ => bail!("Turn ended without a terminal event"),
        }
    }
}
