// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::Result;
use grimoire_cli::config::GrimoireConfig;
use grimoire_cli::{repl, Cli, Commands, Parser, COMPONENT};
use grimoire_session::Conversation;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GrimoireConfig::resolve(&cli)?;

    // Chat keeps logs off the terminal; one-shot commands log to stderr
    cli.logging
        .clone()
        .with_config_defaults(&config.logging)
        .init(COMPONENT, cli.is_interactive())?;

    let working_directory = cli.working_directory()?;
    info!(
        binary = %config.assistant.binary.display(),
        working_directory = %working_directory.display(),
        env = ?config.env_summary(),
        "Starting grimoire"
    );
    let conversation = Conversation::new(working_directory, config.assistant);

    match cli.command {
        Commands::Chat => repl::run_chat(conversation).await,
        Commands::Send(args) => {
            let mut stdout = std::io::stdout();
            args.run(conversation, &mut stdout).await
        }
    }
}
