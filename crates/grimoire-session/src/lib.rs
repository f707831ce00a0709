// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session rewind/fork/edit core for Grimoire
//!
//! Drives an external assistant CLI one turn at a time, tracks the checkpoint
//! uuids it echoes for user messages, and rewinds (optionally forking, and
//! optionally restoring files) through the assistant's control plane.
//!
//! ```no_run
//! use futures::StreamExt;
//! use grimoire_session::{AssistantConfig, Conversation, RewindOptions};
//!
//! # async fn demo() -> grimoire_session::SessionResult<()> {
//! let conversation = Conversation::new("/path/to/project", AssistantConfig::default());
//! let mut turn = conversation.send_message("hello").await?;
//! while let Some(event) = turn.next().await {
//!     println!("{event:?}");
//! }
//!
//! let first = conversation.list_rewind_points()[0].uuid.clone();
//! let outcome = conversation.rewind(&first, RewindOptions::default()).await?;
//! println!("continuing on {}", outcome.session_id);
//! # Ok(())
//! # }
//! ```

pub mod checkpoints;
pub mod config;
pub mod control_plane;
pub mod conversation;
pub mod decoder;
pub mod error;
pub mod events;
pub mod file_restore;
pub mod lineage;
pub mod transport;
pub mod turn;

pub use checkpoints::{Checkpoint, CheckpointTracker};
pub use config::AssistantConfig;
pub use control_plane::{CliControlPlane, ControlEvent, ControlPlane, ControlStream, RewindRequest};
pub use conversation::{Conversation, EditOptions, RewindOptions, RewindOutcome};
pub use decoder::StreamDecoder;
pub use error::{DecodeError, FileRewindUnavailableWarning, SessionError, SessionResult};
pub use events::{
    ContentBlock, ExitState, ResultMetrics, ToolActivityKind, TurnEvent, TurnFailure,
    TurnFailureKind,
};
pub use file_restore::{FileRestorer, FileSnapshot, RestoreReport};
pub use lineage::{LineageController, LineageSnapshot, LineageState};
pub use transport::{ProcessTransport, TurnChannel, TurnExit, TurnRequest, TurnTransport};
pub use turn::{AbortHandle, TurnStream, TurnTranscript};
