// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-turn event stream
//!
//! A pump task reads the transport's lines, decodes them, feeds session
//! markers and user echoes into the lineage, and forwards events through a
//! bounded channel. The caller holds a [`TurnStream`], which is finite and
//! ends with exactly one terminal event.

use crate::conversation::{lock_core, SharedCore};
use crate::decoder::StreamDecoder;
use crate::events::{TurnEvent, TurnFailure, TurnFailureKind};
use crate::transport::TurnChannel;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events buffered between the pump and a slow consumer
const TURN_EVENT_BUFFER: usize = 64;

/// Lazy, finite event sequence for one turn
#[derive(Debug)]
pub struct TurnStream {
    rx: mpsc::Receiver<TurnEvent>,
    cancel: CancellationToken,
}

/// Cloneable handle that aborts a running turn from elsewhere
#[derive(Debug, Clone)]
pub struct AbortHandle {
    cancel: CancellationToken,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl TurnStream {
    /// Kill the assistant process; the stream then ends with `Aborted`
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Drain the stream
    pub async fn collect_turn(mut self) -> TurnTranscript {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        TurnTranscript { events }
    }
}

impl Stream for TurnStream {
    type Item = TurnEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Every event of one finished turn
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnTranscript {
    pub events: Vec<TurnEvent>,
}

impl TurnTranscript {
    /// Text of the `Result` record, if the turn completed
    pub fn final_text(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|event| match event {
            TurnEvent::Result { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Last session id announced during the turn
    pub fn session_id(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|event| match event {
            TurnEvent::SessionMarker { session_id } => Some(session_id.as_str()),
            _ => None,
        })
    }

    pub fn assistant_text(&self) -> String {
        self.events
            .iter()
            .filter_map(|event| match event {
                TurnEvent::AssistantChunk { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn checkpoints(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                TurnEvent::UserEcho { uuid: Some(uuid), .. } => Some(uuid.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn terminal(&self) -> Option<&TurnEvent> {
        self.events.last().filter(|event| event.is_terminal())
    }

    pub fn failure(&self) -> Option<&TurnFailure> {
        match self.terminal() {
            Some(TurnEvent::Failed { failure }) => Some(failure),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.terminal(), Some(TurnEvent::Aborted))
    }
}

/// Start pumping `channel` into a new [`TurnStream`].
///
/// `permit` is the lineage gate; it is released once the turn has ended and
/// before the terminal event is delivered.
pub(crate) fn start(
    core: SharedCore,
    generation: u64,
    channel: TurnChannel,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
) -> TurnStream {
    let (tx, rx) = mpsc::channel(TURN_EVENT_BUFFER);
    let pump = TurnPump {
        core,
        generation,
        tx,
        cancel: cancel.clone(),
        permit,
    };
    tokio::spawn(pump.run(channel));
    TurnStream { rx, cancel }
}

enum PumpOutcome {
    Aborted,
    Dropped,
    Finished(Option<TurnEvent>),
}

struct TurnPump {
    core: SharedCore,
    generation: u64,
    tx: mpsc::Sender<TurnEvent>,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
}

impl TurnPump {
    async fn run(self, channel: TurnChannel) {
        let TurnPump {
            core,
            generation,
            tx,
            cancel,
            permit,
        } = self;

        // Losing the select drops `channel`, which kills the process
        let mut held_result = None;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => PumpOutcome::Aborted,
            _ = tx.closed() => PumpOutcome::Dropped,
            terminal = forward(&core, generation, channel, &tx, &mut held_result) => {
                PumpOutcome::Finished(terminal)
            }
        };

        let terminal = match outcome {
            // The assistant already reported its result; the turn completed
            PumpOutcome::Aborted if held_result.is_some() => {
                info!("Abort arrived after the turn's result; delivering the result");
                held_result
            }
            PumpOutcome::Aborted => {
                info!("Turn aborted");
                Some(TurnEvent::Aborted)
            }
            PumpOutcome::Dropped => {
                debug!("Turn stream dropped; stopping assistant");
                None
            }
            PumpOutcome::Finished(terminal) => terminal,
        };

        {
            let mut core = lock_core(&core);
            if core.generation == generation {
                core.active_turn = None;
                if let Some(TurnEvent::Failed { failure }) = &terminal {
                    core.controller.record_failure(failure.to_string());
                }
            }
        }
        drop(permit);

        if let Some(event) = terminal {
            let _ = tx.send(event).await;
        }
    }
}

/// Forward decoded events until the process closes its output; returns the
/// terminal event, or `None` if the consumer went away.
async fn forward(
    core: &SharedCore,
    generation: u64,
    mut channel: TurnChannel,
    tx: &mpsc::Sender<TurnEvent>,
    held_result: &mut Option<TurnEvent>,
) -> Option<TurnEvent> {
    let mut decoder = StreamDecoder::new();
    let mut produced_output = false;

    while let Some(line) = channel.lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                return Some(TurnEvent::Failed {
                    failure: TurnFailure::new(
                        TurnFailureKind::Transport,
                        format!("reading assistant output failed: {e}"),
                    ),
                })
            }
        };

        let events = match decoder.decode_line(&line) {
            Ok(events) => events,
            Err(e) => {
                warn!(line = %e.line, "Skipping undecodable stream record: {}", e.message);
                continue;
            }
        };

        for event in events {
            produced_output = true;
            observe(core, generation, &event);
            if matches!(event, TurnEvent::Result { .. }) {
                // Held back so it is delivered after the gate is released
                *held_result = Some(event);
                continue;
            }
            if tx.send(event).await.is_err() {
                return None;
            }
        }
    }

    let exit = channel.completion.await;
    if let Some(result) = held_result.take() {
        return Some(result);
    }

    let failure = match exit {
        Ok(exit) if !produced_output && !exit.success() => TurnFailure::new(
            TurnFailureKind::ProcessLaunch,
            match exit.code {
                Some(code) => format!("{} exited with status {} and no output", exit.program, code),
                None => format!("{} was terminated before producing output", exit.program),
            },
        )
        .with_stderr(exit.stderr),
        Ok(exit) => TurnFailure::new(
            TurnFailureKind::Incomplete,
            "assistant exited before reporting a result",
        )
        .with_stderr(exit.stderr),
        Err(e) => TurnFailure::new(TurnFailureKind::Transport, e.to_string()),
    };
    warn!(kind = ?failure.kind, "Turn failed: {}", failure);
    Some(TurnEvent::Failed { failure })
}

fn observe(core: &SharedCore, generation: u64, event: &TurnEvent) {
    let mut core = lock_core(core);
    if core.generation != generation {
        return;
    }
    match event {
        TurnEvent::SessionMarker { session_id } => core.controller.observe_session(session_id),
        TurnEvent::UserEcho { .. } => {
            if let Some(checkpoint) = core.tracker.observe(event) {
                debug!(checkpoint = %checkpoint.uuid, "Recorded checkpoint");
            }
        }
        _ => {}
    }
}
