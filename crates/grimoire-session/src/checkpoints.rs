// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Checkpoint ledger for one session lineage
//!
//! Append-only while turns run, truncated (suffix removed) when a rewind
//! succeeds. Entry order is the order in which user turns were echoed by the
//! assistant; assistant and tool events never touch the ledger.

use crate::error::{SessionError, SessionResult};
use crate::events::TurnEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A rewindable point at one user-turn boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub uuid: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointTracker {
    entries: Vec<Checkpoint>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the checkpoint carried by a `UserEcho`, if any.
    ///
    /// Returns the appended entry; `None` for other events, missing uuids and
    /// uuids already in the ledger.
    pub fn observe(&mut self, event: &TurnEvent) -> Option<&Checkpoint> {
        self.observe_at(event, Utc::now())
    }

    pub fn observe_at(&mut self, event: &TurnEvent, now: DateTime<Utc>) -> Option<&Checkpoint> {
        match event {
            TurnEvent::UserEcho {
                uuid: Some(uuid), ..
            } => self.record(uuid, now),
            _ => None,
        }
    }

    fn record(&mut self, uuid: &str, observed_at: DateTime<Utc>) -> Option<&Checkpoint> {
        if uuid.is_empty() || self.position(uuid).is_some() {
            return None;
        }
        self.entries.push(Checkpoint {
            uuid: uuid.to_string(),
            observed_at,
        });
        self.entries.last()
    }

    /// Snapshot copy of the ledger
    pub fn list_checkpoints(&self) -> Vec<Checkpoint> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Checkpoint> {
        self.entries.get(index)
    }

    pub fn position(&self, uuid: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.uuid == uuid)
    }

    /// The checkpoint immediately before `uuid`, used to edit the message at `uuid`
    pub fn prior_to(&self, uuid: &str) -> SessionResult<&Checkpoint> {
        match self.position(uuid) {
            None => Err(SessionError::CheckpointNotFound(uuid.to_string())),
            Some(0) => Err(SessionError::NoPriorCheckpoint(uuid.to_string())),
            Some(index) => Ok(&self.entries[index - 1]),
        }
    }

    /// Drop every entry after `uuid`, keeping `uuid` itself.
    ///
    /// Returns how many entries were removed.
    pub fn truncate_after(&mut self, uuid: &str) -> SessionResult<usize> {
        let index = self
            .position(uuid)
            .ok_or_else(|| SessionError::CheckpointNotFound(uuid.to_string()))?;
        let removed = self.entries.len() - (index + 1);
        self.entries.truncate(index + 1);
        Ok(removed)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(uuid: &str) -> TurnEvent {
        TurnEvent::UserEcho {
            uuid: Some(uuid.to_string()),
            content: format!("message {uuid}"),
        }
    }

    fn uuids(tracker: &CheckpointTracker) -> Vec<String> {
        tracker.list_checkpoints().into_iter().map(|c| c.uuid).collect()
    }

    #[test]
    fn test_observe_appends_in_order_and_ignores_duplicates() {
        let mut tracker = CheckpointTracker::new();
        assert!(tracker.observe(&echo("a")).is_some());
        assert!(tracker.observe(&echo("b")).is_some());
        assert!(tracker.observe(&echo("a")).is_none());
        assert_eq!(uuids(&tracker), vec!["a", "b"]);
    }

    #[test]
    fn test_observe_ignores_non_user_events() {
        let mut tracker = CheckpointTracker::new();
        tracker.observe(&TurnEvent::SessionMarker {
            session_id: "s1".into(),
        });
        tracker.observe(&TurnEvent::SystemNotice {
            subtype: None,
            payload: json!({"uuid": "not-a-checkpoint"}),
        });
        tracker.observe(&TurnEvent::UserEcho {
            uuid: None,
            content: "no id".into(),
        });
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_observe_at_records_timestamp() {
        let mut tracker = CheckpointTracker::new();
        let at = DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let entry = tracker.observe_at(&echo("a"), at).cloned().unwrap();
        assert_eq!(entry.observed_at, at);
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let mut tracker = CheckpointTracker::new();
        tracker.observe(&echo("a"));
        let snapshot = tracker.list_checkpoints();
        tracker.observe(&echo("b"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_truncate_after_keeps_target() {
        let mut tracker = CheckpointTracker::new();
        for id in ["a", "b", "c", "d"] {
            tracker.observe(&echo(id));
        }
        assert_eq!(tracker.truncate_after("b").unwrap(), 2);
        assert_eq!(uuids(&tracker), vec!["a", "b"]);
        assert_eq!(tracker.truncate_after("b").unwrap(), 0);
    }

    #[test]
    fn test_truncate_after_unknown_uuid_fails_without_mutation() {
        let mut tracker = CheckpointTracker::new();
        tracker.observe(&echo("a"));
        let err = tracker.truncate_after("zzz").unwrap_err();
        assert!(matches!(err, SessionError::CheckpointNotFound(ref id) if id == "zzz"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_prior_to() {
        let mut tracker = CheckpointTracker::new();
        tracker.observe(&echo("a"));
        tracker.observe(&echo("b"));
        assert_eq!(tracker.prior_to("b").unwrap().uuid, "a");
        assert!(matches!(
            tracker.prior_to("a"),
            Err(SessionError::NoPriorCheckpoint(_))
        ));
        assert!(matches!(
            tracker.prior_to("c"),
            Err(SessionError::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn test_rewound_uuid_can_reappear_after_truncation() {
        let mut tracker = CheckpointTracker::new();
        tracker.observe(&echo("a"));
        tracker.observe(&echo("b"));
        tracker.truncate_after("a").unwrap();
        assert!(tracker.observe(&echo("b")).is_some());
        assert_eq!(uuids(&tracker), vec!["a", "b"]);
    }
}
