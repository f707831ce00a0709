// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Restoring checkpointed file state into a lineage's working directory
//!
//! Only paths reported by the control plane are touched, and every one of
//! them must resolve inside the working directory.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Checkpointed state of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// Path as reported, relative to the working directory or absolute
    pub path: String,
    /// Content at the checkpoint; `None` when the file did not exist then
    pub content: Option<String>,
}

/// A snapshot that was not applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefusedPath {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub refused: Vec<RefusedPath>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.refused.is_empty()
    }

    /// Human-readable list of refused paths
    pub fn refused_summary(&self) -> String {
        self.refused
            .iter()
            .map(|r| format!("{} ({})", r.path, r.reason))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone)]
pub struct FileRestorer {
    root: PathBuf,
}

impl FileRestorer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Apply snapshots in order. Individual failures are collected, never raised.
    pub async fn apply(&self, snapshots: &[FileSnapshot]) -> RestoreReport {
        let mut report = RestoreReport::default();
        for snapshot in snapshots {
            let target = match self.resolve(&snapshot.path).await {
                Ok(target) => target,
                Err(reason) => {
                    warn!(path = %snapshot.path, "Refusing to restore file: {}", reason);
                    report.refused.push(RefusedPath {
                        path: snapshot.path.clone(),
                        reason,
                    });
                    continue;
                }
            };

            let outcome = match &snapshot.content {
                Some(content) => write_file(&target, content).await.map(|_| true),
                None => remove_file(&target).await.map(|_| false),
            };
            match outcome {
                Ok(true) => {
                    debug!(path = %target.display(), "Restored file");
                    report.restored.push(target);
                }
                Ok(false) => {
                    debug!(path = %target.display(), "Removed file absent at checkpoint");
                    report.removed.push(target);
                }
                Err(e) => {
                    warn!(path = %target.display(), "Failed to restore file: {}", e);
                    report.refused.push(RefusedPath {
                        path: snapshot.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Resolve a reported path to a location inside the root.
    ///
    /// The nearest existing ancestor is canonicalized so symlinks cannot lead
    /// outside the root.
    pub async fn resolve(&self, raw: &str) -> Result<PathBuf, String> {
        if raw.trim().is_empty() {
            return Err("empty path".to_string());
        }
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|e| format!("working directory unavailable: {e}"))?;

        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            root.join(candidate)
        };
        let normalized = normalize(&joined).ok_or_else(|| "path escapes the filesystem root".to_string())?;

        let (existing, rest) = split_existing(&normalized).await;
        let mut resolved = tokio::fs::canonicalize(&existing)
            .await
            .map_err(|e| format!("cannot resolve {}: {e}", existing.display()))?;
        resolved.extend(rest);

        if resolved == root || !resolved.starts_with(&root) {
            return Err("path is outside the working directory".to_string());
        }
        Ok(resolved)
    }
}

/// Lexically remove `.` and `..`; `None` when `..` climbs above the root
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Longest existing prefix of `path` and the components after it
async fn split_existing(path: &Path) -> (PathBuf, Vec<PathBuf>) {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    while tokio::fs::symlink_metadata(&existing).await.is_err() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(PathBuf::from(name));
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    rest.reverse();
    (existing, rest)
}

async fn write_file(target: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, content).await
}

async fn remove_file(target: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(target).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
