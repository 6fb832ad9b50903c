// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup store layout.
//!
//! A store is a directory holding one top-level entry per snapshot:
//!
//! - `{prefix}-{id}.tar.gz` for compressed snapshots
//! - `{prefix}-{id}/` for uncompressed snapshots
//!
//! `id` is a fixed-width UTC timestamp (`YYYYmmddHHMMSS`), so lexical order of
//! ids is chronological order. Entries starting with `.` are staging areas and
//! never count as snapshots.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Result, SnapshotError};

/// Extension of compressed snapshot bundles and members.
pub const ARCHIVE_EXT: &str = "tar.gz";

const ID_FORMAT: &str = "%Y%m%d%H%M%S";
const ID_LEN: usize = 14;
const PARTIAL_SUFFIX: &str = ".partial";
const RESTORE_SUFFIX: &str = ".restore";

/// Timestamp-derived snapshot identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Id for a wall-clock instant, truncated to the second.
    pub fn from_time(at: DateTime<Utc>) -> Self {
        Self(at.format(ID_FORMAT).to_string())
    }

    /// Id for the current instant.
    pub fn now() -> Self {
        Self::from_time(Utc::now())
    }

    /// Parse an id, accepting only the fixed-width format.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != ID_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        NaiveDateTime::parse_from_str(s, ID_FORMAT).ok()?;
        Some(Self(s.to_string()))
    }

    /// Creation time encoded in the id.
    pub fn created_at(&self) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(&self.0, ID_FORMAT)
            .map(|t| t.and_utc())
            .unwrap_or_default()
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid snapshot id: {value}"))
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.0
    }
}

/// On-disk form of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotLayout {
    /// Single gzip-compressed tar bundle.
    Archive,
    /// Plain directory tree.
    Directory,
}

/// A snapshot found in a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    /// Snapshot id.
    pub id: SnapshotId,
    /// Compressed bundle or directory.
    pub layout: SnapshotLayout,
    /// Top-level entry path.
    pub path: PathBuf,
}

impl StoredSnapshot {
    /// Top-level entry name.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A backup directory with a fixed naming prefix.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
    prefix: String,
}

impl BackupStore {
    /// Create a store handle. Nothing is touched on disk.
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    /// Store directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Top-level entry name for a snapshot.
    pub fn entry_name(&self, id: &SnapshotId, layout: SnapshotLayout) -> String {
        match layout {
            SnapshotLayout::Archive => format!("{}-{}.{}", self.prefix, id, ARCHIVE_EXT),
            SnapshotLayout::Directory => format!("{}-{}", self.prefix, id),
        }
    }

    /// Top-level entry path for a snapshot.
    pub fn entry_path(&self, id: &SnapshotId, layout: SnapshotLayout) -> PathBuf {
        self.root.join(self.entry_name(id, layout))
    }

    /// Hidden staging path used while a snapshot is being written.
    pub fn staging_path(&self, id: &SnapshotId, layout: SnapshotLayout) -> PathBuf {
        self.root
            .join(format!(".{}{}", self.entry_name(id, layout), PARTIAL_SUFFIX))
    }

    /// Hidden scratch path used while a snapshot is being restored.
    pub fn restore_scratch_path(&self, id: &SnapshotId) -> PathBuf {
        self.root.join(format!(
            ".{}{}",
            self.entry_name(id, SnapshotLayout::Directory),
            RESTORE_SUFFIX
        ))
    }

    /// Whether any entry for `id` exists, in either layout.
    pub fn contains(&self, id: &SnapshotId) -> bool {
        [SnapshotLayout::Archive, SnapshotLayout::Directory]
            .iter()
            .any(|layout| self.entry_path(id, *layout).symlink_metadata().is_ok())
    }

    /// Classify a top-level entry name. Returns `None` for anything that is
    /// not a snapshot of this store.
    pub fn parse_entry(&self, name: &str, is_dir: bool) -> Option<(SnapshotId, SnapshotLayout)> {
        let rest = name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        if is_dir {
            SnapshotId::parse(rest).map(|id| (id, SnapshotLayout::Directory))
        } else {
            let id = rest.strip_suffix(ARCHIVE_EXT)?.strip_suffix('.')?;
            SnapshotId::parse(id).map(|id| (id, SnapshotLayout::Archive))
        }
    }

    /// List snapshots, newest first. A missing store directory is empty.
    pub fn list(&self) -> Result<Vec<StoredSnapshot>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(root = %self.root.display(), "Backup store does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(SnapshotError::io(self.root.display().to_string(), e)),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SnapshotError::io(self.root.display().to_string(), e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let is_dir = match entry.file_type() {
                Ok(t) => t.is_dir(),
                Err(e) => {
                    warn!(entry = %name, error = %e, "Failed to stat store entry");
                    continue;
                }
            };
            if let Some((id, layout)) = self.parse_entry(name, is_dir) {
                snapshots.push(StoredSnapshot {
                    id,
                    layout,
                    path: entry.path(),
                });
            }
        }

        // Newest first. Same-id entries of both layouts sort deterministically.
        snapshots.sort_by(|a, b| b.id.cmp(&a.id).then(a.layout.cmp(&b.layout)));
        Ok(snapshots)
    }

    /// Find a snapshot by id.
    pub fn find(&self, id: &SnapshotId) -> Result<StoredSnapshot> {
        self.list()?
            .into_iter()
            .find(|s| &s.id == id)
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))
    }

    /// Newest snapshot, if any.
    pub fn latest(&self) -> Result<Option<StoredSnapshot>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Remove staging and scratch entries left by an interrupted run.
    ///
    /// Returns the number of entries removed.
    pub fn sweep_partials(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SnapshotError::io(self.root.display().to_string(), e)),
        };

        let hidden_prefix = format!(".{}-", self.prefix);
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(&hidden_prefix)
                || !(name.ends_with(PARTIAL_SUFFIX) || name.ends_with(RESTORE_SUFFIX))
            {
                continue;
            }
            let path = entry.path();
            super::archive::remove_entry(&path)
                .map_err(|e| SnapshotError::io(path.display().to_string(), e))?;
            warn!(path = %path.display(), "Removed leftover staging entry");
            removed += 1;
        }
        Ok(removed)
    }
}
