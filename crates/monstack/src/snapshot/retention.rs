// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retention pruning.
//!
//! Keeps the `keep_count` newest snapshots of a store and removes the rest.
//! Ordering relies on the fixed-width timestamp ids produced by
//! [`SnapshotId`], so newest-first listing order is creation order.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::archive;
use super::naming::{BackupStore, SnapshotId, StoredSnapshot};
use super::Result;

/// How many snapshots a store retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Number of newest snapshots to keep. Zero disables pruning.
    pub keep_count: u32,
}

impl RetentionPolicy {
    /// Keep the `keep_count` newest snapshots; zero keeps everything.
    pub fn keep(keep_count: u32) -> Self {
        Self { keep_count }
    }

    /// Whether the policy retains snapshots without limit.
    pub fn is_unbounded(&self) -> bool {
        self.keep_count == 0
    }

    /// Split a newest-first listing into the snapshots that fall outside the
    /// retention window.
    pub fn select_expired<'a>(&self, newest_first: &'a [StoredSnapshot]) -> &'a [StoredSnapshot] {
        if self.is_unbounded() {
            return &[];
        }
        let keep = self.keep_count as usize;
        newest_first.get(keep..).unwrap_or(&[])
    }
}

/// Outcome of a prune pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    /// Snapshots still in the store, newest first.
    pub kept: Vec<SnapshotId>,
    /// Snapshots removed, newest first. Includes entries that were already
    /// gone when removal was attempted.
    pub removed: Vec<SnapshotId>,
    /// Snapshots that could not be removed, with the reason.
    pub failed: Vec<(SnapshotId, String)>,
}

impl PruneReport {
    /// Whether every expired snapshot was removed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Remove every snapshot outside the retention window.
///
/// Per-entry removal failures are collected in the report; they do not stop
/// the remaining removals. Listing failures are returned as errors.
pub fn prune(store: &BackupStore, policy: RetentionPolicy) -> Result<PruneReport> {
    let snapshots = store.list()?;

    if policy.is_unbounded() {
        debug!(count = snapshots.len(), "Retention unbounded, nothing to prune");
        return Ok(PruneReport {
            kept: snapshots.into_iter().map(|s| s.id).collect(),
            ..Default::default()
        });
    }

    let expired = policy.select_expired(&snapshots);
    let mut report = PruneReport {
        kept: snapshots[..snapshots.len() - expired.len()]
            .iter()
            .map(|s| s.id.clone())
            .collect(),
        ..Default::default()
    };

    for snapshot in expired {
        match archive::remove_entry(&snapshot.path) {
            Ok(()) => {
                debug!(id = %snapshot.id, path = %snapshot.path.display(), "Removed snapshot");
                report.removed.push(snapshot.id.clone());
            }
            Err(e) => {
                warn!(id = %snapshot.id, error = %e, "Failed to remove snapshot");
                report.failed.push((snapshot.id.clone(), e.to_string()));
            }
        }
    }

    if !report.removed.is_empty() || !report.failed.is_empty() {
        info!(
            kept = report.kept.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            keep_count = policy.keep_count,
            "Prune completed"
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn ids(ids: &[SnapshotId]) -> Vec<&str> {
        ids.iter().map(|id| id.as_str()).collect()
    }

    fn seed(dir: &TempDir, names: &[&str]) -> BackupStore {
        for name in names {
            fs::create_dir(dir.path().join(name)).unwrap();
            fs::write(dir.path().join(name).join("manifest.json"), "{}").unwrap();
        }
        BackupStore::new(dir.path(), "m")
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = seed(
            &dir,
            &["m-20240101000000", "m-20240102000000", "m-20240103000000"],
        );

        let report = prune(&store, RetentionPolicy::keep(2)).unwrap();

        assert_eq!(ids(&report.removed), ["20240101000000"]);
        assert_eq!(ids(&report.kept), ["20240103000000", "20240102000000"]);
        assert!(!dir.path().join("m-20240101000000").exists());
        assert!(dir.path().join("m-20240103000000").exists());
    }

    #[test]
    fn test_prune_zero_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let store = seed(
            &dir,
            &[
                "m-20240101000000",
                "m-20240102000000",
                "m-20240103000000",
                "m-20240104000000",
                "m-20240105000000",
            ],
        );

        let report = prune(&store, RetentionPolicy::keep(0)).unwrap();

        assert!(report.removed.is_empty());
        assert_eq!(report.kept.len(), 5);
        assert_eq!(store.list().unwrap().len(), 5);
    }

    #[test]
    fn test_prune_fewer_than_keep() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &["m-20240101000000"]);
        let report = prune(&store, RetentionPolicy::keep(3)).unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(ids(&report.kept), ["20240101000000"]);
    }

    #[test]
    fn test_prune_mixed_layouts() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &["m-20240102000000"]);
        fs::write(dir.path().join("m-20240101000000.tar.gz"), b"x").unwrap();
        fs::write(dir.path().join("m-20240103000000.tar.gz"), b"x").unwrap();

        let report = prune(&store, RetentionPolicy::keep(1)).unwrap();

        assert_eq!(ids(&report.removed), ["20240102000000", "20240101000000"]);
        assert!(dir.path().join("m-20240103000000.tar.gz").exists());
    }

    #[test]
    fn test_prune_ignores_foreign_entries() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &["m-20240101000000", "m-20240102000000"]);
        fs::write(dir.path().join("README"), b"keep me").unwrap();
        fs::create_dir(dir.path().join("x-20230101000000")).unwrap();

        prune(&store, RetentionPolicy::keep(1)).unwrap();

        assert!(dir.path().join("README").exists());
        assert!(dir.path().join("x-20230101000000").exists());
    }

    #[test]
    fn test_prune_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = seed(
            &dir,
            &["m-20240101000000", "m-20240102000000", "m-20240103000000"],
        );
        prune(&store, RetentionPolicy::keep(1)).unwrap();
        let second = prune(&store, RetentionPolicy::keep(1)).unwrap();
        assert!(second.removed.is_empty());
        assert!(second.is_success());
    }

    #[test]
    fn test_select_expired() {
        let dir = TempDir::new().unwrap();
        let store = seed(
            &dir,
            &["m-20240101000000", "m-20240102000000", "m-20240103000000"],
        );
        let listed = store.list().unwrap();
        assert_eq!(RetentionPolicy::keep(2).select_expired(&listed).len(), 1);
        assert_eq!(RetentionPolicy::keep(5).select_expired(&listed).len(), 0);
        assert_eq!(RetentionPolicy::keep(0).select_expired(&listed).len(), 0);
    }
}
