// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restoring service data from a snapshot.
//!
//! Only data directories are restored. Config paths are owned by the renderer
//! and are left alone. Compressed bundles are unpacked into a hidden scratch
//! directory in the store, each service member is checked against the
//! manifest's SHA-256 and then copied over the service's data path.
//!
//! The caller is responsible for stopping the services first.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use super::archive;
use super::manager::{SnapshotManifest, read_manifest};
use super::naming::{BackupStore, SnapshotId, SnapshotLayout, StoredSnapshot};
use super::{Result, SnapshotError};
use crate::service::ManagedService;

/// Per-service outcome of a restore.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    /// Snapshot that was restored.
    pub id: Option<SnapshotId>,
    /// Services whose data path was replaced.
    pub restored: Vec<String>,
    /// Services skipped because they are stateless or have no data in the snapshot.
    pub skipped: Vec<String>,
    /// Services whose restore failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl RestoreReport {
    /// Whether every selected stateful service was restored.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Removes the scratch directory on drop.
struct Scratch(PathBuf);

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(e) = archive::remove_entry(&self.0) {
            warn!(path = %self.0.display(), error = %e, "Failed to remove restore scratch");
        }
    }
}

/// Restores snapshots from a [`BackupStore`].
#[derive(Debug, Clone)]
pub struct Restorer {
    store: BackupStore,
}

impl Restorer {
    /// Create a restorer for `store`.
    pub fn new(store: BackupStore) -> Self {
        Self { store }
    }

    /// Resolve `id`, or the newest snapshot when `id` is `None`.
    pub fn resolve(&self, id: Option<&SnapshotId>) -> Result<StoredSnapshot> {
        match id {
            Some(id) => self.store.find(id),
            None => self
                .store
                .latest()?
                .ok_or_else(|| SnapshotError::NotFound("latest".to_string())),
        }
    }

    /// Restore the data of `services` from `snapshot`.
    ///
    /// A bundle that cannot be unpacked or lacks a manifest fails the whole
    /// restore. Failures of individual services are collected in the report.
    pub fn restore(
        &self,
        snapshot: &StoredSnapshot,
        services: &[ManagedService],
    ) -> Result<RestoreReport> {
        info!(id = %snapshot.id, path = %snapshot.path.display(), "Restoring snapshot");

        let mut report = RestoreReport {
            id: Some(snapshot.id.clone()),
            ..Default::default()
        };

        let (_scratch, root) = match snapshot.layout {
            SnapshotLayout::Directory => (None, snapshot.path.clone()),
            SnapshotLayout::Archive => {
                let scratch_path = self.store.restore_scratch_path(&snapshot.id);
                archive::remove_entry(&scratch_path)
                    .map_err(|e| SnapshotError::io(scratch_path.display().to_string(), e))?;
                let scratch = Scratch(scratch_path.clone());
                archive::unpack_tar_gz(&snapshot.path, &scratch_path).map_err(|e| {
                    SnapshotError::Corrupt {
                        id: snapshot.id.to_string(),
                        reason: format!("cannot unpack bundle: {e}"),
                    }
                })?;
                (Some(scratch), scratch_path)
            }
        };

        let manifest = read_manifest(&root)?;
        if manifest.id != snapshot.id {
            return Err(SnapshotError::Corrupt {
                id: snapshot.id.to_string(),
                reason: format!("manifest belongs to {}", manifest.id),
            });
        }

        for service in services {
            let Some(data_path) = service.data_path.as_ref().filter(|_| service.is_stateful())
            else {
                report.skipped.push(service.name.clone());
                continue;
            };
            match manifest.services.get(&service.name) {
                Some(entry) if entry.has_data => {}
                _ => {
                    warn!(service = %service.name, id = %snapshot.id, "No data for service in snapshot");
                    report.skipped.push(service.name.clone());
                    continue;
                }
            }

            match restore_service(&root, &manifest, service, data_path) {
                Ok(()) => {
                    info!(service = %service.name, path = %data_path.display(), "Restored data");
                    report.restored.push(service.name.clone());
                }
                Err(e) => {
                    warn!(service = %service.name, error = %e, "Restore failed");
                    report.failed.push((service.name.clone(), e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

fn restore_service(
    root: &Path,
    manifest: &SnapshotManifest,
    service: &ManagedService,
    data_path: &Path,
) -> Result<()> {
    if !manifest.compressed {
        let source = root.join(&service.name);
        return archive::replace_dir_contents(&source, data_path)
            .map_err(|e| SnapshotError::io(data_path.display().to_string(), e));
    }

    let entry = &manifest.services[&service.name];
    let member_name = entry.members.first().ok_or_else(|| SnapshotError::Corrupt {
        id: manifest.id.to_string(),
        reason: format!("no member recorded for {}", service.name),
    })?;
    let member = root.join(member_name);

    if let Some(expected) = &entry.sha256 {
        let actual = archive::sha256_file(&member)
            .map_err(|e| SnapshotError::io(member.display().to_string(), e))?;
        if &actual != expected {
            return Err(SnapshotError::Corrupt {
                id: manifest.id.to_string(),
                reason: format!("checksum mismatch for {member_name}"),
            });
        }
    }

    let unpacked = root.join(format!("{}.d", service.name));
    archive::unpack_tar_gz(&member, &unpacked)
        .map_err(|e| SnapshotError::io(member.display().to_string(), e))?;
    archive::replace_dir_contents(&unpacked.join("data"), data_path)
        .map_err(|e| SnapshotError::io(data_path.display().to_string(), e))
}
