// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot creation.
//!
//! A snapshot is staged under a hidden name in the store and published with a
//! single rename, so a reader of the store sees either the complete snapshot
//! or nothing. Any failure (or cancellation) removes the staging entries.
//!
//! Compressed snapshots (`{prefix}-{id}.tar.gz`) contain:
//! - `manifest.json`
//! - `{service}.tar.gz` per service, holding `data/` and `config/{name}`
//!
//! Uncompressed snapshots (`{prefix}-{id}/`) contain:
//! - `manifest.json`
//! - `{service}/` - copy of the data directory
//! - `config/{service}/{name}` - copies of each config path

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::archive::{self, Member};
use super::naming::{ARCHIVE_EXT, BackupStore, SnapshotId, SnapshotLayout};
use super::{Result, SnapshotError};
use crate::service::ManagedService;
use crate::{CancelToken, is_cancelled};

/// Name of the manifest file inside every snapshot.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Per-service record in a snapshot manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Member names, relative to the snapshot root.
    pub members: Vec<String>,
    /// Whether the service's data directory is included.
    pub has_data: bool,
    /// Config entry names, in declared order.
    #[serde(default)]
    pub config: Vec<String>,
    /// SHA-256 of the compressed member, for compressed snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Description of a snapshot's contents, stored as `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Snapshot id.
    pub id: SnapshotId,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
    /// Whether members are compressed.
    pub compressed: bool,
    /// Entries keyed by service name.
    pub services: BTreeMap<String, ServiceEntry>,
}

/// A snapshot that has been written to the store.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Snapshot id.
    pub id: SnapshotId,
    /// Published top-level entry.
    pub path: PathBuf,
    /// Whether the snapshot is a compressed bundle.
    pub compressed: bool,
    /// Member names per service.
    pub entries: BTreeMap<String, Vec<String>>,
    /// Size on disk after the write completed.
    pub size_bytes: u64,
}

/// Removes staging paths on drop unless disarmed.
struct StagingGuard {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl StagingGuard {
    fn new() -> Self {
        Self {
            paths: Vec::new(),
            armed: true,
        }
    }

    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in &self.paths {
            if let Err(e) = archive::remove_entry(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove staging entry");
            } else {
                debug!(path = %path.display(), "Removed staging entry");
            }
        }
    }
}

/// Creates snapshots in a [`BackupStore`].
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    store: BackupStore,
}

impl SnapshotManager {
    /// Create a manager for `store`.
    pub fn new(store: BackupStore) -> Self {
        Self { store }
    }

    /// Snapshot every service's data and config paths, id from the current time.
    pub fn create(
        &self,
        services: &[ManagedService],
        compress: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<Snapshot> {
        self.create_with_id(services, compress, SnapshotId::now(), cancel)
    }

    /// Snapshot with an explicit id.
    ///
    /// Fails without writing anything if a stateful service's data path is not
    /// readable or if `id` is already taken in the store.
    pub fn create_with_id(
        &self,
        services: &[ManagedService],
        compress: bool,
        id: SnapshotId,
        cancel: Option<&CancelToken>,
    ) -> Result<Snapshot> {
        check_data_paths(services)?;

        let root = self.store.root();
        fs::create_dir_all(root).map_err(|e| SnapshotError::io(root.display().to_string(), e))?;
        self.store.sweep_partials()?;

        if self.store.contains(&id) {
            return Err(SnapshotError::IdCollision(id.to_string()));
        }

        let layout = if compress {
            SnapshotLayout::Archive
        } else {
            SnapshotLayout::Directory
        };
        let staging_dir = self.store.staging_path(&id, SnapshotLayout::Directory);
        let final_path = self.store.entry_path(&id, layout);

        info!(
            id = %id,
            compressed = compress,
            services = services.len(),
            store = %root.display(),
            "Creating snapshot"
        );

        let mut guard = StagingGuard::new();
        guard.track(staging_dir.clone());
        fs::create_dir(&staging_dir)
            .map_err(|e| SnapshotError::io(staging_dir.display().to_string(), e))?;

        let mut manifest = SnapshotManifest {
            id: id.clone(),
            created_at: Utc::now(),
            compressed: compress,
            services: BTreeMap::new(),
        };

        for service in services {
            if is_cancelled(cancel) {
                warn!(id = %id, service = %service.name, "Snapshot cancelled");
                return Err(SnapshotError::Cancelled);
            }
            let entry = if compress {
                write_compressed_member(&staging_dir, service)?
            } else {
                write_directory_member(&staging_dir, service)?
            };
            debug!(service = %service.name, members = ?entry.members, "Archived service");
            manifest.services.insert(service.name.clone(), entry);
        }

        if is_cancelled(cancel) {
            return Err(SnapshotError::Cancelled);
        }

        let manifest_path = staging_dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| SnapshotError::io(MANIFEST_FILE, std::io::Error::other(e)))?;
        fs::write(&manifest_path, json)
            .map_err(|e| SnapshotError::io(manifest_path.display().to_string(), e))?;

        let size_bytes = if compress {
            let bundle_staging = self.store.staging_path(&id, SnapshotLayout::Archive);
            guard.track(bundle_staging.clone());
            let size = write_bundle(&staging_dir, &bundle_staging, &manifest)?;
            publish(&bundle_staging, &final_path)?;
            size
        } else {
            let size = archive::disk_usage(&staging_dir)
                .map_err(|e| SnapshotError::io(staging_dir.display().to_string(), e))?;
            publish(&staging_dir, &final_path)?;
            size
        };

        // Published; the staging directory of a compressed snapshot is still
        // removed by the guard.
        if !compress {
            guard.disarm();
        }
        drop(guard);

        let entries = manifest
            .services
            .iter()
            .map(|(name, entry)| (name.clone(), entry.members.clone()))
            .collect();

        info!(
            id = %id,
            path = %final_path.display(),
            size_bytes = size_bytes,
            "Snapshot created"
        );

        Ok(Snapshot {
            id,
            path: final_path,
            compressed: compress,
            entries,
            size_bytes,
        })
    }
}

/// Every stateful service must have a readable data path before anything is
/// written.
fn check_data_paths(services: &[ManagedService]) -> Result<()> {
    for service in services {
        let Some(path) = service.data_path.as_ref().filter(|_| service.is_stateful()) else {
            continue;
        };
        archive::check_readable(path).map_err(|e| SnapshotError::DataPathUnavailable {
            service: service.name.clone(),
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if !path.is_dir() {
            return Err(SnapshotError::DataPathUnavailable {
                service: service.name.clone(),
                path: path.clone(),
                reason: "not a directory".to_string(),
            });
        }
    }
    Ok(())
}

fn config_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn data_path(service: &ManagedService) -> Option<&Path> {
    service
        .data_path
        .as_deref()
        .filter(|_| service.is_stateful())
}

fn write_compressed_member(staging_dir: &Path, service: &ManagedService) -> Result<ServiceEntry> {
    let member_name = format!("{}.{}", service.name, ARCHIVE_EXT);
    let member_path = staging_dir.join(&member_name);

    let mut members = Vec::new();
    if let Some(data) = data_path(service) {
        members.push(Member {
            source: data,
            name: "data".to_string(),
        });
    }
    let config: Vec<String> = service.config_paths.iter().map(|p| config_name(p)).collect();
    for (path, name) in service.config_paths.iter().zip(&config) {
        members.push(Member {
            source: path,
            name: format!("config/{name}"),
        });
    }

    archive::write_tar_gz(&member_path, &members)
        .map_err(|e| SnapshotError::io(format!("{} member of {}", member_name, service.name), e))?;
    let sha256 = archive::sha256_file(&member_path)
        .map_err(|e| SnapshotError::io(member_path.display().to_string(), e))?;

    Ok(ServiceEntry {
        members: vec![member_name],
        has_data: data_path(service).is_some(),
        config,
        sha256: Some(sha256),
    })
}

fn write_directory_member(staging_dir: &Path, service: &ManagedService) -> Result<ServiceEntry> {
    let mut members = Vec::new();

    if let Some(data) = data_path(service) {
        let dest = staging_dir.join(&service.name);
        archive::copy_tree(data, &dest)
            .map_err(|e| SnapshotError::io(format!("data of {}", service.name), e))?;
        members.push(service.name.clone());
    }

    let mut config = Vec::new();
    if !service.config_paths.is_empty() {
        let config_dir = staging_dir.join("config").join(&service.name);
        fs::create_dir_all(&config_dir)
            .map_err(|e| SnapshotError::io(config_dir.display().to_string(), e))?;
        for path in &service.config_paths {
            let name = config_name(path);
            archive::copy_tree(path, &config_dir.join(&name)).map_err(|e| {
                SnapshotError::io(format!("config {} of {}", path.display(), service.name), e)
            })?;
            config.push(name);
        }
        members.push(format!("config/{}", service.name));
    }

    Ok(ServiceEntry {
        members,
        has_data: data_path(service).is_some(),
        config,
        sha256: None,
    })
}

fn write_bundle(staging_dir: &Path, bundle: &Path, manifest: &SnapshotManifest) -> Result<u64> {
    let mut names = vec![MANIFEST_FILE.to_string()];
    names.extend(
        manifest
            .services
            .values()
            .flat_map(|entry| entry.members.iter().cloned()),
    );
    let paths: Vec<PathBuf> = names.iter().map(|n| staging_dir.join(n)).collect();
    let members: Vec<Member<'_>> = paths
        .iter()
        .zip(&names)
        .map(|(source, name)| Member {
            source,
            name: name.clone(),
        })
        .collect();

    archive::write_tar_gz(bundle, &members)
        .map_err(|e| SnapshotError::io(bundle.display().to_string(), e))
}

fn publish(staged: &Path, final_path: &Path) -> Result<()> {
    fs::rename(staged, final_path)
        .map_err(|e| SnapshotError::io(final_path.display().to_string(), e))
}

/// Read the manifest of a directory snapshot or an unpacked bundle.
pub fn read_manifest(snapshot_root: &Path) -> Result<SnapshotManifest> {
    let path = snapshot_root.join(MANIFEST_FILE);
    let raw = fs::read(&path).map_err(|e| SnapshotError::io(path.display().to_string(), e))?;
    serde_json::from_slice(&raw).map_err(|e| SnapshotError::Corrupt {
        id: snapshot_root.display().to_string(),
        reason: format!("unreadable manifest: {e}"),
    })
}
