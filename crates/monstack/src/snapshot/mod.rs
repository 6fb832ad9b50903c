// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot subsystem - point-in-time backups of managed services.
//!
//! Layering, leaves first:
//!
//! - [`archive`]: tar/gzip and directory-copy primitives, no service awareness
//! - [`naming`]: the store's fixed naming convention and listing
//! - [`retention`]: keep-the-newest-N pruning
//! - [`manager`]: all-or-nothing snapshot creation
//! - [`restore`]: putting a snapshot's data back in place

pub mod archive;
pub mod manager;
pub mod naming;
pub mod restore;
pub mod retention;

use std::path::PathBuf;

use thiserror::Error;

pub use manager::{Snapshot, SnapshotManager, SnapshotManifest};
pub use naming::{BackupStore, SnapshotId, SnapshotLayout, StoredSnapshot};
pub use restore::{RestoreReport, Restorer};
pub use retention::{PruneReport, RetentionPolicy};

/// Errors from snapshot operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SnapshotError {
    /// A stateful service's data path is missing or unreadable.
    #[error("Data path for service {service} is not readable: {path}: {reason}")]
    DataPathUnavailable {
        /// Service name.
        service: String,
        /// Data path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// A snapshot with the generated id already exists.
    #[error("Snapshot {0} already exists")]
    IdCollision(String),

    /// Writing or reading an archive member failed.
    #[error("I/O error on {context}: {source}")]
    Io {
        /// Which member or path was being processed.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Snapshot creation was interrupted.
    #[error("Snapshot cancelled")]
    Cancelled,

    /// The requested snapshot does not exist in the store.
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    /// The snapshot exists but its contents are not what the manifest says.
    #[error("Corrupt snapshot {id}: {reason}")]
    Corrupt {
        /// Snapshot id.
        id: String,
        /// Description of the mismatch.
        reason: String,
    },
}

impl SnapshotError {
    /// Wrap an I/O error with the path or member it concerns.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the error is a precondition failure rather than an I/O fault.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::DataPathUnavailable { .. } | Self::IdCollision(_))
    }
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;
