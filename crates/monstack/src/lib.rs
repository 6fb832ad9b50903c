// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monstack - Monitoring Stack Operations
//!
//! Keeps a small host-level monitoring stack (metrics collector, host agent,
//! dashboard, reverse proxy) in its declared state and protects its data with
//! point-in-time snapshots.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        monstack (CLI)                            │
//! │  snapshot │ prune │ list │ restore │ reconcile │ upgrade │ ...   │
//! └──────────────────────────────────────────────────────────────────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌──────────────────────┐              ┌──────────────────────────┐
//! │  SnapshotManager     │              │  Reconciler              │
//! │  Retention / Restore │              │  Probe ─► Planner        │
//! └──────────────────────┘              └──────────────────────────┘
//!        │                                         │
//!        ▼                                         ▼
//! ┌──────────────────────┐              ┌──────────────────────────┐
//! │  Backup store        │              │  ContainerRuntime        │
//! │  <prefix>-<id>[.tar.gz]             │  (docker CLI, mock)      │
//! └──────────────────────┘              └──────────────────────────┘
//! ```
//!
//! # Reconcile Transitions
//!
//! | Observed \ Desired | Running | Stopped | Absent |
//! |--------------------|---------|---------|--------|
//! | Absent | create, start | - | - |
//! | Created | start | - | remove |
//! | Running | - | stop | stop, remove |
//! | Stopped | start | - | remove |
//! | Unknown | refuse | refuse | refuse |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables (a `.env` file is
//! honoured) and may be overridden by command-line flags:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MONSTACK_BACKUP_DIR` | `/var/backups/monstack` | Snapshot store root |
//! | `MONSTACK_BACKUP_PREFIX` | `monstack` | Snapshot entry name prefix |
//! | `MONSTACK_BACKUP_KEEP` | `7` | Snapshots retained (`0` keeps all) |
//! | `MONSTACK_BACKUP_COMPRESS` | `true` | Write `.tar.gz` bundles |
//! | `MONSTACK_STATE_DIR` | `/var/lib/monstack` | Service data root |
//! | `MONSTACK_CONFIG_DIR` | `/etc/monstack` | Service config root |
//! | `MONSTACK_SERVICES_FILE` | - | JSON service table |
//! | `MONSTACK_RUNTIME_BIN` | `docker` | Container runtime CLI |
//! | `MONSTACK_RUNTIME_TIMEOUT_SECS` | `30` | Per-call runtime limit |
//! | `MONSTACK_STOP_GRACE_SECS` | `10` | Graceful stop period |
//! | `MONSTACK_RETRY_DELAY_SECS` | `2` | Pause before the single retry |
//! | `MONSTACK_CRON_FILE` | `/etc/cron.d/monstack-backup` | Trigger file |
//! | `MONSTACK_LOCK_FILE` | `/run/monstack-backup.lock` | Trigger lock |
//! | `MONSTACK_SKIP_PRIVILEGE_CHECK` | `false` | Allow non-root runs |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Crate-level error type
//! - [`preflight`]: Privilege, binary and runtime checks
//! - [`reconcile`]: Probe, planner and reconciler
//! - [`runtime`]: Container runtime adapters
//! - [`service`]: Managed service table
//! - [`snapshot`]: Snapshot creation, retention and restore
//! - [`trigger`]: Scheduled snapshot trigger rendering

#![deny(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for monstack operations.
pub mod error;

/// Preconditions checked before touching the host.
pub mod preflight;

/// Desired-state reconciliation.
pub mod reconcile;

/// Container runtime backends.
pub mod runtime;

/// Managed service definitions.
pub mod service;

/// Snapshot store.
pub mod snapshot;

/// Periodic snapshot trigger.
pub mod trigger;

pub use config::Config;
pub use error::{Error, Result};

/// Cancellation flag shared between a signal handler and long operations.
pub type CancelToken = Arc<AtomicBool>;

/// Whether `cancel` is set. `None` never cancels.
pub fn is_cancelled(cancel: Option<&CancelToken>) -> bool {
    cancel.is_some_and(|c| c.load(Ordering::SeqCst))
}
