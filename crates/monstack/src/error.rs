// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for monstack.

use thiserror::Error;

/// Monstack errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Snapshot operation failed.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] crate::snapshot::SnapshotError),

    /// Runtime operation failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),

    /// Trigger installation failed.
    #[error("Trigger error: {0}")]
    Trigger(#[from] crate::trigger::TriggerError),

    /// A precondition for the requested operation does not hold.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error means nothing was attempted: the caller should fix
    /// the environment and rerun.
    pub fn is_precondition(&self) -> bool {
        match self {
            Self::Precondition(_) | Self::Config(_) => true,
            Self::Snapshot(e) => e.is_precondition(),
            Self::Trigger(e) => e.is_invalid_input(),
            _ => false,
        }
    }
}

/// Result type using monstack Error.
pub type Result<T> = std::result::Result<T, Error>;
