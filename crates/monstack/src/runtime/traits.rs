// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime trait definitions.
//!
//! Defines the abstract interface for container runtimes.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::ManagedService;

/// Errors from runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The runtime daemon or its control socket cannot be reached.
    #[error("Runtime unreachable: {0}")]
    Unreachable(String),

    /// A runtime call exceeded its time limit.
    #[error("Runtime call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The runtime answered, but not in a form we understand.
    #[error("Unexpected runtime response: {0}")]
    UnexpectedResponse(String),

    /// The runtime rejected a command.
    #[error("{verb} {service} failed: {message}")]
    CommandFailed {
        /// Service the command targeted.
        service: String,
        /// Verb that failed.
        verb: ActionVerb,
        /// Runtime's error output.
        message: String,
    },

    /// The runtime binary could not be executed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Observed runtime status of a service's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedStatus {
    /// No container with the service's name exists.
    Absent,
    /// Container exists but has never been started.
    Created,
    /// Container task is running.
    Running,
    /// Container exists and its task has exited.
    Stopped,
    /// The runtime could not be asked.
    Unknown,
}

impl fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        f.pad(s)
    }
}

/// A lifecycle operation on one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionVerb {
    /// Create the container from its spec without starting it.
    Create,
    /// Start an existing container.
    Start,
    /// Graceful stop, escalating to kill after the grace period.
    Stop,
    /// Immediate SIGKILL.
    Kill,
    /// Delete the container.
    Remove,
}

impl fmt::Display for ActionVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Kill => "kill",
            Self::Remove => "remove",
        };
        f.pad(s)
    }
}

/// Structured action descriptor: one verb applied to one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeAction {
    /// Service name (also the container name).
    pub service: String,
    /// Operation.
    pub verb: ActionVerb,
}

impl RuntimeAction {
    /// Build an action for `service`.
    pub fn new(service: impl Into<String>, verb: ActionVerb) -> Self {
        Self {
            service: service.into(),
            verb,
        }
    }
}

impl fmt::Display for RuntimeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.service)
    }
}

/// Trait for container runtimes.
///
/// Implementations must treat "no such container" as a normal answer:
/// [`inspect`](Self::inspect) returns [`ObservedStatus::Absent`] and
/// stop/kill/remove on a missing container succeed. Errors are reserved for
/// an unreachable runtime and for commands the runtime refuses.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g., "docker", "mock").
    fn runtime_type(&self) -> &'static str;

    /// Check that the runtime daemon answers.
    async fn ping(&self) -> Result<()>;

    /// Current status of the container named after `service`.
    async fn inspect(&self, service: &str) -> Result<ObservedStatus>;

    /// Apply one verb to a service's container.
    async fn execute(&self, service: &ManagedService, verb: ActionVerb) -> Result<()>;

    /// Fetch the service's image so a later create uses the newest version.
    async fn pull(&self, service: &ManagedService) -> Result<()>;
}
