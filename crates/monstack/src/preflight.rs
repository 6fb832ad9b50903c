// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host preconditions.
//!
//! Every failure here is reported as [`Error::Precondition`]: the command
//! exits with status 2 and nothing on the host has been touched.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;

/// Require an effective uid of 0 unless `skip` is set.
pub fn require_root(skip: bool) -> Result<()> {
    if skip {
        debug!("Privilege check skipped");
        return Ok(());
    }
    let euid = nix::unistd::geteuid();
    if !euid.is_root() {
        return Err(Error::Precondition(format!(
            "must run as root (effective uid is {euid})"
        )));
    }
    Ok(())
}

/// Locate `binary` on `PATH`, or check it directly when it contains a slash.
pub fn require_binary(binary: &str) -> Result<PathBuf> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    find_executable(binary, &path)
        .ok_or_else(|| Error::Precondition(format!("{binary} not found on PATH")))
}

/// Require the runtime to answer a ping within `timeout`.
pub async fn require_runtime(runtime: &dyn ContainerRuntime, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, runtime.ping()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Precondition(format!(
            "{} runtime not reachable: {e}",
            runtime.runtime_type()
        ))),
        Err(_) => Err(Error::Precondition(format!(
            "{} runtime did not answer within {timeout:?}",
            runtime.runtime_type()
        ))),
    }
}

fn find_executable(binary: &str, search_path: &std::ffi::OsStr) -> Option<PathBuf> {
    if binary.contains('/') {
        let candidate = PathBuf::from(binary);
        return is_executable(&candidate).then_some(candidate);
    }
    std::env::split_paths(search_path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
