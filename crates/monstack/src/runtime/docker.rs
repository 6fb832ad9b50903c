// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker CLI runtime.
//!
//! Every call shells out to the configured binary with an argument vector
//! (never a shell string) and is bounded by a timeout; a child that outlives
//! its timeout is killed.

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::traits::*;
use crate::config::Config;
use crate::service::ManagedService;

/// Docker runtime configuration.
#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// CLI binary (`docker`, `podman`, or an absolute path).
    pub binary: String,
    /// Upper bound for a single CLI call.
    pub call_timeout: Duration,
    /// Seconds `docker stop` waits before killing.
    pub stop_grace: Duration,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            call_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for DockerRuntimeConfig {
    fn from(config: &Config) -> Self {
        Self {
            binary: config.runtime_bin.clone(),
            call_timeout: config.runtime_timeout,
            stop_grace: config.stop_grace,
        }
    }
}

/// How a failed CLI call should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    /// Daemon or socket unavailable.
    Unreachable,
    /// Target container does not exist.
    NotFound,
    /// Container name already taken.
    Conflict,
    /// Kill on a container that has no running task.
    NotRunning,
    /// Anything else.
    Other,
}

fn classify_failure(stderr: &str) -> Failure {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
        || lower.contains("permission denied while trying to connect")
    {
        Failure::Unreachable
    } else if lower.contains("no such container") || lower.contains("no such object") {
        Failure::NotFound
    } else if lower.contains("is already in use") {
        Failure::Conflict
    } else if lower.contains("is not running") {
        Failure::NotRunning
    } else {
        Failure::Other
    }
}

fn parse_status(raw: &str) -> Result<ObservedStatus> {
    match raw.trim() {
        "created" => Ok(ObservedStatus::Created),
        // Paused refuses `start` but accepts `stop` and `rm`.
        "running" | "restarting" | "paused" => Ok(ObservedStatus::Running),
        "exited" | "dead" => Ok(ObservedStatus::Stopped),
        // Removal already under way; for planning purposes it is gone.
        "removing" => Ok(ObservedStatus::Absent),
        other => Err(RuntimeError::UnexpectedResponse(format!(
            "unknown container state {other:?}"
        ))),
    }
}

/// Argument vector for `docker create`.
fn create_args(service: &ManagedService) -> Vec<String> {
    let spec = &service.container;
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        service.name.clone(),
    ];
    if let Some(network) = &spec.network {
        args.push(format!("--network={network}"));
    }
    if let Some(pid) = &spec.pid {
        args.push(format!("--pid={pid}"));
    }
    if let Some(restart) = &spec.restart {
        args.push(format!("--restart={restart}"));
    }
    if let Some(user) = &spec.user {
        args.push(format!("--user={user}"));
    }
    for port in &spec.ports {
        args.push("--publish".to_string());
        args.push(port.clone());
    }
    for volume in &spec.volumes {
        let mut mount = format!("{}:{}", volume.host.display(), volume.container);
        if volume.read_only {
            mount.push_str(":ro");
        }
        args.push("--volume".to_string());
        args.push(mount);
    }
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args
}

/// Container runtime backed by the Docker CLI.
pub struct DockerRuntime {
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    /// Create a new Docker runtime.
    pub fn new(config: DockerRuntimeConfig) -> Self {
        Self { config }
    }

    /// Create from the process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(DockerRuntimeConfig::from(config))
    }

    /// Run the CLI with `args`, bounded by `limit`.
    async fn run(&self, args: &[String], limit: Duration) -> Result<Output> {
        debug!(binary = %self.config.binary, args = ?args, "Running runtime command");

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args).kill_on_drop(true);

        match tokio::time::timeout(limit, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
                RuntimeError::Unreachable(format!("{} not found", self.config.binary)),
            ),
            Ok(Err(e)) => Err(RuntimeError::Io(e)),
            Err(_) => {
                warn!(binary = %self.config.binary, args = ?args, "Runtime command timed out");
                Err(RuntimeError::Timeout(limit))
            }
        }
    }

    /// Run a lifecycle command, mapping the tolerated failures to success.
    async fn lifecycle(
        &self,
        service: &str,
        verb: ActionVerb,
        args: Vec<String>,
        limit: Duration,
        tolerated: &[Failure],
    ) -> Result<()> {
        let output = self.run(&args, limit).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match classify_failure(&stderr) {
            Failure::Unreachable => Err(RuntimeError::Unreachable(stderr)),
            failure if tolerated.contains(&failure) => {
                debug!(service = %service, verb = %verb, stderr = %stderr, "Tolerated runtime failure");
                Ok(())
            }
            _ => Err(RuntimeError::CommandFailed {
                service: service.to_string(),
                verb,
                message: stderr,
            }),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        let output = self.run(&args, self.config.call_timeout).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Unreachable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn inspect(&self, service: &str) -> Result<ObservedStatus> {
        let args = vec![
            "container".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            service.to_string(),
        ];
        let output = self.run(&args, self.config.call_timeout).await?;
        if output.status.success() {
            return parse_status(&String::from_utf8_lossy(&output.stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match classify_failure(&stderr) {
            Failure::NotFound => Ok(ObservedStatus::Absent),
            Failure::Unreachable => Err(RuntimeError::Unreachable(stderr)),
            _ => Err(RuntimeError::UnexpectedResponse(stderr)),
        }
    }

    async fn execute(&self, service: &ManagedService, verb: ActionVerb) -> Result<()> {
        let name = service.name.clone();
        let timeout = self.config.call_timeout;
        match verb {
            ActionVerb::Create => {
                self.lifecycle(&name, verb, create_args(service), timeout, &[Failure::Conflict])
                    .await
            }
            ActionVerb::Start => {
                self.lifecycle(&name, verb, vec!["start".to_string(), name.clone()], timeout, &[])
                    .await
            }
            ActionVerb::Stop => {
                let grace = self.config.stop_grace.as_secs();
                let args = vec![
                    "stop".to_string(),
                    "--time".to_string(),
                    grace.to_string(),
                    name.clone(),
                ];
                self.lifecycle(
                    &name,
                    verb,
                    args,
                    timeout + self.config.stop_grace,
                    &[Failure::NotFound],
                )
                .await
            }
            ActionVerb::Kill => {
                let args = vec![
                    "kill".to_string(),
                    "--signal".to_string(),
                    "KILL".to_string(),
                    name.clone(),
                ];
                self.lifecycle(
                    &name,
                    verb,
                    args,
                    timeout,
                    &[Failure::NotFound, Failure::NotRunning],
                )
                .await
            }
            ActionVerb::Remove => {
                // No --force: a still-running container must fail here rather
                // than be killed behind the reconciler's back.
                self.lifecycle(
                    &name,
                    verb,
                    vec!["rm".to_string(), name.clone()],
                    timeout,
                    &[Failure::NotFound],
                )
                .await
            }
        }
    }

    async fn pull(&self, service: &ManagedService) -> Result<()> {
        let args = vec!["pull".to_string(), service.container.image.clone()];
        // Image downloads get a longer budget than control calls.
        let output = self.run(&args, self.config.call_timeout * 10).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match classify_failure(&stderr) {
            Failure::Unreachable => Err(RuntimeError::Unreachable(stderr)),
            _ => Err(RuntimeError::UnexpectedResponse(stderr)),
        }
    }
}
