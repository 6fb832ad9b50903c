// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! Keeps container states in memory and records every action that reached
//! the runtime, so tests can assert on exact action sequences. Faults can be
//! injected per service: starts that silently do not take, verbs that fail,
//! an unreachable daemon, or calls that hang.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;
use crate::service::ManagedService;

#[derive(Debug, Default)]
struct MockState {
    containers: HashMap<String, ObservedStatus>,
    actions: Vec<RuntimeAction>,
    stuck_starts: HashMap<String, u32>,
    failing: HashMap<(String, ActionVerb), u32>,
    failing_pulls: HashSet<String>,
    pulls: Vec<String>,
}

/// In-memory container runtime.
#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    unreachable: Arc<AtomicBool>,
    hang: Arc<AtomicBool>,
}

impl MockRuntime {
    /// Create a runtime with no containers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a container in `status` (or remove it for `Absent`).
    pub async fn set_status(&self, service: &str, status: ObservedStatus) {
        let mut state = self.state.lock().await;
        if status == ObservedStatus::Absent {
            state.containers.remove(service);
        } else {
            state.containers.insert(service.to_string(), status);
        }
    }

    /// Current stored status, `Absent` if no container exists.
    pub async fn status(&self, service: &str) -> ObservedStatus {
        let state = self.state.lock().await;
        state
            .containers
            .get(service)
            .copied()
            .unwrap_or(ObservedStatus::Absent)
    }

    /// Every action that reached the runtime, in order.
    pub async fn actions(&self) -> Vec<RuntimeAction> {
        self.state.lock().await.actions.clone()
    }

    /// Verbs applied to one service, in order.
    pub async fn verbs_for(&self, service: &str) -> Vec<ActionVerb> {
        let state = self.state.lock().await;
        state
            .actions
            .iter()
            .filter(|a| a.service == service)
            .map(|a| a.verb)
            .collect()
    }

    /// Forget recorded actions.
    pub async fn clear_actions(&self) {
        self.state.lock().await.actions.clear();
    }

    /// Images pulled, in order.
    pub async fn pulls(&self) -> Vec<String> {
        self.state.lock().await.pulls.clone()
    }

    /// The next `count` starts of `service` report success but the task
    /// exits immediately.
    pub async fn stick_starts(&self, service: &str, count: u32) {
        let mut state = self.state.lock().await;
        state.stuck_starts.insert(service.to_string(), count);
    }

    /// The next `count` uses of `verb` on `service` fail.
    pub async fn fail_verb(&self, service: &str, verb: ActionVerb, count: u32) {
        let mut state = self.state.lock().await;
        state.failing.insert((service.to_string(), verb), count);
    }

    /// Pulls of `service`'s image fail.
    pub async fn fail_pull(&self, service: &str) {
        let mut state = self.state.lock().await;
        state.failing_pulls.insert(service.to_string());
    }

    /// Simulate a daemon that is down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Simulate a daemon that accepts calls but never answers.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    async fn gate(&self) -> Result<()> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unreachable(
                "mock runtime is down".to_string(),
            ));
        }
        Ok(())
    }
}

fn failed(service: &str, verb: ActionVerb, message: &str) -> RuntimeError {
    RuntimeError::CommandFailed {
        service: service.to_string(),
        verb,
        message: message.to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        self.gate().await
    }

    async fn inspect(&self, service: &str) -> Result<ObservedStatus> {
        self.gate().await?;
        Ok(self.status(service).await)
    }

    async fn execute(&self, service: &ManagedService, verb: ActionVerb) -> Result<()> {
        self.gate().await?;

        let name = service.name.as_str();
        let mut state = self.state.lock().await;
        state.actions.push(RuntimeAction::new(name, verb));

        if let Some(remaining) = state.failing.get_mut(&(name.to_string(), verb))
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(failed(name, verb, "injected failure"));
        }

        let current = state.containers.get(name).copied();
        match (verb, current) {
            (ActionVerb::Create, None) => {
                state
                    .containers
                    .insert(name.to_string(), ObservedStatus::Created);
            }
            (ActionVerb::Create, Some(_)) => {}
            (ActionVerb::Start, None) => {
                return Err(failed(name, verb, "No such container"));
            }
            (ActionVerb::Start, Some(_)) => {
                let stuck = state.stuck_starts.get_mut(name).filter(|n| **n > 0);
                let next = match stuck {
                    Some(n) => {
                        *n -= 1;
                        ObservedStatus::Stopped
                    }
                    None => ObservedStatus::Running,
                };
                state.containers.insert(name.to_string(), next);
            }
            (ActionVerb::Stop | ActionVerb::Kill, Some(ObservedStatus::Running)) => {
                state
                    .containers
                    .insert(name.to_string(), ObservedStatus::Stopped);
            }
            (ActionVerb::Stop | ActionVerb::Kill, _) => {}
            (ActionVerb::Remove, Some(ObservedStatus::Running)) => {
                return Err(failed(
                    name,
                    verb,
                    "You cannot remove a running container. Stop the container before attempting removal",
                ));
            }
            (ActionVerb::Remove, _) => {
                state.containers.remove(name);
            }
        }
        Ok(())
    }

    async fn pull(&self, service: &ManagedService) -> Result<()> {
        self.gate().await?;
        let mut state = self.state.lock().await;
        if state.failing_pulls.contains(&service.name) {
            return Err(RuntimeError::UnexpectedResponse(format!(
                "manifest for {} not found",
                service.container.image
            )));
        }
        state.pulls.push(service.container.image.clone());
        Ok(())
    }
}
