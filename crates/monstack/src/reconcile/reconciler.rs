// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service reconciler.
//!
//! Drives each service from its observed runtime state to its desired state:
//!
//! 1. observe
//! 2. apply the planned verbs (stopping at the first failing verb)
//! 3. re-observe; converged means done
//! 4. otherwise wait `retry_delay`, re-observe, apply the recovery plan once
//! 5. re-observe; converged means `Retried`, anything else is `Failed`
//!
//! Services are processed one at a time in declared order. A failure in one
//! service never stops the others.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::planner::{Plan, is_converged, plan, recovery_plan};
use super::probe::{Observation, Probe};
use crate::config::Config;
use crate::runtime::{ActionVerb, ContainerRuntime, ObservedStatus, RuntimeAction, RuntimeError};
use crate::service::{DesiredState, ManagedService};
use crate::{CancelToken, is_cancelled};

/// Reconciler timing.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Limit for a status query.
    pub observe_timeout: Duration,
    /// Limit for one lifecycle verb (includes the stop grace period).
    pub action_timeout: Duration,
    /// Limit for an image pull.
    pub pull_timeout: Duration,
    /// Pause before the single retry.
    pub retry_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            observe_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(40),
            pull_timeout: Duration::from_secs(600),
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl From<&Config> for ReconcilerConfig {
    fn from(config: &Config) -> Self {
        Self {
            observe_timeout: config.runtime_timeout,
            // Outer bound sits above the runtime's own per-call limit.
            action_timeout: config.runtime_timeout + config.stop_grace + Duration::from_secs(5),
            pull_timeout: config.runtime_timeout * 10 + Duration::from_secs(5),
            retry_delay: config.retry_delay,
        }
    }
}

/// Result of reconciling one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Desired state reached on the first attempt (or already there).
    Converged,
    /// Desired state reached after the single retry.
    Retried,
    /// Desired state not reached.
    Failed {
        /// Why.
        reason: String,
    },
}

impl Outcome {
    /// Whether the desired state was reached.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Everything that happened to one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    /// Service name.
    pub service: String,
    /// Target state.
    pub desired: DesiredState,
    /// Status before any action.
    pub initial: ObservedStatus,
    /// Last observed status.
    pub last: Observation,
    /// Actions sent to the runtime, in order.
    pub actions: Vec<RuntimeAction>,
    /// Final verdict.
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Aggregate over a set of services.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Per-service reports in processing order.
    pub services: Vec<ServiceReport>,
    /// Services not processed because the run was cancelled.
    pub skipped: Vec<String>,
}

impl ReconcileReport {
    /// Whether every service reached its desired state.
    pub fn is_success(&self) -> bool {
        self.skipped.is_empty() && self.services.iter().all(|r| r.outcome.is_success())
    }

    /// Reports of services that did not converge.
    pub fn failures(&self) -> impl Iterator<Item = &ServiceReport> {
        self.services.iter().filter(|r| !r.outcome.is_success())
    }

    /// Number of services that reached their desired state.
    pub fn succeeded(&self) -> usize {
        self.services
            .iter()
            .filter(|r| r.outcome.is_success())
            .count()
    }
}

/// Reconciles services against a container runtime.
pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Probe,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ReconcilerConfig) -> Self {
        let probe = Probe::new(runtime.clone(), config.observe_timeout);
        Self {
            runtime,
            probe,
            config,
        }
    }

    /// Drive one service to its desired state.
    pub async fn reconcile(&self, service: &ManagedService) -> ServiceReport {
        let desired = service.desired_state;
        let initial = self.probe.observe(service).await;
        let mut report = ServiceReport {
            service: service.name.clone(),
            desired,
            initial: initial.status,
            last: initial.clone(),
            actions: Vec::new(),
            outcome: Outcome::Converged,
        };

        let verbs = match plan(initial.status, desired) {
            Plan::NoOp => {
                debug!(service = %service.name, status = %initial.status, "Already converged");
                return report;
            }
            Plan::Refuse(reason) => {
                return fail(report, with_detail(reason, &initial));
            }
            Plan::Apply(verbs) => verbs,
        };

        info!(
            service = %service.name,
            observed = %initial.status,
            desired = %desired,
            verbs = ?verbs,
            "Applying transition"
        );
        let mut last_error = self.apply(service, &verbs, &mut report.actions).await.err();

        let after = self.probe.observe(service).await;
        report.last = after.clone();
        if is_converged(after.status, desired) {
            info!(service = %service.name, status = %after.status, "Converged");
            return report;
        }
        if after.status == ObservedStatus::Unknown {
            return fail(report, with_detail("runtime state unknown after transition".to_string(), &after));
        }

        warn!(
            service = %service.name,
            observed = %after.status,
            desired = %desired,
            error = ?last_error.as_ref().map(|e| e.to_string()),
            retry_in_ms = self.config.retry_delay.as_millis() as u64,
            "Transition did not converge, retrying once"
        );
        tokio::time::sleep(self.config.retry_delay).await;

        let before_retry = self.probe.observe(service).await;
        report.last = before_retry.clone();
        match recovery_plan(before_retry.status, desired) {
            Plan::NoOp => {
                info!(service = %service.name, status = %before_retry.status, "Converged after delay");
                report.outcome = Outcome::Retried;
                return report;
            }
            Plan::Refuse(reason) => {
                return fail(report, with_detail(reason, &before_retry));
            }
            Plan::Apply(verbs) => {
                if let Err(e) = self.apply(service, &verbs, &mut report.actions).await {
                    last_error = Some(e);
                }
            }
        }

        let final_obs = self.probe.observe(service).await;
        report.last = final_obs.clone();
        if is_converged(final_obs.status, desired) {
            info!(service = %service.name, status = %final_obs.status, "Converged after retry");
            report.outcome = Outcome::Retried;
            return report;
        }

        let mut reason = format!("observed {} after retry, wanted {}", final_obs.status, desired);
        if let Some(e) = last_error {
            reason.push_str(&format!(": {e}"));
        }
        fail(report, with_detail(reason, &final_obs))
    }

    /// Reconcile services in declared order.
    pub async fn reconcile_all(
        &self,
        services: &[ManagedService],
        cancel: Option<&CancelToken>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for (i, service) in services.iter().enumerate() {
            if is_cancelled(cancel) {
                warn!(remaining = services.len() - i, "Reconcile cancelled");
                report
                    .skipped
                    .extend(services[i..].iter().map(|s| s.name.clone()));
                break;
            }
            report.services.push(self.reconcile(service).await);
        }
        log_summary(&report);
        report
    }

    /// Remove and recreate a service so it starts from its current spec and
    /// image.
    pub async fn recreate(&self, service: &ManagedService) -> ServiceReport {
        let mut teardown = service.clone();
        teardown.desired_state = DesiredState::Absent;
        let removed = self.reconcile(&teardown).await;

        let mut target = service.clone();
        target.desired_state = DesiredState::Running;
        if let Outcome::Failed { reason } = &removed.outcome {
            let reason = format!("could not remove before recreate: {reason}");
            return ServiceReport {
                desired: DesiredState::Running,
                outcome: Outcome::Failed { reason },
                ..removed
            };
        }

        let started = self.reconcile(&target).await;
        let outcome = match (&removed.outcome, &started.outcome) {
            (_, Outcome::Failed { .. }) => started.outcome.clone(),
            (Outcome::Retried, _) | (_, Outcome::Retried) => Outcome::Retried,
            _ => Outcome::Converged,
        };
        let mut actions = removed.actions;
        actions.extend(started.actions);
        ServiceReport {
            service: service.name.clone(),
            desired: DesiredState::Running,
            initial: removed.initial,
            last: started.last,
            actions,
            outcome,
        }
    }

    /// Pull each running service's image and recreate it. Services whose
    /// desired state is not `Running` are reconciled normally. A failed pull
    /// leaves the existing container alone.
    pub async fn upgrade_all(
        &self,
        services: &[ManagedService],
        cancel: Option<&CancelToken>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for (i, service) in services.iter().enumerate() {
            if is_cancelled(cancel) {
                warn!(remaining = services.len() - i, "Upgrade cancelled");
                report
                    .skipped
                    .extend(services[i..].iter().map(|s| s.name.clone()));
                break;
            }

            if service.desired_state != DesiredState::Running {
                report.services.push(self.reconcile(service).await);
                continue;
            }

            info!(service = %service.name, image = %service.container.image, "Pulling image");
            let pulled = match tokio::time::timeout(self.config.pull_timeout, self.runtime.pull(service)).await {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::Timeout(self.config.pull_timeout)),
            };
            if let Err(e) = pulled {
                error!(service = %service.name, error = %e, "Image pull failed, keeping current container");
                let observed = self.probe.observe(service).await;
                report.services.push(ServiceReport {
                    service: service.name.clone(),
                    desired: DesiredState::Running,
                    initial: observed.status,
                    last: observed,
                    actions: Vec::new(),
                    outcome: Outcome::Failed {
                        reason: format!("pull failed: {e}"),
                    },
                });
                continue;
            }

            report.services.push(self.recreate(service).await);
        }
        log_summary(&report);
        report
    }

    /// Apply verbs in order, recording each one. Stops at the first error so a
    /// failed stop is never followed by a remove.
    async fn apply(
        &self,
        service: &ManagedService,
        verbs: &[ActionVerb],
        log: &mut Vec<RuntimeAction>,
    ) -> Result<(), RuntimeError> {
        for verb in verbs {
            log.push(RuntimeAction::new(&service.name, *verb));
            let result = match tokio::time::timeout(
                self.config.action_timeout,
                self.runtime.execute(service, *verb),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::Timeout(self.config.action_timeout)),
            };
            if let Err(e) = result {
                warn!(service = %service.name, verb = %verb, error = %e, "Action failed");
                return Err(e);
            }
            debug!(service = %service.name, verb = %verb, "Action applied");
        }
        Ok(())
    }
}

fn with_detail(reason: String, observation: &Observation) -> String {
    match &observation.reason {
        Some(detail) => format!("{reason}: {detail}"),
        None => reason,
    }
}

fn fail(mut report: ServiceReport, reason: String) -> ServiceReport {
    error!(service = %report.service, reason = %reason, "Reconcile failed");
    report.outcome = Outcome::Failed { reason };
    report
}

fn log_summary(report: &ReconcileReport) {
    let failed = report.services.len() - report.succeeded();
    if failed > 0 || !report.skipped.is_empty() {
        warn!(
            succeeded = report.succeeded(),
            failed = failed,
            skipped = report.skipped.len(),
            "Reconcile finished with failures"
        );
    } else {
        info!(succeeded = report.succeeded(), "Reconcile finished");
    }
}
