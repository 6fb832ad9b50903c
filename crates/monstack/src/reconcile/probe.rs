// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime state probe.
//!
//! Observations are always taken fresh from the runtime and never cached.
//! "No such container" is a normal answer (`Absent`); only an unreachable,
//! hung or incoherent runtime yields `Unknown`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::runtime::{ContainerRuntime, ObservedStatus, RuntimeError};
use crate::service::ManagedService;

/// One service's observed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observation {
    /// What the runtime reported.
    pub status: ObservedStatus,
    /// Why the status is `Unknown`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Observation {
    fn known(status: ObservedStatus) -> Self {
        Self {
            status,
            reason: None,
        }
    }

    fn unknown(reason: impl Into<String>) -> Self {
        Self {
            status: ObservedStatus::Unknown,
            reason: Some(reason.into()),
        }
    }
}

/// Statuses of a set of services, keyed by name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeObservation {
    /// Observation per service.
    pub statuses: BTreeMap<String, Observation>,
}

impl RuntimeObservation {
    /// Status of one service, `Unknown` if it was not observed.
    pub fn status(&self, service: &str) -> ObservedStatus {
        self.statuses
            .get(service)
            .map(|o| o.status)
            .unwrap_or(ObservedStatus::Unknown)
    }
}

/// Reads container status through a runtime with a per-call timeout.
#[derive(Clone)]
pub struct Probe {
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
}

impl Probe {
    /// Create a probe.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// Observe one service.
    pub async fn observe(&self, service: &ManagedService) -> Observation {
        let observation = match tokio::time::timeout(self.timeout, self.runtime.inspect(&service.name)).await {
            Ok(Ok(status)) => Observation::known(status),
            Ok(Err(e)) => Observation::unknown(e.to_string()),
            Err(_) => Observation::unknown(RuntimeError::Timeout(self.timeout).to_string()),
        };

        match &observation.reason {
            Some(reason) => warn!(service = %service.name, reason = %reason, "Runtime status unknown"),
            None => debug!(service = %service.name, status = %observation.status, "Observed service"),
        }
        observation
    }

    /// Observe every service, in order.
    pub async fn observe_all(&self, services: &[ManagedService]) -> RuntimeObservation {
        let mut observation = RuntimeObservation::default();
        for service in services {
            let o = self.observe(service).await;
            observation.statuses.insert(service.name.clone(), o);
        }
        observation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use crate::service::{ContainerSpec, DesiredState};

    fn service(name: &str) -> ManagedService {
        ManagedService {
            name: name.to_string(),
            data_path: None,
            config_paths: vec![],
            desired_state: DesiredState::Running,
            container: ContainerSpec {
                image: "busybox".to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_absent_is_not_an_error() {
        let runtime = MockRuntime::new();
        let probe = Probe::new(Arc::new(runtime), Duration::from_secs(1));
        let o = probe.observe(&service("dashboard")).await;
        assert_eq!(o.status, ObservedStatus::Absent);
        assert!(o.reason.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_is_unknown() {
        let runtime = MockRuntime::new();
        runtime.set_unreachable(true);
        let probe = Probe::new(Arc::new(runtime), Duration::from_secs(1));
        let o = probe.observe(&service("dashboard")).await;
        assert_eq!(o.status, ObservedStatus::Unknown);
        assert!(o.reason.unwrap().contains("unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_runtime_times_out_to_unknown() {
        let runtime = MockRuntime::new();
        runtime.set_hang(true);
        let probe = Probe::new(Arc::new(runtime), Duration::from_secs(5));
        let o = probe.observe(&service("dashboard")).await;
        assert_eq!(o.status, ObservedStatus::Unknown);
        assert!(o.reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_observe_all() {
        let runtime = MockRuntime::new();
        runtime.set_status("a", ObservedStatus::Running).await;
        runtime.set_status("b", ObservedStatus::Created).await;
        let probe = Probe::new(Arc::new(runtime), Duration::from_secs(1));

        let all = probe
            .observe_all(&[service("a"), service("b"), service("c")])
            .await;
        assert_eq!(all.status("a"), ObservedStatus::Running);
        assert_eq!(all.status("b"), ObservedStatus::Created);
        assert_eq!(all.status("c"), ObservedStatus::Absent);
        assert_eq!(all.status("zzz"), ObservedStatus::Unknown);
    }
}
