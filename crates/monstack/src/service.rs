// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Managed service table.
//!
//! The table is registered once at process start, either from the built-in
//! monitoring stack or from a JSON file. Order matters: services are
//! snapshotted and reconciled in declared order, so the metrics collector is
//! listed before the dashboard that queries it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigError};
use crate::snapshot::manager::MANIFEST_FILE;

/// State a service should be driven to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    /// Container exists and its task is running.
    Running,
    /// No task running; the container may or may not exist.
    Stopped,
    /// No container exists.
    Absent,
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Absent => "absent",
        };
        f.write_str(s)
    }
}

impl FromStr for DesiredState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "absent" => Ok(Self::Absent),
            other => Err(format!("unknown desired state: {other}")),
        }
    }
}

/// A host path mounted into the service container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Path on the host.
    pub host: PathBuf,
    /// Path inside the container.
    pub container: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// How the runtime creates a service's container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference, including tag.
    pub image: String,
    /// Network mode (`host`, a named network, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// PID namespace mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    /// Restart policy handed to the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    /// Run as this user (`uid[:gid]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Published ports in `HOST:CONTAINER` form.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Bind mounts.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Arguments appended after the image.
    #[serde(default)]
    pub args: Vec<String>,
}

/// A named unit under lifecycle control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedService {
    /// Unique name, also used as the container name.
    pub name: String,
    /// Durable state directory; `None` for stateless services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<PathBuf>,
    /// Read-only configuration inputs, in order.
    #[serde(default)]
    pub config_paths: Vec<PathBuf>,
    /// Target state for reconciliation.
    pub desired_state: DesiredState,
    /// Container definition.
    pub container: ContainerSpec,
}

impl ManagedService {
    /// Whether this service holds durable state.
    pub fn is_stateful(&self) -> bool {
        self.data_path
            .as_ref()
            .is_some_and(|p| !p.as_os_str().is_empty())
    }
}

/// Ordered, validated set of managed services.
#[derive(Debug, Clone)]
pub struct ServiceTable {
    services: Vec<ManagedService>,
}

impl ServiceTable {
    /// Build a table, validating names and config paths.
    pub fn new(services: Vec<ManagedService>) -> Result<Self, ConfigError> {
        let mut names = HashSet::new();
        for service in &services {
            if !is_valid_name(&service.name) {
                return Err(ConfigError::InvalidServiceTable(format!(
                    "invalid service name {:?}",
                    service.name
                )));
            }
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::InvalidServiceTable(format!(
                    "duplicate service name {:?}",
                    service.name
                )));
            }
            if service.container.image.is_empty() {
                return Err(ConfigError::InvalidServiceTable(format!(
                    "service {:?} has no image",
                    service.name
                )));
            }
            let mut basenames = HashSet::new();
            for path in &service.config_paths {
                let Some(base) = path.file_name() else {
                    return Err(ConfigError::InvalidServiceTable(format!(
                        "service {:?} has config path without a file name: {}",
                        service.name,
                        path.display()
                    )));
                };
                if !basenames.insert(base.to_os_string()) {
                    return Err(ConfigError::InvalidServiceTable(format!(
                        "service {:?} has two config paths named {:?}",
                        service.name, base
                    )));
                }
            }
        }
        Ok(Self { services })
    }

    /// Load the table from `config.services_file`, or fall back to the
    /// built-in monitoring stack.
    pub fn load(config: &Config) -> Result<Self, ConfigError> {
        match &config.services_file {
            Some(path) => Self::from_file(path),
            None => Self::new(default_stack(config)),
        }
    }

    /// Parse a JSON array of services.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ServicesFile {
            path: path.to_path_buf(),
            source,
        })?;
        let services: Vec<ManagedService> =
            serde_json::from_str(&raw).map_err(|source| ConfigError::ServicesParse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(services)
    }

    /// Services in declared order.
    pub fn services(&self) -> &[ManagedService] {
        &self.services
    }

    /// Look up a service by name.
    pub fn get(&self, name: &str) -> Option<&ManagedService> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Narrow the table to the named services, keeping declared order.
    /// An empty selection keeps every service.
    pub fn select(&self, names: &[String]) -> Result<Self, ConfigError> {
        if names.is_empty() {
            return Ok(self.clone());
        }
        if let Some(unknown) = names.iter().find(|n| self.get(n).is_none()) {
            return Err(ConfigError::InvalidServiceTable(format!(
                "unknown service {unknown:?}"
            )));
        }
        let services = self
            .services
            .iter()
            .filter(|s| names.contains(&s.name))
            .cloned()
            .collect();
        Ok(Self { services })
    }

    /// Apply an explicit reconcile request: every service gets `state`.
    pub fn with_desired(&self, state: DesiredState) -> Self {
        let services = self
            .services
            .iter()
            .cloned()
            .map(|mut s| {
                s.desired_state = state;
                s
            })
            .collect();
        Self { services }
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Names double as container names and as snapshot member names, so `config`
/// (the directory-layout config root) and the manifest file name are reserved.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "config"
        && name != MANIFEST_FILE
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
}

/// The built-in monitoring stack.
pub fn default_stack(config: &Config) -> Vec<ManagedService> {
    let state = &config.state_dir;
    let conf = &config.config_dir;
    let restart = Some("unless-stopped".to_string());

    vec![
        ManagedService {
            name: "metrics-collector".to_string(),
            data_path: Some(state.join("prometheus")),
            config_paths: vec![conf.join("prometheus")],
            desired_state: DesiredState::Running,
            container: ContainerSpec {
                image: "prom/prometheus:latest".to_string(),
                network: Some("host".to_string()),
                restart: restart.clone(),
                user: Some("65534:65534".to_string()),
                volumes: vec![
                    VolumeMount {
                        host: state.join("prometheus"),
                        container: "/prometheus".to_string(),
                        read_only: false,
                    },
                    VolumeMount {
                        host: conf.join("prometheus"),
                        container: "/etc/prometheus".to_string(),
                        read_only: true,
                    },
                ],
                args: vec![
                    "--config.file=/etc/prometheus/prometheus.yml".to_string(),
                    "--storage.tsdb.path=/prometheus".to_string(),
                    "--web.listen-address=127.0.0.1:9090".to_string(),
                ],
                ..Default::default()
            },
        },
        ManagedService {
            name: "agent".to_string(),
            data_path: None,
            config_paths: Vec::new(),
            desired_state: DesiredState::Running,
            container: ContainerSpec {
                image: "prom/node-exporter:latest".to_string(),
                network: Some("host".to_string()),
                pid: Some("host".to_string()),
                restart: restart.clone(),
                volumes: vec![VolumeMount {
                    host: PathBuf::from("/"),
                    container: "/host".to_string(),
                    read_only: true,
                }],
                args: vec![
                    "--path.rootfs=/host".to_string(),
                    "--web.listen-address=127.0.0.1:9100".to_string(),
                ],
                ..Default::default()
            },
        },
        ManagedService {
            name: "dashboard".to_string(),
            data_path: Some(state.join("grafana")),
            config_paths: vec![conf.join("grafana").join("provisioning")],
            desired_state: DesiredState::Running,
            container: ContainerSpec {
                image: "grafana/grafana:latest".to_string(),
                network: Some("host".to_string()),
                restart: restart.clone(),
                user: Some("472:0".to_string()),
                volumes: vec![
                    VolumeMount {
                        host: state.join("grafana"),
                        container: "/var/lib/grafana".to_string(),
                        read_only: false,
                    },
                    VolumeMount {
                        host: conf.join("grafana").join("provisioning"),
                        container: "/etc/grafana/provisioning".to_string(),
                        read_only: true,
                    },
                ],
                env: BTreeMap::from([(
                    "GF_SERVER_HTTP_ADDR".to_string(),
                    "127.0.0.1".to_string(),
                )]),
                ..Default::default()
            },
        },
        ManagedService {
            name: "proxy".to_string(),
            data_path: None,
            config_paths: vec![conf.join("nginx").join("conf.d")],
            desired_state: DesiredState::Running,
            container: ContainerSpec {
                image: "nginx:stable".to_string(),
                network: Some("host".to_string()),
                restart,
                volumes: vec![VolumeMount {
                    host: conf.join("nginx").join("conf.d"),
                    container: "/etc/nginx/conf.d".to_string(),
                    read_only: true,
                }],
                ..Default::default()
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> ManagedService {
        ManagedService {
            name: name.to_string(),
            data_path: None,
            config_paths: Vec::new(),
            desired_state: DesiredState::Running,
            container: ContainerSpec {
                image: "busybox".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_default_stack_order() {
        let table = ServiceTable::load(&Config::default()).unwrap();
        let names: Vec<_> = table.services().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["metrics-collector", "agent", "dashboard", "proxy"]);
        assert!(table.get("metrics-collector").unwrap().is_stateful());
        assert!(!table.get("agent").unwrap().is_stateful());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = ServiceTable::new(vec![service("a"), service("a")]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_invalid_name_rejected() {
        assert!(ServiceTable::new(vec![service("Dash Board")]).is_err());
        assert!(ServiceTable::new(vec![service("")]).is_err());
        assert!(ServiceTable::new(vec![service("../etc")]).is_err());
        assert!(ServiceTable::new(vec![service("config")]).is_err());
    }

    #[test]
    fn test_manifest_name_reserved() {
        assert!(ServiceTable::new(vec![service("manifest.json")]).is_err());
        assert!(ServiceTable::new(vec![service("manifest")]).is_ok());
    }

    #[test]
    fn test_duplicate_config_basename_rejected() {
        let mut s = service("proxy");
        s.config_paths = vec![PathBuf::from("/a/conf.d"), PathBuf::from("/b/conf.d")];
        assert!(ServiceTable::new(vec![s]).is_err());
    }

    #[test]
    fn test_select_keeps_declared_order() {
        let table =
            ServiceTable::new(vec![service("a"), service("b"), service("c")]).unwrap();
        let selected = table
            .select(&["c".to_string(), "a".to_string()])
            .unwrap();
        let names: Vec<_> = selected.services().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
        assert!(table.select(&["zzz".to_string()]).is_err());
        assert_eq!(table.select(&[]).unwrap().len(), 3);
    }

    #[test]
    fn test_with_desired() {
        let table = ServiceTable::new(vec![service("a"), service("b")]).unwrap();
        let absent = table.with_desired(DesiredState::Absent);
        assert!(
            absent
                .services()
                .iter()
                .all(|s| s.desired_state == DesiredState::Absent)
        );
        // The original table is untouched.
        assert_eq!(table.services()[0].desired_state, DesiredState::Running);
    }

    #[test]
    fn test_desired_state_parse() {
        assert_eq!("Running".parse::<DesiredState>().unwrap(), DesiredState::Running);
        assert_eq!("absent".parse::<DesiredState>().unwrap(), DesiredState::Absent);
        assert!("paused".parse::<DesiredState>().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("services.json");
        std::fs::write(
            &path,
            r#"[{"name":"cache","data_path":"/var/lib/cache","desired_state":"stopped",
                "container":{"image":"redis:7","ports":["6379:6379"]}}]"#,
        )
        .unwrap();

        let table = ServiceTable::from_file(&path).unwrap();
        let cache = table.get("cache").unwrap();
        assert_eq!(cache.desired_state, DesiredState::Stopped);
        assert_eq!(cache.container.ports, ["6379:6379"]);
        assert!(cache.config_paths.is_empty());

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            ServiceTable::from_file(&path),
            Err(ConfigError::ServicesParse { .. })
        ));
    }
}
