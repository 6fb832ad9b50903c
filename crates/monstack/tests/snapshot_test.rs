// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the snapshot store (create, prune, list, restore).

use monstack::service::{ContainerSpec, DesiredState, ManagedService};
use monstack::snapshot::{
    BackupStore, Restorer, RetentionPolicy, SnapshotError, SnapshotId, SnapshotLayout,
    SnapshotManager, archive, retention,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

struct Host {
    _dir: TempDir,
    state: PathBuf,
    conf: PathBuf,
    backups: PathBuf,
}

impl Host {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        let conf = dir.path().join("conf");
        let backups = dir.path().join("backups");
        fs::create_dir_all(&state).unwrap();
        fs::create_dir_all(&conf).unwrap();
        Self {
            _dir: dir,
            state,
            conf,
            backups,
        }
    }

    fn store(&self) -> BackupStore {
        BackupStore::new(&self.backups, "m")
    }

    fn manager(&self) -> SnapshotManager {
        SnapshotManager::new(self.store())
    }

    /// A stateful service with one data file and one config file.
    fn stateful(&self, name: &str) -> ManagedService {
        let data = self.state.join(name);
        fs::create_dir_all(data.join("wal")).unwrap();
        fs::write(data.join("db"), format!("{name} data")).unwrap();
        fs::write(data.join("wal/000001"), "segment").unwrap();

        let config = self.conf.join(format!("{name}.yml"));
        fs::write(&config, format!("name: {name}\n")).unwrap();

        service(name, Some(data), vec![config])
    }

    fn entries(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.backups)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn service(name: &str, data: Option<PathBuf>, config: Vec<PathBuf>) -> ManagedService {
    ManagedService {
        name: name.to_string(),
        data_path: data,
        config_paths: config,
        desired_state: DesiredState::Running,
        container: ContainerSpec {
            image: format!("{name}:latest"),
            ..Default::default()
        },
    }
}

fn id(s: &str) -> SnapshotId {
    SnapshotId::parse(s).unwrap()
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

// ============================================================================
// Creation
// ============================================================================

#[test]
fn test_directory_snapshot_layout() {
    let host = Host::new();
    let services = [host.stateful("dashboard"), service("agent", None, vec![])];

    let snapshot = host
        .manager()
        .create_with_id(&services, false, id("20240101000000"), None)
        .unwrap();

    assert!(!snapshot.compressed);
    assert_eq!(snapshot.path, host.backups.join("m-20240101000000"));
    assert_eq!(read(&snapshot.path.join("dashboard/db")), "dashboard data");
    assert_eq!(read(&snapshot.path.join("dashboard/wal/000001")), "segment");
    assert_eq!(
        read(&snapshot.path.join("config/dashboard/dashboard.yml")),
        "name: dashboard\n"
    );
    assert!(snapshot.path.join("manifest.json").is_file());
    assert!(!snapshot.path.join("agent").exists());
    assert_eq!(
        snapshot.entries["dashboard"],
        ["dashboard".to_string(), "config/dashboard".to_string()]
    );
}

#[test]
fn test_compressed_snapshot_is_single_file() {
    let host = Host::new();
    let services = [host.stateful("dashboard"), host.stateful("metrics-collector")];

    let snapshot = host
        .manager()
        .create_with_id(&services, true, id("20240101000000"), None)
        .unwrap();

    assert!(snapshot.compressed);
    assert!(snapshot.path.is_file());
    assert_eq!(host.entries(), ["m-20240101000000.tar.gz"]);
    assert!(snapshot.size_bytes > 0);

    let unpacked = TempDir::new().unwrap();
    archive::unpack_tar_gz(&snapshot.path, unpacked.path()).unwrap();
    assert!(unpacked.path().join("manifest.json").is_file());
    assert!(unpacked.path().join("dashboard.tar.gz").is_file());
    assert!(unpacked.path().join("metrics-collector.tar.gz").is_file());
}

#[test]
fn test_failed_snapshot_leaves_nothing_behind() {
    let host = Host::new();
    let a = host.stateful("dashboard");
    let b = service(
        "proxy",
        None,
        vec![host.conf.join("nginx/conf.d-does-not-exist")],
    );

    for compress in [true, false] {
        let err = host
            .manager()
            .create_with_id(&[a.clone(), b.clone()], compress, id("20240101000000"), None)
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Io { .. }), "{err}");
        assert!(!err.is_precondition());
        assert!(host.entries().is_empty(), "{:?}", host.entries());
    }
}

#[test]
fn test_unreadable_data_path_writes_nothing() {
    let host = Host::new();
    let missing = service("dashboard", Some(host.state.join("missing")), vec![]);

    let err = host
        .manager()
        .create_with_id(&[missing], true, id("20240101000000"), None)
        .unwrap_err();

    assert!(err.is_precondition());
    assert!(!host.backups.exists() || host.entries().is_empty());
}

#[test]
fn test_stale_partials_are_swept() {
    let host = Host::new();
    fs::create_dir_all(host.backups.join(".m-20230101000000.partial/dashboard")).unwrap();
    fs::write(host.backups.join(".m-20230101000000.tar.gz.partial"), "junk").unwrap();
    fs::create_dir_all(host.backups.join(".m-20230101000000.restore")).unwrap();

    host.manager()
        .create_with_id(&[host.stateful("dashboard")], true, id("20240101000000"), None)
        .unwrap();

    assert_eq!(host.entries(), ["m-20240101000000.tar.gz"]);
}

// ============================================================================
// Retention
// ============================================================================

#[test]
fn test_retention_holds_after_every_run() {
    let host = Host::new();
    let services = [host.stateful("dashboard")];
    let policy = RetentionPolicy::keep(3);
    let ids = [
        "20240101000000",
        "20240102000000",
        "20240103000000",
        "20240104000000",
        "20240105000000",
        "20240106000000",
    ];

    for (n, raw) in ids.iter().enumerate() {
        // Alternate layouts; retention ignores the difference.
        host.manager()
            .create_with_id(&services, n % 2 == 0, id(raw), None)
            .unwrap();
        let report = retention::prune(&host.store(), policy).unwrap();
        assert!(report.is_success());

        let listed = host.store().list().unwrap();
        assert_eq!(listed.len(), (n + 1).min(3));
        let expected: Vec<&str> = ids[..=n].iter().rev().take(3).copied().collect();
        let actual: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(actual, expected);
    }
}

#[test]
fn test_prune_keep_zero_keeps_everything() {
    let host = Host::new();
    let services = [host.stateful("dashboard")];
    for day in 1..=5 {
        host.manager()
            .create_with_id(&services, false, id(&format!("202401{day:02}000000")), None)
            .unwrap();
    }

    let report = retention::prune(&host.store(), RetentionPolicy::keep(0)).unwrap();

    assert!(report.removed.is_empty());
    assert_eq!(report.kept.len(), 5);
    assert_eq!(host.store().list().unwrap().len(), 5);
}

#[test]
fn test_list_ignores_foreign_and_hidden_entries() {
    let host = Host::new();
    host.manager()
        .create_with_id(&[host.stateful("dashboard")], true, id("20240102000000"), None)
        .unwrap();
    host.manager()
        .create_with_id(&[host.stateful("dashboard")], false, id("20240101000000"), None)
        .unwrap();
    fs::write(host.backups.join("notes.txt"), "keep me").unwrap();
    fs::create_dir(host.backups.join("other-20240101000000")).unwrap();

    let listed = host.store().list().unwrap();
    let summary: Vec<_> = listed.iter().map(|s| (s.id.as_str(), s.layout)).collect();
    assert_eq!(
        summary,
        [
            ("20240102000000", SnapshotLayout::Archive),
            ("20240101000000", SnapshotLayout::Directory)
        ]
    );

    retention::prune(&host.store(), RetentionPolicy::keep(1)).unwrap();
    assert!(host.backups.join("notes.txt").exists());
    assert!(host.backups.join("other-20240101000000").exists());
}

// ============================================================================
// Restore
// ============================================================================

fn damage(data: &Path) {
    fs::remove_file(data.join("db")).unwrap();
    fs::write(data.join("wal/000001"), "overwritten").unwrap();
    fs::write(data.join("stray"), "not in snapshot").unwrap();
}

fn assert_restored(data: &Path, name: &str) {
    assert_eq!(read(&data.join("db")), format!("{name} data"));
    assert_eq!(read(&data.join("wal/000001")), "segment");
    assert!(!data.join("stray").exists());
}

#[test]
fn test_restore_round_trip() {
    for compress in [true, false] {
        let host = Host::new();
        let dashboard = host.stateful("dashboard");
        let agent = service("agent", None, vec![]);
        let services = [dashboard.clone(), agent];

        host.manager()
            .create_with_id(&services, compress, id("20240101000000"), None)
            .unwrap();
        let data = dashboard.data_path.clone().unwrap();
        damage(&data);

        let restorer = Restorer::new(host.store());
        let snapshot = restorer.resolve(None).unwrap();
        let report = restorer.restore(&snapshot, &services).unwrap();

        assert!(report.is_success());
        assert_eq!(report.restored, ["dashboard"]);
        assert_eq!(report.skipped, ["agent"]);
        assert_restored(&data, "dashboard");
        // No scratch left in the store.
        assert_eq!(host.entries().len(), 1, "{:?}", host.entries());
    }
}

#[test]
fn test_linked_paths_captured_by_content() {
    for compress in [true, false] {
        let host = Host::new();
        let real = host.state.join("real");
        fs::create_dir_all(&real).unwrap();
        fs::write(real.join("tsdb.bin"), "samples").unwrap();
        let data = host.state.join("metrics");
        std::os::unix::fs::symlink(&real, &data).unwrap();

        let real_config = host.conf.join("shipped.yml");
        fs::write(&real_config, "retention: 15d\n").unwrap();
        let config = host.conf.join("prometheus.yml");
        std::os::unix::fs::symlink(&real_config, &config).unwrap();

        let metrics = service("metrics-collector", Some(data.clone()), vec![config]);
        let snapshot = host
            .manager()
            .create_with_id(&[metrics.clone()], compress, id("20240101000000"), None)
            .unwrap();

        if !compress {
            let captured = snapshot.path.join("metrics-collector");
            assert!(!fs::symlink_metadata(&captured).unwrap().file_type().is_symlink());
            assert_eq!(read(&captured.join("tsdb.bin")), "samples");
            assert_eq!(
                read(&snapshot.path.join("config/metrics-collector/prometheus.yml")),
                "retention: 15d\n"
            );
        }

        fs::remove_file(real.join("tsdb.bin")).unwrap();
        let restorer = Restorer::new(host.store());
        let snapshot = restorer.resolve(None).unwrap();
        let report = restorer.restore(&snapshot, &[metrics]).unwrap();

        assert!(report.is_success(), "compress={compress}");
        assert_eq!(read(&real.join("tsdb.bin")), "samples", "compress={compress}");
        assert!(fs::symlink_metadata(&data).unwrap().file_type().is_symlink());
    }
}

#[test]
fn test_config_only_service_in_compressed_snapshot() {
    let host = Host::new();
    let config = host.conf.join("proxy.conf");
    fs::write(&config, "listen 443;\n").unwrap();
    let proxy = service("proxy", None, vec![config]);
    let dashboard = host.stateful("dashboard");
    let services = [dashboard.clone(), proxy];

    let snapshot = host
        .manager()
        .create_with_id(&services, true, id("20240101000000"), None)
        .unwrap();
    assert_eq!(snapshot.entries["proxy"], ["proxy.tar.gz".to_string()]);

    let bundle = TempDir::new().unwrap();
    archive::unpack_tar_gz(&snapshot.path, bundle.path()).unwrap();
    let member = TempDir::new().unwrap();
    archive::unpack_tar_gz(&bundle.path().join("proxy.tar.gz"), member.path()).unwrap();
    assert_eq!(read(&member.path().join("config/proxy.conf")), "listen 443;\n");
    assert!(!member.path().join("data").exists());

    let data = dashboard.data_path.clone().unwrap();
    damage(&data);
    let restorer = Restorer::new(host.store());
    let report = restorer.restore(&restorer.resolve(None).unwrap(), &services).unwrap();
    assert!(report.is_success());
    assert_eq!(report.restored, ["dashboard"]);
    assert_eq!(report.skipped, ["proxy"]);
    assert_restored(&data, "dashboard");
}

#[test]
fn test_restore_specific_snapshot() {
    let host = Host::new();
    let dashboard = host.stateful("dashboard");
    let data = dashboard.data_path.clone().unwrap();

    host.manager()
        .create_with_id(&[dashboard.clone()], true, id("20240101000000"), None)
        .unwrap();
    fs::write(data.join("db"), "newer").unwrap();
    host.manager()
        .create_with_id(&[dashboard.clone()], true, id("20240102000000"), None)
        .unwrap();

    let restorer = Restorer::new(host.store());
    let older = restorer.resolve(Some(&id("20240101000000"))).unwrap();
    restorer.restore(&older, &[dashboard.clone()]).unwrap();
    assert_eq!(read(&data.join("db")), "dashboard data");

    let latest = restorer.resolve(None).unwrap();
    assert_eq!(latest.id.as_str(), "20240102000000");
    restorer.restore(&latest, &[dashboard]).unwrap();
    assert_eq!(read(&data.join("db")), "newer");

    assert!(matches!(
        restorer.resolve(Some(&id("20250101000000"))),
        Err(SnapshotError::NotFound(_))
    ));
}

#[test]
fn test_restore_detects_checksum_mismatch() {
    let host = Host::new();
    let dashboard = host.stateful("dashboard");
    let proxy = host.stateful("proxy");
    let services = [dashboard.clone(), proxy.clone()];
    let snapshot = host
        .manager()
        .create_with_id(&services, true, id("20240101000000"), None)
        .unwrap();

    // Swap the dashboard member for a different, well-formed archive while
    // keeping the original manifest.
    let work = TempDir::new().unwrap();
    let unpacked = work.path().join("bundle");
    archive::unpack_tar_gz(&snapshot.path, &unpacked).unwrap();
    let decoy = work.path().join("decoy");
    fs::create_dir_all(decoy.join("data")).unwrap();
    fs::write(decoy.join("data/db"), "tampered").unwrap();
    archive::write_tar_gz(
        &unpacked.join("dashboard.tar.gz"),
        &[archive::Member {
            source: &decoy.join("data"),
            name: "data".to_string(),
        }],
    )
    .unwrap();
    let names = ["manifest.json", "dashboard.tar.gz", "proxy.tar.gz"];
    let paths: Vec<PathBuf> = names.iter().map(|n| unpacked.join(n)).collect();
    let members: Vec<archive::Member<'_>> = paths
        .iter()
        .zip(names)
        .map(|(source, name)| archive::Member {
            source,
            name: name.to_string(),
        })
        .collect();
    archive::write_tar_gz(&snapshot.path, &members).unwrap();

    damage(dashboard.data_path.as_ref().unwrap());
    damage(proxy.data_path.as_ref().unwrap());

    let restorer = Restorer::new(host.store());
    let stored = restorer.resolve(None).unwrap();
    let report = restorer.restore(&stored, &services).unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "dashboard");
    assert!(report.failed[0].1.contains("checksum mismatch"));
    // The tampered data never reached the data path; the sibling was restored.
    assert_ne!(
        fs::read_to_string(dashboard.data_path.as_ref().unwrap().join("db")).ok(),
        Some("tampered".to_string())
    );
    assert_restored(proxy.data_path.as_ref().unwrap(), "proxy");
}
