// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monstack - Monitoring Stack Operations CLI
//!
//! Exit status:
//! - 0: everything succeeded
//! - 1: a snapshot failed or a service ended `Failed`
//! - 2: a precondition did not hold and nothing was attempted

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};

use monstack::reconcile::{Outcome, ReconcileReport, Reconciler, ReconcilerConfig};
use monstack::runtime::{ContainerRuntime, DockerRuntime};
use monstack::service::{DesiredState, ServiceTable};
use monstack::snapshot::{
    BackupStore, PruneReport, RestoreReport, Restorer, RetentionPolicy, SnapshotId,
    SnapshotManager, archive, retention,
};
use monstack::trigger::{self, TriggerSpec};
use monstack::{CancelToken, Config, Error, preflight};

#[derive(Parser)]
#[command(name = "monstack")]
#[command(version, about = "Monitoring stack snapshots and service reconciliation", long_about = None)]
struct Cli {
    /// Print machine-readable JSON reports
    #[arg(long, global = true)]
    json: bool,

    /// Do not require root
    #[arg(long, global = true)]
    skip_privilege_check: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// Backup directory
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Args)]
struct CompressArgs {
    /// Write a single .tar.gz bundle
    #[arg(long, conflicts_with = "no_compress")]
    compress: bool,

    /// Write a plain directory tree
    #[arg(long)]
    no_compress: bool,
}

impl CompressArgs {
    fn resolve(&self, default: bool) -> bool {
        if self.compress {
            true
        } else if self.no_compress {
            false
        } else {
            default
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot every service, then prune old snapshots
    Snapshot {
        #[command(flatten)]
        store: StoreArgs,

        /// Snapshots to keep (0 keeps all)
        #[arg(long)]
        keep: Option<u32>,

        #[command(flatten)]
        compress: CompressArgs,
    },

    /// Remove snapshots beyond the retention count
    Prune {
        #[command(flatten)]
        store: StoreArgs,

        /// Snapshots to keep (0 keeps all)
        #[arg(long)]
        keep: Option<u32>,
    },

    /// List snapshots, newest first
    List {
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Put a snapshot's data back in place
    Restore {
        #[command(flatten)]
        store: StoreArgs,

        /// Snapshot id or "latest"
        id: String,

        /// Restrict to these services
        #[arg(long = "service")]
        services: Vec<String>,
    },

    /// Drive services to their desired state
    Reconcile {
        /// Override every selected service's desired state
        #[arg(long)]
        state: Option<DesiredState>,

        /// Restrict to these services
        #[arg(long = "service")]
        services: Vec<String>,
    },

    /// Pull fresh images and recreate running services
    Upgrade {
        /// Restrict to these services
        #[arg(long = "service")]
        services: Vec<String>,
    },

    /// Stop and remove every service
    Teardown {
        /// Restrict to these services
        #[arg(long = "service")]
        services: Vec<String>,
    },

    /// Install the scheduled snapshot trigger
    InstallTrigger {
        /// monstack binary the trigger runs (defaults to this executable)
        #[arg(long)]
        entry_point: Option<PathBuf>,

        #[command(flatten)]
        store: StoreArgs,

        /// Snapshots to keep (0 keeps all)
        #[arg(long)]
        keep: Option<u32>,

        #[command(flatten)]
        compress: CompressArgs,

        /// Cron schedule expression
        #[arg(long, default_value = "0 3 * * *")]
        schedule: String,

        /// Trigger file to write
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "monstack=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            let precondition = e
                .downcast_ref::<Error>()
                .is_some_and(Error::is_precondition);
            error!("{e:#}");
            if precondition {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = Config::from_env().map_err(Error::from)?;
    config.skip_privilege_check |= cli.skip_privilege_check;
    let json = cli.json;

    let cancel: CancelToken = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing current step");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    match cli.command {
        Commands::Snapshot {
            store,
            keep,
            compress,
        } => {
            apply_store(&mut config, &store);
            config.keep_count = keep.unwrap_or(config.keep_count);
            config.compress = compress.resolve(config.compress);
            preflight::require_root(config.skip_privilege_check)?;
            snapshot(&config, cancel, json).await
        }
        Commands::Prune { store, keep } => {
            apply_store(&mut config, &store);
            config.keep_count = keep.unwrap_or(config.keep_count);
            preflight::require_root(config.skip_privilege_check)?;
            let report = prune(&config).await?;
            emit(json, &report, || print_prune(&report))?;
            Ok(report.is_success())
        }
        Commands::List { store } => {
            apply_store(&mut config, &store);
            list(&config, json)
        }
        Commands::Restore {
            store,
            id,
            services,
        } => {
            apply_store(&mut config, &store);
            restore(&config, &id, &services, cancel, json).await
        }
        Commands::Reconcile { state, services } => {
            let mut table = load_table(&config, &services)?;
            if let Some(state) = state {
                table = table.with_desired(state);
            }
            let reconciler = connect(&config).await?;
            let report = reconciler
                .reconcile_all(table.services(), Some(&cancel))
                .await;
            emit(json, &report, || print_reconcile(&report))?;
            Ok(report.is_success())
        }
        Commands::Upgrade { services } => {
            let table = load_table(&config, &services)?;
            let reconciler = connect(&config).await?;
            let report = reconciler
                .upgrade_all(table.services(), Some(&cancel))
                .await;
            emit(json, &report, || print_reconcile(&report))?;
            Ok(report.is_success())
        }
        Commands::Teardown { services } => {
            let table = load_table(&config, &services)?.with_desired(DesiredState::Absent);
            let reconciler = connect(&config).await?;
            let report = reconciler
                .reconcile_all(table.services(), Some(&cancel))
                .await;
            emit(json, &report, || print_reconcile(&report))?;
            Ok(report.is_success())
        }
        Commands::InstallTrigger {
            entry_point,
            store,
            keep,
            compress,
            schedule,
            output,
        } => {
            apply_store(&mut config, &store);
            preflight::require_root(config.skip_privilege_check)?;
            let entry_point = match entry_point {
                Some(path) => path,
                None => std::env::current_exe().context("cannot determine own executable")?,
            };
            let spec = TriggerSpec {
                schedule,
                entry_point,
                backup_dir: config.backup_dir.clone(),
                keep: keep.unwrap_or(config.keep_count),
                compress: compress.resolve(config.compress),
                lock_file: config.lock_file.clone(),
                environment: trigger::snapshot_environment(&config).map_err(Error::from)?,
            };
            let path = output.unwrap_or_else(|| config.cron_file.clone());
            spec.install(&path).map_err(Error::from)?;
            if !json {
                println!("Installed {}", path.display());
            }
            Ok(true)
        }
    }
}

fn apply_store(config: &mut Config, store: &StoreArgs) {
    if let Some(dir) = &store.dir {
        config.backup_dir = dir.clone();
    }
}

fn load_table(config: &Config, services: &[String]) -> anyhow::Result<ServiceTable> {
    let table = ServiceTable::load(config).map_err(Error::from)?;
    Ok(table.select(services).map_err(Error::from)?)
}

fn backup_store(config: &Config) -> BackupStore {
    BackupStore::new(&config.backup_dir, &config.backup_prefix)
}

/// Check privileges and runtime reachability, then build a reconciler.
async fn connect(config: &Config) -> anyhow::Result<Reconciler> {
    preflight::require_root(config.skip_privilege_check)?;
    preflight::require_binary(&config.runtime_bin)?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::from_config(config));
    preflight::require_runtime(runtime.as_ref(), config.runtime_timeout).await?;
    info!(runtime_type = runtime.runtime_type(), "Runtime reachable");
    Ok(Reconciler::new(runtime, ReconcilerConfig::from(config)))
}

#[derive(Serialize)]
struct SnapshotOutput {
    id: SnapshotId,
    path: PathBuf,
    compressed: bool,
    size_bytes: u64,
    prune: PruneReport,
}

async fn snapshot(config: &Config, cancel: CancelToken, json: bool) -> anyhow::Result<bool> {
    let table = ServiceTable::load(config).map_err(Error::from)?;
    let manager = SnapshotManager::new(backup_store(config));
    let compress = config.compress;

    info!(
        dir = %config.backup_dir.display(),
        services = table.len(),
        compress = compress,
        keep = config.keep_count,
        "Creating snapshot"
    );
    let snapshot = tokio::task::spawn_blocking(move || {
        manager.create(table.services(), compress, Some(&cancel))
    })
    .await
    .context("snapshot task panicked")?
    .map_err(Error::from)?;

    let report = prune(config).await?;
    let output = SnapshotOutput {
        id: snapshot.id.clone(),
        path: snapshot.path.clone(),
        compressed: snapshot.compressed,
        size_bytes: snapshot.size_bytes,
        prune: report,
    };
    emit(json, &output, || {
        println!(
            "Created {} ({} bytes)",
            output.path.display(),
            output.size_bytes
        );
        print_prune(&output.prune);
    })?;
    Ok(output.prune.is_success())
}

async fn prune(config: &Config) -> anyhow::Result<PruneReport> {
    let store = backup_store(config);
    let policy = RetentionPolicy::keep(config.keep_count);
    let report = tokio::task::spawn_blocking(move || retention::prune(&store, policy))
        .await
        .context("prune task panicked")?
        .map_err(Error::from)?;
    Ok(report)
}

#[derive(Serialize)]
struct ListEntry {
    id: SnapshotId,
    name: String,
    layout: monstack::snapshot::SnapshotLayout,
    created_at: chrono::DateTime<chrono::Utc>,
    size_bytes: Option<u64>,
}

fn list(config: &Config, json: bool) -> anyhow::Result<bool> {
    let store = backup_store(config);
    let entries: Vec<ListEntry> = store
        .list()
        .map_err(Error::from)?
        .into_iter()
        .map(|s| ListEntry {
            name: s.name(),
            created_at: s.id.created_at(),
            size_bytes: archive::disk_usage(&s.path).ok(),
            layout: s.layout,
            id: s.id,
        })
        .collect();

    emit(json, &entries, || {
        if entries.is_empty() {
            println!("No snapshots in {}", store.root().display());
        }
        for e in &entries {
            let size = e
                .size_bytes
                .map(|b| b.to_string())
                .unwrap_or_else(|| "?".to_string());
            println!(
                "{}  {}  {:>12}  {}",
                e.id,
                e.created_at.format("%Y-%m-%d %H:%M:%S"),
                size,
                e.name
            );
        }
    })?;
    Ok(true)
}

#[derive(Serialize)]
struct RestoreOutput {
    stop: ReconcileReport,
    restore: Option<RestoreReport>,
    start: Option<ReconcileReport>,
}

async fn restore(
    config: &Config,
    id: &str,
    services: &[String],
    cancel: CancelToken,
    json: bool,
) -> anyhow::Result<bool> {
    let wanted = if id == "latest" {
        None
    } else {
        let parsed = SnapshotId::parse(id)
            .ok_or_else(|| Error::Precondition(format!("invalid snapshot id {id:?}")))?;
        Some(parsed)
    };
    let table = load_table(config, services)?;
    let restorer = Restorer::new(backup_store(config));
    let snapshot = restorer.resolve(wanted.as_ref()).map_err(|e| match e {
        monstack::snapshot::SnapshotError::NotFound(what) => {
            Error::Precondition(format!("snapshot {what} not found"))
        }
        other => Error::from(other),
    })?;

    let reconciler = connect(config).await?;

    let stateful: Vec<_> = table
        .with_desired(DesiredState::Stopped)
        .services()
        .iter()
        .filter(|s| s.is_stateful())
        .cloned()
        .collect();
    let stop = reconciler.reconcile_all(&stateful, Some(&cancel)).await;
    if !stop.is_success() {
        error!("Could not stop every service, data left untouched");
        let output = RestoreOutput {
            stop,
            restore: None,
            start: None,
        };
        emit(json, &output, || print_reconcile(&output.stop))?;
        return Ok(false);
    }

    let selected = table.services().to_vec();
    let restored = tokio::task::spawn_blocking(move || restorer.restore(&snapshot, &selected))
        .await
        .context("restore task panicked")?
        .map_err(Error::from);

    // Bring services back even when the data could not be restored.
    let start = reconciler
        .reconcile_all(table.services(), Some(&cancel))
        .await;
    let restore = restored?;

    let ok = restore.is_success() && start.is_success();
    let output = RestoreOutput {
        stop,
        restore: Some(restore),
        start: Some(start),
    };
    emit(json, &output, || {
        if let Some(r) = &output.restore {
            print_restore(r);
        }
        if let Some(s) = &output.start {
            print_reconcile(s);
        }
    })?;
    Ok(ok)
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce()) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value).map_err(Error::from)?);
    } else {
        human();
    }
    Ok(())
}

fn print_prune(report: &PruneReport) {
    for id in &report.removed {
        println!("Removed {id}");
    }
    for (id, reason) in &report.failed {
        println!("Could not remove {id}: {reason}");
    }
    println!(
        "Kept {} snapshot(s), removed {}",
        report.kept.len(),
        report.removed.len()
    );
}

fn print_restore(report: &RestoreReport) {
    for service in &report.restored {
        println!("Restored {service}");
    }
    for service in &report.skipped {
        println!("Skipped {service} (no data)");
    }
    for (service, reason) in &report.failed {
        println!("FAILED {service}: {reason}");
    }
}

fn print_reconcile(report: &ReconcileReport) {
    for r in &report.services {
        let actions: Vec<String> = r.actions.iter().map(|a| a.verb.to_string()).collect();
        let actions = if actions.is_empty() {
            "-".to_string()
        } else {
            actions.join(",")
        };
        let outcome = match &r.outcome {
            Outcome::Converged => "converged".to_string(),
            Outcome::Retried => "converged after retry".to_string(),
            Outcome::Failed { reason } => format!("FAILED: {reason}"),
        };
        println!(
            "{:<20} {:>8} -> {:<8} [{}] {}",
            r.service, r.initial, r.last.status, actions, outcome
        );
    }
    for name in &report.skipped {
        println!("{name:<20} skipped (cancelled)");
    }
}
