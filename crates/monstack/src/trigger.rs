// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduled snapshot trigger.
//!
//! Renders a single `/etc/cron.d` line that runs `monstack snapshot` as root
//! under `flock -n`, so two runs never overlap on one store. The schedule
//! expression is passed through untouched.
//!
//! cron starts jobs with an almost empty environment, so the settings that
//! decide what a snapshot captures and how it is named are pinned into the
//! file as `NAME=value` lines ahead of the job.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::config::Config;

/// Errors from rendering or installing a trigger.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The schedule is empty or spans several lines.
    #[error("Invalid schedule: {0:?}")]
    InvalidSchedule(String),

    /// A path or argument cannot be placed on a cron line.
    #[error("Invalid trigger argument: {0}")]
    InvalidArgument(String),

    /// Writing the trigger file failed.
    #[error("Failed to write trigger {path}: {source}")]
    Write {
        /// Destination file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl TriggerError {
    /// Whether the error comes from bad input rather than the filesystem.
    pub fn is_invalid_input(&self) -> bool {
        !matches!(self, Self::Write { .. })
    }
}

/// Everything needed to render the trigger line.
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    /// Cron schedule expression, e.g. `0 3 * * *`.
    pub schedule: String,
    /// Absolute path of the monstack binary.
    pub entry_point: PathBuf,
    /// Backup store root.
    pub backup_dir: PathBuf,
    /// Retention count (0 keeps everything).
    pub keep: u32,
    /// Write compressed snapshots.
    pub compress: bool,
    /// Lock file for `flock -n`.
    pub lock_file: PathBuf,
    /// Variables set for the job, in order.
    pub environment: Vec<(String, String)>,
}

/// The settings a scheduled snapshot needs from `config`.
///
/// The store directory, retention and compression travel as flags; this
/// covers the rest of what `monstack snapshot` reads from the environment.
pub fn snapshot_environment(config: &Config) -> Result<Vec<(String, String)>, TriggerError> {
    let mut env = vec![
        ("MONSTACK_BACKUP_PREFIX".to_string(), config.backup_prefix.clone()),
        ("MONSTACK_STATE_DIR".to_string(), utf8(&config.state_dir)?),
        ("MONSTACK_CONFIG_DIR".to_string(), utf8(&config.config_dir)?),
    ];
    if let Some(file) = &config.services_file {
        env.push(("MONSTACK_SERVICES_FILE".to_string(), utf8(file)?));
    }
    Ok(env)
}

impl TriggerSpec {
    /// Render the cron.d content, including the trailing newline cron needs.
    pub fn render(&self) -> Result<String, TriggerError> {
        let schedule = self.schedule.trim();
        if schedule.is_empty() || schedule.contains(['\n', '\r']) {
            return Err(TriggerError::InvalidSchedule(self.schedule.clone()));
        }

        let compress = if self.compress {
            "--compress"
        } else {
            "--no-compress"
        };
        let command = [
            "flock".to_string(),
            "-n".to_string(),
            quote(&self.lock_file)?,
            quote(&self.entry_point)?,
            "snapshot".to_string(),
            "--dir".to_string(),
            quote(&self.backup_dir)?,
            "--keep".to_string(),
            self.keep.to_string(),
            compress.to_string(),
        ]
        .join(" ");

        let mut out = String::from("# Managed by monstack. Changes will be overwritten.\n");
        for (name, value) in &self.environment {
            out.push_str(&env_line(name, value)?);
            out.push('\n');
        }
        out.push_str(&format!("{schedule} root {command}\n"));
        Ok(out)
    }

    /// Render and write the trigger to `path` atomically with mode 0644.
    pub fn install(&self, path: &Path) -> Result<(), TriggerError> {
        let content = self.render()?;
        let write_err = |source| TriggerError::Write {
            path: path.to_path_buf(),
            source,
        };

        let file_name = path
            .file_name()
            .ok_or_else(|| TriggerError::InvalidArgument(format!("{} has no file name", path.display())))?;
        // cron ignores files with dots in their name, so the temporary is safe
        // to leave in cron.d if we crash.
        let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.set_permissions(fs::Permissions::from_mode(0o644))?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(write_err(e));
        }

        info!(path = %path.display(), schedule = %self.schedule.trim(), "Installed snapshot trigger");
        Ok(())
    }
}

fn utf8(path: &Path) -> Result<String, TriggerError> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| TriggerError::InvalidArgument(format!("{} is not UTF-8", path.display())))
}

/// cron takes the value verbatim up to the end of the line, trimming blanks
/// unless the value is wrapped in matching quotes.
fn env_line(name: &str, value: &str) -> Result<String, TriggerError> {
    let valid_name = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_name {
        return Err(TriggerError::InvalidArgument(format!("variable name {name:?}")));
    }
    if value.contains(['\n', '\r']) {
        return Err(TriggerError::InvalidArgument(format!("{name}={value:?}")));
    }

    let needs_quotes = value.is_empty()
        || value.trim() != value
        || value.starts_with(['"', '\''])
        || value.ends_with(['"', '\'']);
    if !needs_quotes {
        return Ok(format!("{name}={value}"));
    }
    if value.contains('"') {
        return Err(TriggerError::InvalidArgument(format!("{name}={value:?}")));
    }
    Ok(format!("{name}=\"{value}\""))
}

/// Quote a path for `/bin/sh`. `%` is escaped because cron turns it into a
/// newline.
fn quote(path: &Path) -> Result<String, TriggerError> {
    let s = path
        .to_str()
        .ok_or_else(|| TriggerError::InvalidArgument(format!("{} is not UTF-8", path.display())))?;
    if s.is_empty() || s.contains(['\n', '\r']) {
        return Err(TriggerError::InvalidArgument(format!("{s:?}")));
    }

    let plain = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | '+' | ':' | ','));
    let quoted = if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    };
    Ok(quoted.replace('%', r"\%"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec() -> TriggerSpec {
        TriggerSpec {
            schedule: "0 3 * * *".to_string(),
            entry_point: PathBuf::from("/usr/local/bin/monstack"),
            backup_dir: PathBuf::from("/var/backups/monstack"),
            keep: 7,
            compress: true,
            lock_file: PathBuf::from("/run/monstack-backup.lock"),
            environment: Vec::new(),
        }
    }

    #[test]
    fn test_render() {
        let rendered = spec().render().unwrap();
        let line = rendered.lines().last().unwrap();
        assert_eq!(
            line,
            "0 3 * * * root flock -n /run/monstack-backup.lock /usr/local/bin/monstack \
             snapshot --dir /var/backups/monstack --keep 7 --compress"
        );
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn test_render_no_compress_and_quoting() {
        let mut s = spec();
        s.compress = false;
        s.keep = 0;
        s.backup_dir = PathBuf::from("/srv/my backups/100%");
        let rendered = s.render().unwrap();
        assert!(rendered.contains(r"--dir '/srv/my backups/100\%' --keep 0 --no-compress"));
    }

    #[test]
    fn test_schedule_is_opaque() {
        let mut s = spec();
        s.schedule = "@daily".to_string();
        assert!(s.render().unwrap().contains("@daily root flock"));
    }

    #[test]
    fn test_rejects_bad_schedule() {
        for bad in ["", "   ", "0 3 * * *\n* * * * * root rm -rf /"] {
            let mut s = spec();
            s.schedule = bad.to_string();
            let err = s.render().unwrap_err();
            assert!(matches!(err, TriggerError::InvalidSchedule(_)), "{bad:?}");
            assert!(err.is_invalid_input());
        }
    }

    #[test]
    fn test_render_pins_environment() {
        let config = Config {
            backup_prefix: "nightly".to_string(),
            state_dir: PathBuf::from("/srv/state"),
            services_file: Some(PathBuf::from("/etc/monstack/services.json")),
            ..Config::default()
        };
        let mut s = spec();
        s.environment = snapshot_environment(&config).unwrap();

        let rendered = s.render().unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(
            lines[1..5],
            [
                "MONSTACK_BACKUP_PREFIX=nightly",
                "MONSTACK_STATE_DIR=/srv/state",
                "MONSTACK_CONFIG_DIR=/etc/monstack",
                "MONSTACK_SERVICES_FILE=/etc/monstack/services.json",
            ]
        );
        assert!(lines[5].starts_with("0 3 * * * root flock"));
    }

    #[test]
    fn test_environment_without_services_file() {
        let env = snapshot_environment(&Config::default()).unwrap();
        assert!(env.iter().all(|(name, _)| name != "MONSTACK_SERVICES_FILE"));
        assert_eq!(env[0], ("MONSTACK_BACKUP_PREFIX".to_string(), "monstack".to_string()));
    }

    #[test]
    fn test_environment_values_quoted_or_rejected() {
        let mut s = spec();
        s.environment = vec![("MONSTACK_STATE_DIR".to_string(), " /srv/state".to_string())];
        assert!(s.render().unwrap().contains("MONSTACK_STATE_DIR=\" /srv/state\"\n"));

        for (name, value) in [
            ("MONSTACK_STATE_DIR", "/srv\n* * * * * root id"),
            ("MONSTACK STATE", "/srv"),
            ("MONSTACK_STATE_DIR", "\"/srv\""),
        ] {
            s.environment = vec![(name.to_string(), value.to_string())];
            let err = s.render().unwrap_err();
            assert!(matches!(err, TriggerError::InvalidArgument(_)), "{name}={value:?}");
        }
    }

    #[test]
    fn test_install_writes_atomically_with_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("monstack-backup");
        fs::write(&path, "stale").unwrap();

        spec().install(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, spec().render().unwrap());
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_install_into_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let err = spec()
            .install(&dir.path().join("missing/monstack-backup"))
            .unwrap_err();
        assert!(matches!(err, TriggerError::Write { .. }));
        assert!(!err.is_invalid_input());
    }
}
