//! # Pre-backup Checker (C4)
//!
//! Validates disk space, directory presence/writability, lock availability,
//! and required external binaries before the pipeline starts. Also runs the
//! network preflight that downgrades network-dependent features for the
//! duration of one run (§4.4).

use crate::config::Config;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Warning,
}

#[derive(Debug, Clone)]
pub struct CheckItem {
    pub severity: Severity,
    pub message: String,
}

/// Network-dependent features that can be individually downgraded when the
/// preflight probe fails (§4.4, `BackupStats.DisabledFeatures`).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DisabledFeatures {
    pub cloud: bool,
    pub telegram: bool,
    pub gotify: bool,
    pub webhook: bool,
    pub email_relay: bool,
    pub email_switched_to_sendmail: bool,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub items: Vec<CheckItem>,
    pub cloud_downgraded: bool,
    pub disabled_features: DisabledFeatures,
}

impl CheckReport {
    pub fn is_fatal(&self) -> bool {
        self.items.iter().any(|i| i.severity == Severity::Fatal)
    }

    fn push(&mut self, severity: Severity, message: impl Into<String>) {
        self.items.push(CheckItem {
            severity,
            message: message.into(),
        });
    }
}

/// A small fixed set of well-known public endpoints used only to establish
/// that outbound network connectivity exists at all, never to probe a
/// specific feature's actual endpoint.
const PREFLIGHT_TARGETS: &[(&str, u16)] = &[("1.1.1.1", 443), ("8.8.8.8", 443)];
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs the full pre-backup checklist described in §4.4, returning a
/// collated report. Callers should treat any `Severity::Fatal` item as an
/// abort; warnings continue.
pub fn run_checks(config: &Config) -> CheckReport {
    let mut report = CheckReport::default();

    check_directory(&mut report, config.get_path("BACKUP_PATH"), "BACKUP_PATH", true);
    check_directory(&mut report, config.get_path("LOG_PATH"), "LOG_PATH", true);

    if config.secondary_enabled() {
        check_directory(&mut report, config.get_path("SECONDARY_PATH"), "SECONDARY_PATH", false);
    }

    if let Some(lock_path) = config.get_path("LOCK_PATH") {
        check_lock_path(&mut report, &lock_path);
    }

    check_disk_space(&mut report, config.get_path("BACKUP_PATH"), config.get_u64("MIN_DISK_PRIMARY_GB", 5), "primary");
    if config.secondary_enabled() {
        check_disk_space(&mut report, config.get_path("SECONDARY_PATH"), config.get_u64("MIN_DISK_SECONDARY_GB", 5), "secondary");
    }

    check_required_binaries(&mut report, config);

    if config.cloud_enabled() && config.resolve_cloud_log_path().is_none() && config.get("CLOUD_REMOTE").unwrap_or_default().is_empty() {
        report.push(Severity::Warning, "cloud enabled but CLOUD_REMOTE cannot be resolved; downgrading cloud tier");
        report.cloud_downgraded = true;
    }

    run_network_preflight(&mut report, config);

    report
}

fn check_directory(report: &mut CheckReport, path: Option<PathBuf>, key: &str, fatal: bool) {
    let Some(path) = path else {
        if fatal {
            report.push(Severity::Fatal, format!("{key} is not set"));
        }
        return;
    };

    if !path.exists() {
        if let Err(e) = std::fs::create_dir_all(&path) {
            let severity = if fatal { Severity::Fatal } else { Severity::Warning };
            report.push(severity, format!("{key} at {} does not exist and could not be created: {e}", path.display()));
            return;
        }
    }

    if !is_writable(&path) {
        let severity = if fatal { Severity::Fatal } else { Severity::Warning };
        report.push(severity, format!("{key} at {} is not writable", path.display()));
    }
}

fn is_writable(path: &Path) -> bool {
    let probe = path.join(format!(".proxsave-writability-probe-{}", std::process::id()));
    match std::fs::File::create(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

fn check_lock_path(report: &mut CheckReport, lock_path: &Path) {
    if !lock_path.exists() {
        if let Err(e) = std::fs::create_dir_all(lock_path) {
            report.push(Severity::Fatal, format!("LOCK_PATH at {} does not exist and could not be created: {e}", lock_path.display()));
            return;
        }
    }
    if !is_writable(lock_path) {
        report.push(Severity::Fatal, format!("LOCK_PATH at {} is not writable", lock_path.display()));
    }
}

fn check_disk_space(report: &mut CheckReport, path: Option<PathBuf>, min_gb: u64, label: &str) {
    let Some(path) = path else { return };
    match available_space_gb(&path) {
        Ok(available) if available < min_gb => {
            report.push(
                Severity::Fatal,
                format!("insufficient disk space for {label} at {}: need {min_gb} GiB, have {available} GiB", path.display()),
            );
        }
        Ok(_) => {}
        Err(e) => {
            report.push(Severity::Warning, format!("could not determine free space for {label} at {}: {e}", path.display()));
        }
    }
}

#[cfg(unix)]
fn available_space_gb(path: &Path) -> std::io::Result<u64> {
    let probe = if path.exists() { path.to_path_buf() } else { PathBuf::from("/") };
    let stat = nix::sys::statvfs::statvfs(&probe)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let bytes = stat.blocks_available() * stat.fragment_size();
    Ok(bytes / (1024 * 1024 * 1024))
}

#[cfg(not(unix))]
fn available_space_gb(_path: &Path) -> std::io::Result<u64> {
    Ok(u64::MAX / (1024 * 1024 * 1024))
}

fn binary_on_path(name: &str) -> bool {
    let Ok(path_var) = std::env::var("PATH") else { return false };
    std::env::split_paths(&path_var).any(|dir| dir.join(name).is_file())
}

fn check_required_binaries(report: &mut CheckReport, config: &Config) {
    if config.cloud_enabled() && !binary_on_path("rclone") {
        report.push(Severity::Fatal, "CLOUD_ENABLED=true but 'rclone' is not on PATH");
    }
    if !binary_on_path("chattr") {
        report.push(Severity::Warning, "'chattr' not on PATH; identity file immutability will be skipped");
    }
    if config.get_bool("NOTIFY_EMAIL_ENABLED", false)
        && config.get_bool("EMAIL_FALLBACK_SENDMAIL", true)
        && !binary_on_path("sendmail")
    {
        report.push(Severity::Warning, "'sendmail' not on PATH; local email fallback will be unavailable");
    }
}

/// Attempts a 2-second TCP connect to a small set of public targets.
/// Failure disables the exact network-dependent features listed in §4.4 for
/// this run only, recording them in `report.disabled_features`.
fn run_network_preflight(report: &mut CheckReport, config: &Config) {
    if config.disable_network_preflight() {
        return;
    }

    let needs_network = config.cloud_enabled()
        || config.get_bool("NOTIFY_TELEGRAM_ENABLED", false)
        || config.get_bool("NOTIFY_GOTIFY_ENABLED", false)
        || config.get_bool("NOTIFY_WEBHOOK_ENABLED", false)
        || config.get_bool("NOTIFY_EMAIL_ENABLED", false);

    if !needs_network {
        return;
    }

    if network_reachable() {
        return;
    }

    report.push(Severity::Warning, "network preflight failed; network-dependent features downgraded for this run");

    if config.cloud_enabled() {
        report.disabled_features.cloud = true;
    }
    if config.get_bool("NOTIFY_TELEGRAM_ENABLED", false) {
        report.disabled_features.telegram = true;
    }
    if config.get_bool("NOTIFY_GOTIFY_ENABLED", false) {
        report.disabled_features.gotify = true;
    }
    if config.get_bool("NOTIFY_WEBHOOK_ENABLED", false) {
        report.disabled_features.webhook = true;
    }
    if config.get_bool("NOTIFY_EMAIL_ENABLED", false) {
        if config.get_bool("EMAIL_FALLBACK_SENDMAIL", true) {
            report.disabled_features.email_switched_to_sendmail = true;
        } else {
            report.disabled_features.email_relay = true;
        }
    }
}

fn network_reachable() -> bool {
    PREFLIGHT_TARGETS
        .iter()
        .any(|(host, port)| TcpStream::connect_timeout(&format!("{host}:{port}").parse().unwrap(), PREFLIGHT_TIMEOUT).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn base_config(dir: &Path) -> Config {
        let path = dir.join("backup.env");
        std::fs::write(
            &path,
            format!(
                "BACKUP_PATH={}\nLOG_PATH={}\nDISABLE_NETWORK_PREFLIGHT=true\n",
                dir.join("primary").display(),
                dir.join("log").display()
            ),
        )
        .unwrap();
        Config::load(&path).unwrap()
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempdir().unwrap();
        let config = base_config(dir.path());
        let report = run_checks(&config);
        assert!(!report.is_fatal());
        assert!(dir.path().join("primary").exists());
        assert!(dir.path().join("log").exists());
    }

    #[test]
    fn fatal_when_cloud_enabled_without_rclone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.env");
        std::fs::write(
            &path,
            format!(
                "BACKUP_PATH={}\nLOG_PATH={}\nCLOUD_ENABLED=true\nCLOUD_REMOTE=remote:bucket\nDISABLE_NETWORK_PREFLIGHT=true\n",
                dir.path().join("primary").display(),
                dir.path().join("log").display()
            ),
        )
        .unwrap();
        let config = Config::load(&path).unwrap();

        // Force a PATH with no rclone to make this deterministic regardless
        // of the host running the test suite.
        let original_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", "/nonexistent-bin-dir");
        let report = run_checks(&config);
        std::env::set_var("PATH", original_path);

        assert!(report.is_fatal());
    }

    #[test]
    fn network_preflight_skipped_when_disabled() {
        let dir = tempdir().unwrap();
        let config = base_config(dir.path());
        let report = run_checks(&config);
        assert!(!report.disabled_features.cloud);
    }
}
