//! # Backup Orchestrator (C7)
//!
//! Drives one run end to end: lock acquisition, pre-checks, key priming,
//! the pipeline, replication fan-out, retention, and notification dispatch.
//! Owns the lock, the pipeline, and the target list exclusively for the
//! duration of a single run (§3 Ownership, §4.7).

use crate::checker;
use crate::config::Config;
use crate::crypto;
use crate::error::{Phase, ProxSaveError, Result};
use crate::identity;
use crate::notify::Notifier;
use crate::pipeline::{self, BackupStats};
use crate::storage::{self, BundleMetadata, Location, RetentionResult, StorageTarget, StoreResult, VerifyResult};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// States per §4.7. `EarlyError` is reachable from `Init`, `Locked`,
/// `ChecksOk`, or `KeysReady`, and always still transitions to `Notifying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Locked,
    ChecksOk,
    KeysReady,
    Running,
    Replicating,
    Retaining,
    Notifying,
    Done,
    EarlyError,
}

fn transition(state: &mut RunState, to: RunState) {
    tracing::debug!(from = ?*state, to = ?to, "orchestrator state transition");
    *state = to;
}

/// Per-target replication/retention outcome folded into `BackupStats.targets`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TargetStats {
    pub name: String,
    pub location: Location,
    pub store: Option<StoreResult>,
    pub verify: Option<VerifyResult>,
    pub retention: Option<RetentionResult>,
    pub error: Option<String>,
}

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(15);

/// Holds the non-blocking advisory lock at `<LockPath>/proxsave.lock` for
/// the run's duration. The file is truncated, not removed, on release so a
/// later run reuses the same inode (§3 Lifecycles, §4.7).
pub struct LockGuard {
    #[cfg(unix)]
    file: std::fs::File,
    #[allow(dead_code)]
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use nix::fcntl::{flock, FlockArg};
            use std::os::unix::io::AsRawFd;
            let _ = self.file.set_len(0);
            let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        }
    }
}

#[cfg(unix)]
fn acquire_lock(lock_dir: &Path) -> Result<LockGuard> {
    use nix::fcntl::{flock, FlockArg};
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    std::fs::create_dir_all(lock_dir)
        .map_err(|e| ProxSaveError::backup(Phase::Lock, format!("cannot create lock dir: {e}")))?;
    let path = lock_dir.join("proxsave.lock");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| ProxSaveError::backup(Phase::Lock, format!("cannot open lock file: {e}")))?;

    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
        .map_err(|_| ProxSaveError::LockBusy(path.clone()))?;

    let _ = file.set_len(0);
    let _ = writeln!(file, "{}\n{}", std::process::id(), Local::now().to_rfc3339());

    Ok(LockGuard { file, path })
}

#[cfg(not(unix))]
fn acquire_lock(lock_dir: &Path) -> Result<LockGuard> {
    std::fs::create_dir_all(lock_dir).ok();
    Ok(LockGuard {
        path: lock_dir.join("proxsave.lock"),
    })
}

/// Installs SIGINT/SIGTERM handling once per process and returns the shared
/// cancellation flag the pipeline and replication fan-out poll (§5).
fn install_signal_handler() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    // ctrlc::set_handler can only succeed once per process; a second call in
    // the same run (e.g. repeated orchestrator::run in tests) is harmless.
    let _ = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    });
    flag
}

/// Drives one full backup run for `host`, returning the final statistics on
/// success and the triggering error (after notifications/report have still
/// been attempted) on any early termination.
pub fn run(config: &Config, host: &str, notifiers: &[Arc<dyn Notifier>]) -> Result<BackupStats> {
    let cancelled = install_signal_handler();
    let mut state = RunState::Init;

    let lock_path = config
        .get_path("LOCK_PATH")
        .unwrap_or_else(|| PathBuf::from("/var/run/proxsave"));
    let lock = match acquire_lock(&lock_path) {
        Ok(guard) => guard,
        Err(e) => return early_error(config, host, notifiers, Phase::Lock, e),
    };
    transition(&mut state, RunState::Locked);

    let report = checker::run_checks(config);
    for item in &report.items {
        match item.severity {
            checker::Severity::Fatal => tracing::error!(message = %item.message, "pre-backup check failed"),
            checker::Severity::Warning => tracing::warn!(message = %item.message, "pre-backup check warning"),
        }
    }
    if report.is_fatal() {
        drop(lock);
        let e = ProxSaveError::backup(Phase::Checks, "pre-backup checks reported a fatal condition");
        return early_error(config, host, notifiers, Phase::Checks, e);
    }
    transition(&mut state, RunState::ChecksOk);

    if let Err(e) = prime_keys(config) {
        drop(lock);
        return early_error(config, host, notifiers, Phase::Keys, e);
    }
    transition(&mut state, RunState::KeysReady);

    let base_dir = config.base_dir().unwrap_or_else(|| PathBuf::from("/var/lib/proxsave"));
    if let Err(e) = identity::load_or_generate(&base_dir) {
        drop(lock);
        return early_error(config, host, notifiers, Phase::Keys, e);
    }

    transition(&mut state, RunState::Running);
    let is_cancelled = || cancelled.load(Ordering::SeqCst);
    let pipeline_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pipeline::run(config, host, &is_cancelled)
    }));

    let output = match pipeline_result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            drop(lock);
            let phase = match &e {
                ProxSaveError::Backup { phase, .. } => *phase,
                _ => Phase::Collect,
            };
            return early_error(config, host, notifiers, phase, e);
        }
        Err(_) => {
            drop(lock);
            let e = ProxSaveError::InternalPanic("the pipeline panicked".into());
            return early_error(config, host, notifiers, Phase::Collect, e);
        }
    };

    let mut stats = output.stats;
    let archive_present = stats.archive_path.as_ref().is_some_and(|p| p.exists());
    if !archive_present {
        drop(lock);
        let e = ProxSaveError::storage("primary", "verify", "archive missing from the published bundle");
        return early_error(config, host, notifiers, Phase::Replicate, e);
    }

    let targets = match storage::build_targets(config) {
        Ok(targets) => targets,
        Err(e) => {
            drop(lock);
            return early_error(config, host, notifiers, Phase::Replicate, e);
        }
    };

    transition(&mut state, RunState::Replicating);
    let metadata = bundle_metadata(&output.bundle_dir, &stats);
    let mut target_stats = if config.dry_run() {
        tracing::info!("dry run: pipeline output published, skipping replication and retention");
        targets
            .iter()
            .map(|t| TargetStats {
                name: t.name().to_string(),
                location: t.location(),
                store: None,
                verify: None,
                retention: None,
                error: Some("skipped: dry run".into()),
            })
            .collect()
    } else {
        replicate(&targets, &output.bundle_dir, &metadata, &cancelled)
    };

    transition(&mut state, RunState::Retaining);
    if !config.dry_run() {
        apply_retention(&targets, config, &mut target_stats);
    }

    stats.targets = target_stats;

    transition(&mut state, RunState::Notifying);
    notify_all(notifiers, &stats);
    persist_report(config, host, &mut stats);

    transition(&mut state, RunState::Done);
    drop(lock);
    Ok(stats)
}

fn prime_keys(config: &Config) -> Result<()> {
    if !config.encrypt_archive() {
        return Ok(());
    }
    let base_dir = config.base_dir().unwrap_or_else(|| PathBuf::from("/var/lib/proxsave"));
    let recipient_file = crypto::recipients::default_recipient_file(&base_dir);
    let recipients = crypto::recipients::read_recipients(&recipient_file)?;
    if recipients.is_empty() {
        return Err(ProxSaveError::Crypto(crate::error::CryptoError::NoRecipients));
    }
    Ok(())
}

fn bundle_metadata(bundle_dir: &Path, stats: &BackupStats) -> BundleMetadata {
    BundleMetadata {
        bundle_name: bundle_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        archive_file: stats
            .archive_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        sha256: stats.checksum.clone().unwrap_or_default(),
        created_at: Local::now(),
        compression: stats.compression_effective.clone(),
        encrypted: stats.encrypted,
        recipient_fingerprints: Vec::new(),
        source_location: Location::Primary,
    }
}

fn store_and_verify(
    target: &dyn StorageTarget,
    bundle_dir: &Path,
    metadata: &BundleMetadata,
) -> Result<(StoreResult, VerifyResult)> {
    let store = target.store(bundle_dir, metadata)?;
    let verify = target.verify(&metadata.bundle_name, &metadata.sha256, &metadata.archive_file)?;
    Ok((store, verify))
}

fn cancelled_stats(target: &dyn StorageTarget) -> TargetStats {
    TargetStats {
        name: target.name().to_string(),
        location: target.location(),
        store: None,
        verify: None,
        retention: None,
        error: Some("cancelled before replication".into()),
    }
}

/// Primary replication is the archive already being in its bundle directory
/// (no copy occurs, per §4.7); every other target is fanned out onto its own
/// detached thread with its own upload timeout. Threads are spawned via
/// `std::thread::spawn`, not `std::thread::scope`: a scope's implicit join
/// would still block on a hung worker even after its `recv_timeout` above
/// expired, so the `JoinHandle` here is intentionally dropped rather than
/// joined — a stuck target can outlive this call without stalling it.
fn replicate(
    targets: &[Arc<dyn StorageTarget>],
    bundle_dir: &Path,
    metadata: &BundleMetadata,
    cancelled: &Arc<AtomicBool>,
) -> Vec<TargetStats> {
    let mut results = Vec::with_capacity(targets.len());

    for target in targets.iter().filter(|t| t.location() == Location::Primary) {
        results.push(TargetStats {
            name: target.name().to_string(),
            location: Location::Primary,
            store: Some(StoreResult {
                bytes_uploaded: 0,
                duration_ms: 0,
            }),
            verify: None,
            retention: None,
            error: None,
        });
    }

    let secondary: Vec<Arc<dyn StorageTarget>> = targets
        .iter()
        .filter(|t| t.location() != Location::Primary)
        .cloned()
        .collect();

    if secondary.is_empty() {
        return results;
    }

    if cancelled.load(Ordering::SeqCst) {
        results.extend(secondary.iter().map(|t| cancelled_stats(t.as_ref())));
        return results;
    }

    let receivers: Vec<_> = secondary
        .into_iter()
        .map(|target| {
            let (tx, rx) = std::sync::mpsc::channel();
            let name = target.name().to_string();
            let location = target.location();
            let bundle_dir = bundle_dir.to_path_buf();
            let metadata = metadata.clone();
            let _ = std::thread::spawn(move || {
                let _ = tx.send(store_and_verify(target.as_ref(), &bundle_dir, &metadata));
            });
            (name, location, rx)
        })
        .collect();

    let fanned = receivers
        .into_iter()
        .map(|(name, location, rx)| match rx.recv_timeout(UPLOAD_TIMEOUT) {
            Ok(Ok((store, verify))) => TargetStats {
                name,
                location,
                store: Some(store),
                verify: Some(verify),
                retention: None,
                error: None,
            },
            Ok(Err(e)) => {
                tracing::warn!(target = %name, error = %e, "replication failed");
                TargetStats {
                    name,
                    location,
                    store: None,
                    verify: None,
                    retention: None,
                    error: Some(e.to_string()),
                }
            }
            Err(_) => {
                tracing::warn!(target = %name, "replication timed out");
                TargetStats {
                    name,
                    location,
                    store: None,
                    verify: None,
                    retention: None,
                    error: Some("upload timed out".into()),
                }
            }
        })
        .collect::<Vec<_>>();

    results.extend(fanned);
    results
}

/// Runs `ApplyRetention` per target independently; failures are warnings
/// (§4.7) and never touch targets that already failed replication.
fn apply_retention(targets: &[Arc<dyn StorageTarget>], config: &Config, target_stats: &mut [TargetStats]) {
    let policy = config.retention_policy();
    let simple_keep = config.retention_simple_keep();
    let gfs = config.retention_gfs();

    for target in targets {
        let Some(stats) = target_stats.iter_mut().find(|s| s.name == target.name()) else {
            continue;
        };
        if stats.error.is_some() {
            continue;
        }
        match target.apply_retention(policy, simple_keep, gfs) {
            Ok(result) => stats.retention = Some(result),
            Err(e) => tracing::warn!(target = target.name(), error = %e, "retention failed"),
        }
    }
}

/// Dispatches to every channel concurrently, each with its own timeout, so a
/// stuck channel never delays the others (§5). Each per-notifier thread is
/// itself bounded by `dispatch_with_timeout`'s internal detached call, so
/// joining these outer handles never waits longer than `NOTIFY_TIMEOUT`.
fn notify_all(notifiers: &[Arc<dyn Notifier>], stats: &BackupStats) {
    if notifiers.is_empty() {
        return;
    }
    let handles: Vec<_> = notifiers
        .iter()
        .map(|notifier| {
            let notifier = Arc::clone(notifier);
            let stats = stats.clone();
            std::thread::spawn(move || dispatch_with_timeout(notifier, stats))
        })
        .collect();
    for handle in handles {
        let _ = handle.join();
    }
}

/// Calls `notifier.notify` on its own detached thread so a channel that never
/// returns cannot stall this function past `NOTIFY_TIMEOUT` — the
/// `JoinHandle` is dropped rather than joined, matching `replicate`'s
/// detached-worker pattern.
fn dispatch_with_timeout(notifier: Arc<dyn Notifier>, stats: BackupStats) {
    let (tx, rx) = std::sync::mpsc::channel();
    let worker = Arc::clone(&notifier);
    let _ = std::thread::spawn(move || {
        let _ = tx.send(worker.notify(&stats));
    });
    match rx.recv_timeout(NOTIFY_TIMEOUT) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(channel = notifier.name(), error = %e, "notification failed"),
        Err(_) => tracing::warn!(channel = notifier.name(), "notification timed out"),
    }
}

fn persist_report(config: &Config, host: &str, stats: &mut BackupStats) {
    let Some(log_path) = config.get_path("LOG_PATH") else {
        return;
    };
    if let Err(e) = std::fs::create_dir_all(&log_path) {
        tracing::warn!(error = %e, "could not create LOG_PATH for the stats report");
        return;
    }

    let ts = Local::now().format("%Y%m%d-%H%M%S");
    let report_path = log_path.join(format!("backup-{host}-{ts}.stats.json"));
    stats.report_path = Some(report_path.clone());

    match serde_json::to_string_pretty(stats) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&report_path, json) {
                tracing::warn!(error = %e, "could not write the stats report");
            }
        }
        Err(e) => tracing::warn!(error = %e, "could not serialize the stats report"),
    }
}

/// Builds a synthetic `BackupStats` for the failing phase, dispatches
/// notifications, persists a (zeroed) stats report, and returns the
/// triggering error — except for user-abort sentinels, which fire neither
/// (§4.7: "graceful exit, no backup, no error notification").
fn early_error(
    config: &Config,
    host: &str,
    notifiers: &[Arc<dyn Notifier>],
    phase: Phase,
    err: ProxSaveError,
) -> Result<BackupStats> {
    if !err.is_user_abort() {
        let mut stats = BackupStats::early_error(host, phase, &err);
        notify_all(notifiers, &stats);
        persist_report(config, host, &mut stats);
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;
    use tempfile::tempdir;

    fn base_config(dir: &Path) -> Config {
        let path = dir.join("backup.env");
        std::fs::write(
            &path,
            format!(
                "BACKUP_PATH={}\nLOG_PATH={}\nLOCK_PATH={}\nBASE_DIR={}\nDISABLE_NETWORK_PREFLIGHT=true\n",
                dir.join("primary").display(),
                dir.join("log").display(),
                dir.join("lock").display(),
                dir.join("base").display(),
            ),
        )
        .unwrap();
        Config::load(&path).unwrap()
    }

    #[test]
    fn lock_busy_on_second_acquire() {
        let dir = tempdir().unwrap();
        let lock_dir = dir.path().join("lock");
        let first = acquire_lock(&lock_dir).unwrap();
        let second = acquire_lock(&lock_dir);
        assert!(second.is_err());
        drop(first);
        assert!(acquire_lock(&lock_dir).is_ok());
    }

    #[test]
    fn full_run_produces_stats_and_report() {
        let dir = tempdir().unwrap();
        let config = base_config(dir.path());
        let notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(NullNotifier)];

        let stats = run(&config, "test-host", &notifiers).unwrap();
        assert_eq!(stats.exit_code, 0);
        assert!(stats.report_path.as_ref().unwrap().exists());
        assert_eq!(stats.targets.len(), 1);
        assert_eq!(stats.targets[0].location, Location::Primary);
    }
}
