//! # Backup Pipeline (C6)
//!
//! Single-host serial pipeline: collect → prefilter → archive → compress →
//! checksum → manifest → (encrypt) → bundle finalize → atomic publish.
//! Stages observe strict happens-before: a later stage always sees the full
//! effects of earlier ones (§5).

mod archive;
mod bundle;
mod collect;
mod compress;
mod manifest;

pub use collect::{default_sources, CollectOutcome};
pub use manifest::ManifestEntry;

use crate::checker::DisabledFeatures;
use crate::config::{Config, CompressionType};
use crate::crypto;
use crate::error::{Phase, ProxSaveError, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

/// The pipeline's output record (§3 `BackupStats`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStats {
    pub host: String,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub files_collected: u64,
    pub files_failed: u64,
    pub dirs_created: u64,
    pub bytes_collected: u64,
    pub archive_size: u64,
    pub compression_requested: String,
    pub compression_effective: String,
    pub compression_ratio: f64,
    pub duration_ms: u64,
    pub archive_path: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub checksum: Option<String>,
    pub encrypted: bool,
    pub exit_code: i32,
    pub phase: Option<Phase>,
    pub targets: Vec<crate::orchestrator::TargetStats>,
    pub disabled_features: DisabledFeatures,
}

impl BackupStats {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            started_at: Local::now(),
            finished_at: None,
            files_collected: 0,
            files_failed: 0,
            dirs_created: 0,
            bytes_collected: 0,
            archive_size: 0,
            compression_requested: String::new(),
            compression_effective: String::new(),
            compression_ratio: 0.0,
            duration_ms: 0,
            archive_path: None,
            manifest_path: None,
            report_path: None,
            checksum: None,
            encrypted: false,
            exit_code: 0,
            phase: None,
            targets: Vec::new(),
            disabled_features: DisabledFeatures::default(),
        }
    }

    /// Builds a synthetic stats record for an `EARLY_ERROR` transition (§4.7,
    /// §3 `EarlyErrorState`): zeroed counters, the failing phase, and the
    /// mapped exit code, so notification channels still receive a uniform
    /// `BackupStats` shape.
    pub fn early_error(host: impl Into<String>, phase: Phase, err: &ProxSaveError) -> Self {
        let mut stats = Self::new(host);
        stats.phase = Some(phase);
        stats.exit_code = err.exit_code();
        stats.finished_at = Some(Local::now());
        stats
    }
}

/// Result of running the full pipeline for one bundle.
pub struct PipelineOutput {
    pub stats: BackupStats,
    pub bundle_dir: PathBuf,
}

/// Runs the complete pipeline and returns the finalized bundle location plus
/// statistics. `cancelled` is polled between stages (§5).
pub fn run(
    config: &Config,
    host: &str,
    cancelled: &dyn Fn() -> bool,
) -> Result<PipelineOutput> {
    let overall_start = Instant::now();
    let mut stats = BackupStats::new(host);

    let staging_root = config
        .get_path("BACKUP_PATH")
        .ok_or_else(|| ProxSaveError::backup(Phase::Init, "BACKUP_PATH not set"))?
        .join(".staging");
    std::fs::create_dir_all(&staging_root)
        .map_err(|e| ProxSaveError::backup(Phase::Init, format!("cannot create staging dir: {e}")))?;

    // 1. Collect
    if cancelled() {
        return Err(ProxSaveError::Cancelled);
    }
    let sources = collect::resolve_sources(config);
    let outcome = collect::collect(&sources, config)?;
    stats.files_collected = outcome.files.len() as u64;
    stats.files_failed = outcome.failed.len() as u64;
    stats.dirs_created = outcome.dirs_created;
    stats.bytes_collected = outcome.files.iter().map(|f| f.size).sum();

    for (path, err) in &outcome.failed {
        tracing::warn!(path = %path.display(), error = %err, "collect: file failed");
    }

    // 3. Archive
    if cancelled() {
        return Err(ProxSaveError::Cancelled);
    }
    let tar_path = staging_root.join("archive.tar");
    archive::build_archive(&tar_path, &outcome.files)
        .map_err(|e| ProxSaveError::backup(Phase::Archive, e.to_string()))?;

    // 4. Compress
    if cancelled() {
        return Err(ProxSaveError::Cancelled);
    }
    let requested = config.compression_type().unwrap_or(CompressionType::Zstd);
    let level = config.compression_level() as i32;
    let threads = config.compression_threads() as u32;
    let (compressed_path, effective) =
        compress::compress_archive(&tar_path, &staging_root, requested, level, threads)?;
    stats.compression_requested = requested.as_str().to_string();
    stats.compression_effective = effective.as_str().to_string();
    let archive_size = std::fs::metadata(&compressed_path)
        .map(|m| m.len())
        .unwrap_or(0);
    stats.archive_size = archive_size;
    stats.compression_ratio = if stats.bytes_collected > 0 {
        archive_size as f64 / stats.bytes_collected as f64
    } else {
        0.0
    };

    // 5. Checksum
    if cancelled() {
        return Err(ProxSaveError::Cancelled);
    }
    let checksum = manifest::sha256_sidecar(&compressed_path)
        .map_err(|e| ProxSaveError::backup(Phase::Checksum, e.to_string()))?;
    stats.checksum = Some(checksum.clone());

    // 6. Manifest
    if cancelled() {
        return Err(ProxSaveError::Cancelled);
    }
    let manifest_path = staging_root.join("manifest.json");
    manifest::write_manifest(&manifest_path, &outcome)
        .map_err(|e| ProxSaveError::backup(Phase::Manifest, e.to_string()))?;

    let mut artifacts = vec![compressed_path.clone(), format!("{}.sha256", compressed_path.display()).into(), manifest_path.clone()];
    std::fs::write(format!("{}.sha256", compressed_path.display()), &checksum)
        .map_err(|e| ProxSaveError::backup(Phase::Checksum, e.to_string()))?;

    // 7. Optional encryption
    if config.encrypt_archive() {
        if cancelled() {
            return Err(ProxSaveError::Cancelled);
        }
        let base_dir = config.base_dir().unwrap_or_else(|| PathBuf::from("/var/lib/proxsave"));
        let recipient_file = crypto::recipients::default_recipient_file(&base_dir);
        let recipients = crypto::recipients::read_recipients(&recipient_file)
            .map_err(|e| ProxSaveError::backup(Phase::Encrypt, e.to_string()))?;
        if recipients.is_empty() {
            return Err(ProxSaveError::Crypto(crate::error::CryptoError::NoRecipients));
        }

        let encrypted_archive = PathBuf::from(format!("{}.age", compressed_path.display()));
        crypto::encrypt_file(&compressed_path, &encrypted_archive, &recipients)
            .map_err(|_| ProxSaveError::backup(Phase::Encrypt, "encryption failed"))?;
        let encrypted_checksum = manifest::sha256_sidecar(&encrypted_archive)
            .map_err(|e| ProxSaveError::backup(Phase::Encrypt, e.to_string()))?;
        std::fs::write(format!("{}.sha256", encrypted_archive.display()), &encrypted_checksum)
            .map_err(|e| ProxSaveError::backup(Phase::Encrypt, e.to_string()))?;

        let encrypted_manifest = PathBuf::from(format!("{}.age", manifest_path.display()));
        crypto::encrypt_file(&manifest_path, &encrypted_manifest, &recipients)
            .map_err(|_| ProxSaveError::backup(Phase::Encrypt, "manifest encryption failed"))?;

        artifacts.push(encrypted_archive.clone());
        artifacts.push(format!("{}.sha256", encrypted_archive.display()).into());
        artifacts.push(encrypted_manifest);

        if !config.keep_plaintext_archive() {
            let fs_info = crate::storage::detect_filesystem(&staging_root);
            let supports_shred = !fs_info.is_network_fs && fs_info.kind != crate::storage::FilesystemKind::Btrfs && fs_info.kind != crate::storage::FilesystemKind::Zfs;
            let _ = crypto::remove_plaintext(&compressed_path, supports_shred);
            let _ = std::fs::remove_file(format!("{}.sha256", compressed_path.display()));
        }
        stats.encrypted = true;
    }

    // 8. Bundle finalize + 9. atomic publish
    if cancelled() {
        return Err(ProxSaveError::Cancelled);
    }
    let primary_root = config
        .get_path("BACKUP_PATH")
        .ok_or_else(|| ProxSaveError::backup(Phase::Bundle, "BACKUP_PATH not set"))?;
    let bundle_dir = bundle::finalize(&staging_root, &primary_root, host, &artifacts)
        .map_err(|e| ProxSaveError::backup(Phase::Bundle, e.to_string()))?;

    stats.archive_path = Some(bundle_dir.join(compressed_path.file_name().unwrap()));
    stats.manifest_path = Some(bundle_dir.join("manifest.json"));
    stats.duration_ms = overall_start.elapsed().as_millis() as u64;
    stats.finished_at = Some(Local::now());

    Ok(PipelineOutput { stats, bundle_dir })
}
