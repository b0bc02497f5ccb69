//! # Storage Target (C3)
//!
//! A uniform contract over the three backends (`Local`, `Secondary`, `Cloud`)
//! for storing, listing, deleting, verifying, and retaining backup bundles.
//! Variants are a closed set known at compile time; a registry maps a config
//! string to a constructor (see design spec §9 on dynamic dispatch).

mod cloud;
mod local;
pub mod retention;

pub use cloud::CloudTarget;
pub use local::LocalTarget;
pub use retention::{apply_retention, RetainedBundle};

use crate::config::{Config, GfsCounts, RetentionPolicyKind};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a target sits in the replication order; only `Primary` aborts the
/// run on failure (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Primary,
    Secondary,
    Cloud,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Location::Primary => "primary",
            Location::Secondary => "secondary",
            Location::Cloud => "cloud",
        };
        write!(f, "{s}")
    }
}

/// Filesystem classification produced by `DetectFilesystem` (§4.3). Governs
/// whether ownership operations and plaintext shredding are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Ext4,
    Xfs,
    Btrfs,
    Zfs,
    Nfs,
    Cifs,
    Fuse,
    Tmpfs,
    Other,
}

#[derive(Debug, Clone)]
pub struct FilesystemInfo {
    pub kind: FilesystemKind,
    pub supports_ownership: bool,
    pub is_network_fs: bool,
    pub mount_point: PathBuf,
}

impl FilesystemKind {
    fn from_fstype(s: &str) -> Self {
        match s {
            "ext2" | "ext3" | "ext4" => Self::Ext4,
            "xfs" => Self::Xfs,
            "btrfs" => Self::Btrfs,
            "zfs" => Self::Zfs,
            "nfs" | "nfs4" => Self::Nfs,
            "cifs" | "smb3" => Self::Cifs,
            "fuseblk" | "fuse" | "fuse.rclone" => Self::Fuse,
            "tmpfs" => Self::Tmpfs,
            _ => Self::Other,
        }
    }
}

/// Detects the filesystem backing `path` by scanning `/proc/mounts` for the
/// longest matching mount-point prefix. Falls back to `Other`/no-network when
/// `/proc/mounts` is unreadable (e.g. non-Linux).
pub fn detect_filesystem(path: &Path) -> FilesystemInfo {
    let canon = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    let mounts = std::fs::read_to_string("/proc/mounts").unwrap_or_default();
    let mut best: Option<(PathBuf, &str)> = None;

    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let _device = parts.next();
        let Some(mount_point) = parts.next() else { continue };
        let Some(fstype) = parts.next() else { continue };

        let mount_path = PathBuf::from(mount_point);
        if canon.starts_with(&mount_path) {
            let better = match &best {
                Some((current, _)) => mount_path.as_os_str().len() > current.as_os_str().len(),
                None => true,
            };
            if better {
                best = Some((mount_path, fstype));
            }
        }
    }

    match best {
        Some((mount_point, fstype)) => {
            let kind = FilesystemKind::from_fstype(fstype);
            let is_network_fs = matches!(kind, FilesystemKind::Nfs | FilesystemKind::Cifs | FilesystemKind::Fuse);
            FilesystemInfo {
                kind,
                supports_ownership: !is_network_fs,
                is_network_fs,
                mount_point,
            }
        }
        None => FilesystemInfo {
            kind: FilesystemKind::Other,
            supports_ownership: true,
            is_network_fs: false,
            mount_point: PathBuf::from("/"),
        },
    }
}

/// Metadata describing a stored bundle, as recorded per-target in stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub bundle_name: String,
    pub archive_file: String,
    pub sha256: String,
    pub created_at: chrono::DateTime<chrono::Local>,
    pub compression: String,
    pub encrypted: bool,
    pub recipient_fingerprints: Vec<String>,
    pub source_location: Location,
}

/// Outcome of storing a bundle on one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResult {
    pub bytes_uploaded: u64,
    pub duration_ms: u64,
}

/// Outcome of verifying a stored bundle. `verified=false, err=None` means a
/// checksum mismatch was observed without any transport error (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResult {
    pub verified: bool,
    pub detail: Option<String>,
}

/// A target this bundle was removed from as part of retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionResult {
    pub removed: Vec<String>,
    pub kept: usize,
}

/// The narrow capability set every storage backend implements (§4.3, §9).
/// `Sync` lets the orchestrator fan replication out across worker threads
/// that each hold only a shared reference to the target (§5).
pub trait StorageTarget: Send + Sync {
    fn name(&self) -> &str;
    fn location(&self) -> Location;
    fn is_enabled(&self) -> bool;

    /// Only `Primary` is critical: a failure here aborts the run.
    fn is_critical(&self) -> bool {
        self.location() == Location::Primary
    }

    fn detect_filesystem(&self) -> Option<FilesystemInfo>;

    /// Copies the bundle directory (archive + checksum + manifest, optional
    /// encrypted siblings) to this target.
    fn store(&self, bundle_dir: &Path, metadata: &BundleMetadata) -> Result<StoreResult>;

    /// Lists bundle directory names known to this target, most-recent-name
    /// ordering is the caller's responsibility.
    fn list(&self) -> Result<Vec<String>>;

    fn delete(&self, bundle_name: &str) -> Result<()>;

    fn verify(&self, bundle_name: &str, expected_sha256: &str, archive_file: &str) -> Result<VerifyResult>;

    fn apply_retention(&self, policy: RetentionPolicyKind, simple_keep: usize, gfs: GfsCounts) -> Result<RetentionResult> {
        let names = self.list()?;
        let plan = retention::plan(&names, policy, simple_keep, gfs);
        let mut removed = Vec::new();
        for name in &plan.remove {
            if self.delete(name).is_ok() {
                removed.push(name.clone());
            }
        }
        Ok(RetentionResult {
            removed,
            kept: plan.keep.len(),
        })
    }
}

/// Builds the registry of enabled storage targets from config, in the
/// deterministic replication order `Primary, Secondary, Cloud` (§4.7).
pub fn build_targets(config: &Config) -> Result<Vec<Arc<dyn StorageTarget>>> {
    let mut targets: Vec<Arc<dyn StorageTarget>> = Vec::new();

    let primary_path = config
        .get_path("BACKUP_PATH")
        .ok_or_else(|| crate::error::ConfigError::Validation {
            message: "BACKUP_PATH must be set".into(),
        })?;
    targets.push(Arc::new(LocalTarget::new(
        "primary",
        Location::Primary,
        primary_path,
        true,
    )));

    if config.secondary_enabled() {
        if let Some(path) = config.get_path("SECONDARY_PATH") {
            targets.push(Arc::new(LocalTarget::new(
                "secondary",
                Location::Secondary,
                path,
                true,
            )));
        }
    }

    if config.cloud_enabled() {
        if let Some(remote) = config.get("CLOUD_REMOTE") {
            targets.push(Arc::new(CloudTarget::new("cloud", remote)));
        }
    }

    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_detection_falls_back_gracefully() {
        // Exercises the no-/proc/mounts fallback path deterministically by
        // pointing at a path unlikely to appear in any real mount table.
        let info = detect_filesystem(Path::new("/this/path/does/not/exist/at/all"));
        assert!(matches!(info.kind, FilesystemKind::Other) || !info.is_network_fs);
    }
}
