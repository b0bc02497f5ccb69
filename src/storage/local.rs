//! Local and secondary (NFS-capable) storage target.
//!
//! Both `primary` and `secondary` tiers are plain directories on a mounted
//! filesystem; the only difference is the `Location` tag that drives
//! criticality policy in the orchestrator (§4.3, §4.7).

use super::{BundleMetadata, FilesystemInfo, Location, StoreResult, VerifyResult};
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub struct LocalTarget {
    name: String,
    location: Location,
    root: PathBuf,
    enabled: bool,
}

impl LocalTarget {
    pub fn new(name: impl Into<String>, location: Location, root: PathBuf, enabled: bool) -> Self {
        Self {
            name: name.into(),
            location,
            root,
            enabled,
        }
    }

    fn bundle_path(&self, bundle_name: &str) -> PathBuf {
        self.root.join(bundle_name)
    }
}

impl super::StorageTarget for LocalTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> Location {
        self.location
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn detect_filesystem(&self) -> Option<FilesystemInfo> {
        Some(super::detect_filesystem(&self.root))
    }

    fn store(&self, bundle_dir: &Path, metadata: &BundleMetadata) -> Result<StoreResult> {
        let start = Instant::now();

        // Primary replication is a no-op: the pipeline already published the
        // bundle directly into this root (§4.7).
        if self.location == Location::Primary {
            let bytes = dir_size(bundle_dir)?;
            return Ok(StoreResult {
                bytes_uploaded: bytes,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        fs::create_dir_all(&self.root)?;
        let dest = self.bundle_path(&metadata.bundle_name);
        let staging = self.root.join(format!(".{}.staging", metadata.bundle_name));

        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let mut bytes_uploaded = 0u64;
        for entry in fs::read_dir(bundle_dir)? {
            let entry = entry?;
            let src = entry.path();
            if !src.is_file() {
                continue;
            }
            let dst = staging.join(entry.file_name());
            bytes_uploaded += fs::copy(&src, &dst)?;
            if let Ok(f) = fs::File::open(&dst) {
                let _ = f.sync_all();
            }
        }

        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        fs::rename(&staging, &dest)?;

        Ok(StoreResult {
            bytes_uploaded,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn list(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with("backup-") && !name.starts_with('.') {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    fn delete(&self, bundle_name: &str) -> Result<()> {
        let path = self.bundle_path(bundle_name);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    fn verify(&self, bundle_name: &str, expected_sha256: &str, archive_file: &str) -> Result<VerifyResult> {
        let path = self.bundle_path(bundle_name).join(archive_file);
        if !path.exists() {
            return Ok(VerifyResult {
                verified: false,
                detail: Some(format!("archive missing at {}", path.display())),
            });
        }

        let mut file = fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        let actual = hex::encode(hasher.finalize());

        if actual == expected_sha256 {
            Ok(VerifyResult {
                verified: true,
                detail: None,
            })
        } else {
            Ok(VerifyResult {
                verified: false,
                detail: Some(format!("checksum mismatch: expected {expected_sha256}, got {actual}")),
            })
        }
    }
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    if path.exists() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.path().is_file() {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::super::StorageTarget;
    use super::*;
    use tempfile::tempdir;

    fn write_bundle(dir: &Path, content: &[u8]) -> String {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("archive.tar.zst"), content).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    fn metadata(bundle_name: &str, sha256: &str) -> BundleMetadata {
        BundleMetadata {
            bundle_name: bundle_name.to_string(),
            archive_file: "archive.tar.zst".to_string(),
            sha256: sha256.to_string(),
            created_at: chrono::Local::now(),
            compression: "zstd".to_string(),
            encrypted: false,
            recipient_fingerprints: Vec::new(),
            source_location: Location::Primary,
        }
    }

    #[test]
    fn store_then_verify_round_trip() {
        let src_dir = tempdir().unwrap();
        let dest_dir = tempdir().unwrap();
        let sha = write_bundle(src_dir.path().join("backup-host-1").as_path(), b"archive bytes");

        let target = LocalTarget::new("secondary", Location::Secondary, dest_dir.path().to_path_buf(), true);
        let meta = metadata("backup-host-1", &sha);
        target.store(&src_dir.path().join("backup-host-1"), &meta).unwrap();

        let result = target.verify("backup-host-1", &sha, "archive.tar.zst").unwrap();
        assert!(result.verified);
    }

    #[test]
    fn verify_detects_mismatch() {
        let src_dir = tempdir().unwrap();
        let dest_dir = tempdir().unwrap();
        let sha = write_bundle(src_dir.path().join("backup-host-2").as_path(), b"archive bytes");

        let target = LocalTarget::new("secondary", Location::Secondary, dest_dir.path().to_path_buf(), true);
        let meta = metadata("backup-host-2", &sha);
        target.store(&src_dir.path().join("backup-host-2"), &meta).unwrap();

        let result = target.verify("backup-host-2", "0000000000000000000000000000000000000000000000000000000000000000", "archive.tar.zst").unwrap();
        assert!(!result.verified);
    }

    #[test]
    fn delete_removes_bundle_directory() {
        let dest_dir = tempdir().unwrap();
        let bundle_dir = dest_dir.path().join("backup-host-3");
        fs::create_dir_all(&bundle_dir).unwrap();

        let target = LocalTarget::new("secondary", Location::Secondary, dest_dir.path().to_path_buf(), true);
        target.delete("backup-host-3").unwrap();
        assert!(!bundle_dir.exists());
    }

    #[test]
    fn list_only_returns_backup_directories() {
        let dest_dir = tempdir().unwrap();
        fs::create_dir_all(dest_dir.path().join("backup-a")).unwrap();
        fs::create_dir_all(dest_dir.path().join("not-a-backup")).unwrap();

        let target = LocalTarget::new("secondary", Location::Secondary, dest_dir.path().to_path_buf(), true);
        let names = target.list().unwrap();
        assert_eq!(names, vec!["backup-a".to_string()]);
    }
}
