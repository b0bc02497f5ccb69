//! Cloud storage target: drives the external `rclone` binary as a
//! subprocess (§4.3, §6). Required only when `CLOUD_ENABLED=true`.

use super::{BundleMetadata, FilesystemInfo, Location, StoreResult, VerifyResult};
use crate::error::{ProxSaveError, Result};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct CloudTarget {
    name: String,
    remote: String,
    enabled: bool,
}

impl CloudTarget {
    pub fn new(name: impl Into<String>, remote: String) -> Self {
        Self {
            name: name.into(),
            remote,
            enabled: true,
        }
    }

    fn bundle_remote_path(&self, bundle_name: &str) -> String {
        format!("{}/{}", self.remote.trim_end_matches('/'), bundle_name)
    }

    /// Runs an `rclone` subcommand with bounded retry and exponential
    /// backoff (default 3 attempts, starting at 2s, capped at 30s).
    fn run_with_retry(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match Command::new("rclone").args(args).output() {
                Ok(output) if output.status.success() => return Ok(output),
                Ok(output) => {
                    last_err = Some(String::from_utf8_lossy(&output.stderr).to_string());
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                }
            }

            if attempt < MAX_ATTEMPTS {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        Err(ProxSaveError::storage(
            "cloud",
            args.first().unwrap_or(&"rclone"),
            last_err.unwrap_or_else(|| "unknown rclone failure".to_string()),
        ))
    }
}

impl super::StorageTarget for CloudTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> Location {
        Location::Cloud
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn detect_filesystem(&self) -> Option<FilesystemInfo> {
        // Cloud remotes are not a local mount; callers that need a local
        // staging area should downgrade this target instead (§4.4).
        None
    }

    fn store(&self, bundle_dir: &Path, metadata: &BundleMetadata) -> Result<StoreResult> {
        let start = Instant::now();
        let remote_path = self.bundle_remote_path(&metadata.bundle_name);
        let bundle_dir_str = bundle_dir.to_string_lossy().to_string();

        self.run_with_retry(&["copy", &bundle_dir_str, &remote_path])?;

        let bytes_uploaded = dir_size(bundle_dir);
        Ok(StoreResult {
            bytes_uploaded,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn list(&self) -> Result<Vec<String>> {
        let output = self.run_with_retry(&["lsf", "--dirs-only", &self.remote])?;
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(listing
            .lines()
            .map(|l| l.trim_end_matches('/').to_string())
            .filter(|l| l.starts_with("backup-"))
            .collect())
    }

    fn delete(&self, bundle_name: &str) -> Result<()> {
        let remote_path = self.bundle_remote_path(bundle_name);
        self.run_with_retry(&["purge", &remote_path])?;
        Ok(())
    }

    fn verify(&self, bundle_name: &str, expected_sha256: &str, archive_file: &str) -> Result<VerifyResult> {
        let remote_file = format!("{}/{}", self.bundle_remote_path(bundle_name), archive_file);

        // Prefer a remote-side hash check when the backend supports it;
        // fall back to a size-only sanity check otherwise (§4.3).
        match self.run_with_retry(&["sha256sum", &remote_file]) {
            Ok(output) => {
                let listing = String::from_utf8_lossy(&output.stdout);
                let actual = listing.split_whitespace().next().unwrap_or("");
                if actual.eq_ignore_ascii_case(expected_sha256) {
                    Ok(VerifyResult {
                        verified: true,
                        detail: None,
                    })
                } else {
                    Ok(VerifyResult {
                        verified: false,
                        detail: Some(format!("cloud checksum mismatch for {remote_file}")),
                    })
                }
            }
            Err(_) => match self.run_with_retry(&["size", &self.bundle_remote_path(bundle_name)]) {
                Ok(output) => {
                    let out = String::from_utf8_lossy(&output.stdout);
                    let has_size = out.contains("Total size:") && !out.contains("0 Bytes");
                    Ok(VerifyResult {
                        verified: has_size,
                        detail: if has_size {
                            None
                        } else {
                            Some("remote reports zero size".to_string())
                        },
                    })
                }
                Err(e) => Err(e),
            },
        }
    }
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
    }
    total
}
