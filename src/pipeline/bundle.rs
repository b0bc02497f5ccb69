//! Bundle finalize and atomic publish (§4.6 steps 8-9): gathers the staged
//! artifacts into a single `backup-<host>-<yyyymmdd-HHMMSS>/` directory and
//! publishes it into the primary backup path with a single rename so that
//! readers never observe a partially-written bundle.

use chrono::Local;
use std::io;
use std::path::{Path, PathBuf};

/// Moves `artifacts` into a freshly named bundle directory under
/// `staging_root`, then renames that directory into `primary_root`. Returns
/// the final, published bundle path.
///
/// `staging_root` and `primary_root` must live on the same filesystem for the
/// final rename to be atomic; both are subpaths of `BACKUP_PATH` by
/// construction, so this always holds in practice.
pub fn finalize(
    staging_root: &Path,
    primary_root: &Path,
    host: &str,
    artifacts: &[PathBuf],
) -> io::Result<PathBuf> {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let base_name = format!("backup-{host}-{timestamp}");

    let staged_bundle = unique_path(staging_root, &base_name);
    std::fs::create_dir_all(&staged_bundle)?;

    for artifact in artifacts {
        let Some(file_name) = artifact.file_name() else {
            continue;
        };
        if !artifact.exists() {
            continue;
        }
        std::fs::rename(artifact, staged_bundle.join(file_name))?;
    }

    let published = unique_path(primary_root, &base_name);
    std::fs::create_dir_all(primary_root)?;
    std::fs::rename(&staged_bundle, &published)?;

    Ok(published)
}

/// Returns `root/name`, or `root/name-1`, `root/name-2`, ... if that path is
/// already taken, so concurrent or same-second runs never collide.
fn unique_path(root: &Path, name: &str) -> PathBuf {
    let candidate = root.join(name);
    if !candidate.exists() {
        return candidate;
    }
    for suffix in 1u32.. {
        let candidate = root.join(format!("{name}-{suffix}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("u32 suffix space exhausted")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn finalize_publishes_all_artifacts_under_one_dir() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join(".staging");
        let primary = dir.path().join("backups");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(&primary).unwrap();

        let archive = staging.join("archive.tar.zst");
        let manifest = staging.join("manifest.json");
        std::fs::write(&archive, b"archive bytes").unwrap();
        std::fs::write(&manifest, b"{}").unwrap();

        let bundle_dir = finalize(&staging, &primary, "pve1", &[archive, manifest]).unwrap();

        assert!(bundle_dir.starts_with(&primary));
        assert!(bundle_dir.join("archive.tar.zst").exists());
        assert!(bundle_dir.join("manifest.json").exists());
    }

    #[test]
    fn unique_path_avoids_collisions() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("backup-x")).unwrap();
        let candidate = unique_path(dir.path(), "backup-x");
        assert_eq!(candidate, dir.path().join("backup-x-1"));
    }
}
