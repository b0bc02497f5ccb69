//! Collect stage (§4.6 step 1-2): walks a static inventory of Proxmox
//! configuration sources plus any user-configured additional paths, applying
//! exclusions and the optional size/type prefilter. Per-file failures do not
//! abort the stage.

use crate::config::Config;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One successfully collected file, ready for archiving.
#[derive(Debug, Clone)]
pub struct CollectedFile {
    pub absolute_path: PathBuf,
    pub relative_path: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
}

#[derive(Debug, Default)]
pub struct CollectOutcome {
    pub files: Vec<CollectedFile>,
    pub failed: Vec<(PathBuf, String)>,
    pub dirs_created: u64,
}

/// The fixed Proxmox VE/PBS configuration inventory collected on every run.
pub fn default_sources() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/etc/pve"),
        PathBuf::from("/etc/network/interfaces"),
        PathBuf::from("/etc/network/interfaces.d"),
        PathBuf::from("/etc/hosts"),
        PathBuf::from("/etc/resolv.conf"),
        PathBuf::from("/etc/proxmox-backup"),
    ]
}

/// Combines the fixed inventory with `ADDITIONAL_BACKUP_PATHS` from config.
pub fn resolve_sources(config: &Config) -> Vec<PathBuf> {
    let mut sources = default_sources();
    sources.extend(config.additional_backup_paths());
    sources
}

/// Walks every source, collecting files while always excluding the backup
/// destinations themselves and any configured glob patterns. Symlinks are
/// never followed outside the source root (§4.6).
pub fn collect(sources: &[PathBuf], config: &Config) -> crate::error::Result<CollectOutcome> {
    let mut outcome = CollectOutcome::default();

    let mut excludes = config.exclude_patterns();
    for key in ["BACKUP_PATH", "SECONDARY_PATH", "LOG_PATH", "LOCK_PATH", "BASE_DIR"] {
        if let Some(p) = config.get(key) {
            if !p.is_empty() {
                excludes.push(p);
            }
        }
    }

    let prefilter_enabled = config.prefilter_enabled();
    let max_size_bytes = config.prefilter_max_file_size_mb() * 1024 * 1024;

    let mut seen_roots = std::collections::HashSet::new();

    for source in sources {
        if !source.exists() {
            continue;
        }
        let canonical_root = fs::canonicalize(source).unwrap_or_else(|_| source.clone());

        let walker = WalkDir::new(source).follow_links(false).sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    outcome.failed.push((source.clone(), e.to_string()));
                    continue;
                }
            };

            let path = entry.path();

            if is_excluded(path, &excludes) {
                continue;
            }

            let file_type = entry.file_type();

            if file_type.is_dir() {
                seen_roots.insert(path.to_path_buf());
                continue;
            }

            if file_type.is_symlink() {
                continue;
            }

            let meta = match fs::symlink_metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    outcome.failed.push((path.to_path_buf(), e.to_string()));
                    continue;
                }
            };

            if meta.file_type().is_socket() || meta.file_type().is_block_device() || meta.file_type().is_char_device() || meta.file_type().is_fifo() {
                continue;
            }

            if !file_type.is_file() {
                continue;
            }

            let size = meta.len();
            if prefilter_enabled && size > max_size_bytes {
                tracing::info!(path = %path.display(), size, "prefilter: skipping oversized file");
                continue;
            }

            let relative = path
                .strip_prefix(&canonical_root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            let relative_path = format!(
                "{}/{}",
                canonical_root.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
                relative
            );

            #[cfg(unix)]
            let mode = {
                use std::os::unix::fs::PermissionsExt;
                meta.permissions().mode()
            };
            #[cfg(not(unix))]
            let mode = 0o644;

            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            outcome.files.push(CollectedFile {
                absolute_path: path.to_path_buf(),
                relative_path,
                size,
                mode,
                mtime,
            });
        }
    }

    outcome.dirs_created = seen_roots.len() as u64;
    // Stable ordering by absolute path so archives of identical inputs are
    // byte-identical modulo mtimes (§4.6 step 3).
    outcome.files.sort_by(|a, b| a.absolute_path.cmp(&b.absolute_path));

    Ok(outcome)
}

fn is_excluded(path: &Path, patterns: &[String]) -> bool {
    let path_str = path.to_string_lossy();
    for pattern in patterns {
        if let Some(prefix) = pattern.strip_suffix("/**") {
            if path_str.starts_with(prefix) {
                return true;
            }
        } else if path_str == pattern.as_str() || path_str.starts_with(&format!("{pattern}/")) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_with_backup_path(dir: &Path) -> Config {
        let path = dir.join("backup.env");
        fs::write(
            &path,
            format!("BACKUP_PATH={}\n", dir.join("excluded-dest").display()),
        )
        .unwrap();
        Config::load(&path).unwrap()
    }

    #[test]
    fn collects_regular_files_with_stable_ordering() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("srcroot");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("b.conf"), b"b").unwrap();
        fs::write(src.join("a.conf"), b"a").unwrap();

        let config = config_with_backup_path(dir.path());
        let outcome = collect(&[src.clone()], &config).unwrap();

        assert_eq!(outcome.files.len(), 2);
        assert!(outcome.files[0].absolute_path < outcome.files[1].absolute_path);
    }

    #[test]
    fn excludes_backup_destination() {
        let dir = tempdir().unwrap();
        let excluded = dir.path().join("excluded-dest");
        fs::create_dir_all(&excluded).unwrap();
        fs::write(excluded.join("leftover.tar"), b"x").unwrap();

        let src = dir.path().join("srcroot");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("keep.conf"), b"k").unwrap();

        let config = config_with_backup_path(dir.path());
        let outcome = collect(&[src, excluded], &config).unwrap();

        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.files[0].relative_path.contains("keep.conf"), true);
    }

    #[test]
    fn prefilter_skips_oversized_files() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("srcroot");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("big.bin"), vec![0u8; 2048]).unwrap();

        let path = dir.path().join("backup.env");
        fs::write(
            &path,
            format!(
                "BACKUP_PATH={}\nPREFILTER_ENABLED=true\nPREFILTER_MAX_FILE_SIZE_MB=0\n",
                dir.path().join("excluded-dest").display()
            ),
        )
        .unwrap();
        let config = Config::load(&path).unwrap();

        let outcome = collect(&[src], &config).unwrap();
        assert!(outcome.files.is_empty());
    }
}
