//! Checksum and manifest stages (§4.6 steps 5-6): sha256 sidecar files and a
//! stable, sorted JSON manifest enumerating every successfully archived
//! file plus the ones that failed to open.

use super::collect::CollectOutcome;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub sha256: String,
    pub mode: u32,
    pub mtime: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    generated_at: chrono::DateTime<chrono::Local>,
    entries: Vec<ManifestEntry>,
    failed: Vec<String>,
}

/// Computes sha256 over a file and returns the hex digest.
pub fn sha256_sidecar(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Writes the JSON manifest for a collected set of files, sorted by path for
/// a stable, diffable format.
pub fn write_manifest(manifest_path: &Path, outcome: &CollectOutcome) -> io::Result<()> {
    let mut entries = Vec::with_capacity(outcome.files.len());
    for file in &outcome.files {
        let sha256 = sha256_sidecar(&file.absolute_path).unwrap_or_default();
        entries.push(ManifestEntry {
            path: file.relative_path.clone(),
            size: file.size,
            sha256,
            mode: file.mode,
            mtime: file.mtime,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut failed: Vec<String> = outcome.failed.iter().map(|(p, _)| p.display().to_string()).collect();
    failed.sort();

    let manifest = Manifest {
        generated_at: chrono::Local::now(),
        entries,
        failed,
    };

    let json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    std::fs::write(manifest_path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::collect::CollectedFile;
    use tempfile::tempdir;

    #[test]
    fn manifest_is_sorted_and_complete() {
        let dir = tempdir().unwrap();
        let file_b = dir.path().join("b.conf");
        let file_a = dir.path().join("a.conf");
        std::fs::write(&file_b, b"b").unwrap();
        std::fs::write(&file_a, b"a").unwrap();

        let outcome = CollectOutcome {
            files: vec![
                CollectedFile {
                    absolute_path: file_b.clone(),
                    relative_path: "b.conf".into(),
                    size: 1,
                    mode: 0o644,
                    mtime: 0,
                },
                CollectedFile {
                    absolute_path: file_a.clone(),
                    relative_path: "a.conf".into(),
                    size: 1,
                    mode: 0o644,
                    mtime: 0,
                },
            ],
            failed: vec![(dir.path().join("broken"), "permission denied".into())],
            dirs_created: 0,
        };

        let manifest_path = dir.path().join("manifest.json");
        write_manifest(&manifest_path, &outcome).unwrap();

        let content = std::fs::read_to_string(&manifest_path).unwrap();
        let parsed: Manifest = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.entries[0].path, "a.conf");
        assert_eq!(parsed.entries[1].path, "b.conf");
        assert_eq!(parsed.failed.len(), 1);
    }

    #[test]
    fn sha256_sidecar_is_deterministic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"content").unwrap();
        let h1 = sha256_sidecar(&path).unwrap();
        let h2 = sha256_sidecar(&path).unwrap();
        assert_eq!(h1, h2);
    }
}
