//! Archive stage (§4.6 step 3): builds a tar archive from a stably-ordered
//! file list so that archives produced from identical inputs are
//! byte-identical modulo mtimes.

use super::collect::CollectedFile;
use std::fs::File;
use std::io;
use std::path::Path;
use tar::{Builder, Header};

pub fn build_archive(tar_path: &Path, files: &[CollectedFile]) -> io::Result<()> {
    let tar_file = File::create(tar_path)?;
    let mut builder = Builder::new(tar_file);

    for file in files {
        let mut header = Header::new_gnu();
        header.set_size(file.size);
        header.set_mode(file.mode);
        header.set_mtime(file.mtime);
        header.set_cksum();

        let mut source = match File::open(&file.absolute_path) {
            Ok(f) => f,
            Err(_) => continue,
        };

        builder.append_data(&mut header, &file.relative_path, &mut source)?;
    }

    builder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builds_readable_tar() {
        let dir = tempdir().unwrap();
        let src_file = dir.path().join("source.txt");
        std::fs::write(&src_file, b"archived content").unwrap();

        let files = vec![CollectedFile {
            absolute_path: src_file.clone(),
            relative_path: "source.txt".to_string(),
            size: std::fs::metadata(&src_file).unwrap().len(),
            mode: 0o644,
            mtime: 0,
        }];

        let tar_path = dir.path().join("archive.tar");
        build_archive(&tar_path, &files).unwrap();

        let tar_file = File::open(&tar_path).unwrap();
        let mut archive = tar::Archive::new(tar_file);
        let mut count = 0;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.path().unwrap().to_str().unwrap(), "source.txt");
            count += 1;
        }
        assert_eq!(count, 1);
    }
}
