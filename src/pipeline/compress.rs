//! Compress stage (§4.6 step 4): dispatches to zstd, gzip, xz, or none.
//! `zstd` and `xz` use their respective worker-pool APIs when
//! `COMPRESSION_THREADS > 1`. Any compressor failure falls back to `none`
//! with a warning, recording both the requested and effective algorithm.

use crate::config::CompressionType;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Compresses `tar_path` per `requested`, writing the result alongside it in
/// `staging_root`. Returns the output path and the algorithm actually used.
pub fn compress_archive(
    tar_path: &Path,
    staging_root: &Path,
    requested: CompressionType,
    level: i32,
    threads: u32,
) -> crate::error::Result<(PathBuf, CompressionType)> {
    let output_path = staging_root.join(format!("archive.{}", requested.extension()));

    let result = match requested {
        CompressionType::Zstd => compress_zstd(tar_path, &output_path, level, threads),
        CompressionType::Gzip => compress_gzip(tar_path, &output_path, level),
        CompressionType::Xz => compress_xz(tar_path, &output_path, level, threads),
        CompressionType::None => {
            if output_path.as_path() == tar_path {
                Ok(())
            } else {
                std::fs::copy(tar_path, &output_path).map(|_| ())
            }
        }
    };

    match result {
        Ok(()) => Ok((output_path, requested)),
        Err(e) if requested != CompressionType::None => {
            tracing::warn!(error = %e, requested = %requested, "compress: falling back to none");
            let fallback_path = staging_root.join("archive.tar");
            if fallback_path.as_path() != tar_path {
                std::fs::copy(tar_path, &fallback_path)
                    .map_err(|e| crate::error::ProxSaveError::backup(crate::error::Phase::Compress, e.to_string()))?;
            }
            Ok((fallback_path, CompressionType::None))
        }
        Err(e) => Err(crate::error::ProxSaveError::backup(crate::error::Phase::Compress, e.to_string())),
    }
}

fn compress_zstd(input: &Path, output: &Path, level: i32, threads: u32) -> io::Result<()> {
    let input_file = File::open(input)?;
    let output_file = File::create(output)?;
    let mut encoder = zstd::Encoder::new(output_file, level)?;
    if threads > 1 {
        let _ = encoder.multithread(threads);
    }
    let mut reader = input_file;
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

fn compress_gzip(input: &Path, output: &Path, level: i32) -> io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut input_file = File::open(input)?;
    let output_file = File::create(output)?;
    let compression_level = (level.clamp(1, 9)) as u32;
    let mut encoder = GzEncoder::new(output_file, Compression::new(compression_level));
    io::copy(&mut input_file, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

fn compress_xz(input: &Path, output: &Path, level: i32, threads: u32) -> io::Result<()> {
    use xz2::write::XzEncoder;

    let mut input_file = File::open(input)?;
    let output_file = File::create(output)?;
    let preset = level.clamp(0, 9) as u32;

    if threads > 1 {
        if let Ok(stream) = xz2::stream::MtStreamBuilder::new()
            .threads(threads)
            .preset(preset)
            .encoder(xz2::stream::Check::Crc64)
        {
            let mut encoder = xz2::write::XzEncoder::new_stream(output_file, stream);
            io::copy(&mut input_file, &mut encoder)?;
            encoder.finish()?;
            return Ok(());
        }
    }

    let mut encoder = XzEncoder::new(output_file, preset);
    io::copy(&mut input_file, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn zstd_round_trip_via_decoder() {
        let dir = tempdir().unwrap();
        let tar_path = dir.path().join("archive.tar");
        std::fs::write(&tar_path, b"some archive bytes, repeated, repeated, repeated").unwrap();

        let (out_path, kind) = compress_archive(&tar_path, dir.path(), CompressionType::Zstd, 3, 1).unwrap();
        assert_eq!(kind, CompressionType::Zstd);

        let compressed = std::fs::read(&out_path).unwrap();
        let decompressed = zstd::decode_all(&compressed[..]).unwrap();
        assert_eq!(decompressed, std::fs::read(&tar_path).unwrap());
    }

    #[test]
    fn none_is_a_plain_copy() {
        let dir = tempdir().unwrap();
        let tar_path = dir.path().join("archive.tar");
        std::fs::write(&tar_path, b"plain bytes").unwrap();

        let (out_path, kind) = compress_archive(&tar_path, dir.path(), CompressionType::None, 3, 1).unwrap();
        assert_eq!(kind, CompressionType::None);
        assert_eq!(std::fs::read(&out_path).unwrap(), b"plain bytes");
    }
}
