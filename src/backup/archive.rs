// tenangdb/src/backup/archive.rs
use anyhow::Context;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tar::{Archive, Builder};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::{AppError, Result};

/// Logical archive formats accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarZst,
    TarXz,
    Zip,
}

impl ArchiveFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarZst => "tar.zst",
            ArchiveFormat::TarXz => "tar.xz",
            ArchiveFormat::Zip => "zip",
        }
    }

    /// Only gzip-compressed tar has a codec behind it.
    pub fn is_implemented(&self) -> bool {
        matches!(self, ArchiveFormat::TarGz)
    }

    /// Filename suffixes this format is recognised by, longest first.
    fn suffixes(&self) -> &'static [&'static str] {
        match self {
            ArchiveFormat::TarGz => &[".tar.gz", ".tgz"],
            ArchiveFormat::TarZst => &[".tar.zst"],
            ArchiveFormat::TarXz => &[".tar.xz"],
            ArchiveFormat::Zip => &[".zip"],
        }
    }

    /// Detects the format from an archive filename.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        [
            ArchiveFormat::TarGz,
            ArchiveFormat::TarZst,
            ArchiveFormat::TarXz,
            ArchiveFormat::Zip,
        ]
        .into_iter()
        .find(|format| format.suffixes().iter().any(|s| name.ends_with(s)))
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ArchiveFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tar.gz" | "tgz" | "gzip" | "gz" => Ok(ArchiveFormat::TarGz),
            "tar.zst" | "zstd" | "zst" => Ok(ArchiveFormat::TarZst),
            "tar.xz" | "xz" => Ok(ArchiveFormat::TarXz),
            "zip" => Ok(ArchiveFormat::Zip),
            other => Err(AppError::Config(format!("Unknown archive format: {}", other))),
        }
    }
}

/// Outcome of a successful pack.
#[derive(Debug, Clone)]
pub struct PackReport {
    pub archive_path: PathBuf,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
}

impl PackReport {
    /// compressed / original; 0 for an empty source.
    pub fn ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        self.compressed_bytes as f64 / self.original_bytes as f64
    }
}

/// Packs a dump directory into one compressed container and back.
#[derive(Debug, Clone)]
pub struct ArchiveCodec {
    format: ArchiveFormat,
    level: u32,
    keep_original: bool,
}

impl ArchiveCodec {
    pub fn new(format: ArchiveFormat, level: u32, keep_original: bool) -> Result<Self> {
        if !format.is_implemented() {
            return Err(AppError::UnsupportedFormat(format.name().to_string()));
        }
        if !(1..=9).contains(&level) {
            return Err(AppError::Config(format!(
                "compression level must be between 1 and 9, got {}",
                level
            )));
        }
        Ok(Self {
            format,
            level,
            keep_original,
        })
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Archive path produced for `source_dir`: a sibling named `<dir>.tar.gz`.
    pub fn archive_path_for(&self, source_dir: &Path) -> Result<PathBuf> {
        let name = source_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                AppError::Compression(format!("Invalid source directory name: {}", source_dir.display()))
            })?;
        Ok(source_dir.with_file_name(format!("{}.{}", name, self.format.name())))
    }

    /// Creates a GZipped TAR archive next to `source_dir`.
    ///
    /// Entries are named relative to the parent of `source_dir`, so the
    /// directory itself is the archive's top-level entry. The source is
    /// removed afterwards unless `keep_original` is set.
    pub fn pack(&self, source_dir: &Path) -> Result<PackReport> {
        if !source_dir.is_dir() {
            return Err(AppError::Compression(format!(
                "Source for archival is not a directory: {}",
                source_dir.display()
            )));
        }
        let base = source_dir.parent().ok_or_else(|| {
            AppError::Compression(format!("Source directory has no parent: {}", source_dir.display()))
        })?;
        let archive_path = self.archive_path_for(source_dir)?;

        info!(
            source = %source_dir.display(),
            archive = %archive_path.display(),
            level = self.level,
            "creating archive"
        );

        let archive_file = File::create(&archive_path).with_context(|| {
            format!("Failed to create archive file: {}", archive_path.display())
        })?;
        let enc = GzEncoder::new(BufWriter::new(archive_file), Compression::new(self.level));
        let mut tar_builder = Builder::new(enc);
        tar_builder.follow_symlinks(false);

        let mut original_bytes = 0u64;
        for entry in WalkDir::new(source_dir).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
            let path = entry.path();
            let name = path.strip_prefix(base).with_context(|| {
                format!("Failed to strip prefix {} from {}", base.display(), path.display())
            })?;

            let file_type = entry.file_type();
            if file_type.is_dir() {
                tar_builder.append_dir(name, path).with_context(|| {
                    format!("Failed to append directory {} to archive", path.display())
                })?;
            } else if file_type.is_file() {
                original_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                tar_builder.append_path_with_name(path, name).with_context(|| {
                    format!("Failed to append file {} as {} to archive", path.display(), name.display())
                })?;
            } else {
                debug!(path = %path.display(), "skipping non-regular entry");
            }
        }

        let encoder = tar_builder.into_inner().with_context(|| {
            format!("Failed to finish tar stream for archive: {}", archive_path.display())
        })?;
        let mut writer = encoder.finish().with_context(|| {
            format!("Failed to finish Gzip encoding for archive: {}", archive_path.display())
        })?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| AppError::Io(e.into_error()))?
            .sync_all()?;

        let compressed_bytes = fs::metadata(&archive_path)?.len();
        let report = PackReport {
            archive_path,
            original_bytes,
            compressed_bytes,
        };
        info!(
            archive = %report.archive_path.display(),
            original_bytes,
            compressed_bytes,
            ratio = %format!("{:.3}", report.ratio()),
            "archive created"
        );

        if !self.keep_original {
            fs::remove_dir_all(source_dir).with_context(|| {
                format!("Failed to remove original directory {}", source_dir.display())
            })?;
            debug!(source = %source_dir.display(), "removed original dump directory");
        }

        Ok(report)
    }

    /// Extracts an archive next to itself and returns the recreated directory.
    pub fn unpack(&self, archive_path: &Path) -> Result<PathBuf> {
        if !archive_path.is_file() {
            return Err(AppError::Compression(format!(
                "Archive for extraction is not a file: {}",
                archive_path.display()
            )));
        }
        match ArchiveFormat::from_path(archive_path) {
            Some(ArchiveFormat::TarGz) => {}
            Some(other) => return Err(AppError::UnsupportedFormat(other.name().to_string())),
            None => {
                return Err(AppError::Compression(format!(
                    "Unrecognised archive suffix: {}",
                    archive_path.display()
                )));
            }
        }

        let output_dir = unpacked_dir_for(archive_path)?;
        let extract_to_dir = archive_path.parent().unwrap_or_else(|| Path::new("."));

        info!(
            archive = %archive_path.display(),
            output = %output_dir.display(),
            "extracting archive"
        );

        let archive_file = File::open(archive_path).with_context(|| {
            format!("Failed to open archive file: {}", archive_path.display())
        })?;
        let mut archive = Archive::new(GzDecoder::new(archive_file));
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);

        for entry in archive.entries().context("Failed to read archive entries")? {
            let mut entry = entry.context("Failed to read archive entry")?;
            let unpacked = entry.unpack_in(extract_to_dir).with_context(|| {
                format!("Failed to unpack entry from {}", archive_path.display())
            })?;
            if !unpacked {
                return Err(AppError::Compression(format!(
                    "Archive {} contains an entry outside the extraction directory",
                    archive_path.display()
                )));
            }
        }

        info!(output = %output_dir.display(), "archive extracted");
        Ok(output_dir)
    }
}

/// `/x/shopdb-2024-03-01.tar.gz` → `/x/shopdb-2024-03-01`.
pub fn unpacked_dir_for(archive_path: &Path) -> Result<PathBuf> {
    let name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::Compression(format!("Invalid archive name: {}", archive_path.display())))?;
    let stem = ArchiveFormat::from_path(archive_path)
        .and_then(|format| {
            format
                .suffixes()
                .iter()
                .find_map(|suffix| name.strip_suffix(suffix))
        })
        .unwrap_or(name);
    Ok(archive_path.with_file_name(stem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn build_dump_tree(root: &Path) -> PathBuf {
        let dump = root.join("shopdb-2024-03-01_02-00-00");
        fs::create_dir_all(dump.join("nested/deeper")).unwrap();
        fs::write(dump.join("metadata"), "Started dump at: 2024-03-01 02:00:00\n").unwrap();
        fs::write(dump.join("shopdb.orders-schema.sql"), "CREATE TABLE orders (id INT);\n").unwrap();
        fs::write(dump.join("nested/deeper/blob.bin"), (0..=255u8).cycle().take(4096).collect::<Vec<_>>()).unwrap();
        fs::set_permissions(dump.join("metadata"), fs::Permissions::from_mode(0o640)).unwrap();
        fs::set_permissions(dump.join("nested/deeper/blob.bin"), fs::Permissions::from_mode(0o600)).unwrap();
        dump
    }

    fn snapshot(dir: &Path) -> Vec<(PathBuf, Option<Vec<u8>>, u32)> {
        WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let rel = e.path().strip_prefix(dir).unwrap().to_path_buf();
                let meta = e.metadata().unwrap();
                let content = meta.is_file().then(|| fs::read(e.path()).unwrap());
                let mode = if meta.is_file() { meta.permissions().mode() & 0o777 } else { 0 };
                (rel, content, mode)
            })
            .collect()
    }

    #[test]
    fn test_pack_then_unpack_round_trips_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = build_dump_tree(tmp.path());
        let before = snapshot(&dump);

        let codec = ArchiveCodec::new(ArchiveFormat::TarGz, 6, false).unwrap();
        let report = codec.pack(&dump).unwrap();

        assert_eq!(report.archive_path, tmp.path().join("shopdb-2024-03-01_02-00-00.tar.gz"));
        assert!(!dump.exists(), "original directory should be removed");
        assert!(report.compressed_bytes > 0);

        let restored = codec.unpack(&report.archive_path).unwrap();
        assert_eq!(restored, dump);
        assert_eq!(snapshot(&restored), before);
    }

    #[test]
    fn test_keep_original_leaves_source() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = build_dump_tree(tmp.path());

        let codec = ArchiveCodec::new(ArchiveFormat::TarGz, 1, true).unwrap();
        let report = codec.pack(&dump).unwrap();

        assert!(dump.is_dir());
        assert!(report.archive_path.is_file());
        assert!(report.original_bytes > 4096);
    }

    #[test]
    fn test_archive_names_keep_directory_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let dump = build_dump_tree(tmp.path());
        let codec = ArchiveCodec::new(ArchiveFormat::TarGz, 6, true).unwrap();
        let report = codec.pack(&dump).unwrap();

        let file = File::open(&report.archive_path).unwrap();
        let mut archive = Archive::new(GzDecoder::new(file));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert!(names.iter().all(|n| n.starts_with("shopdb-2024-03-01_02-00-00")));
        assert!(names.iter().any(|n| n.ends_with("nested/deeper/blob.bin")));
    }

    #[test]
    fn test_unimplemented_formats_fail_fast() {
        for format in [ArchiveFormat::TarZst, ArchiveFormat::TarXz, ArchiveFormat::Zip] {
            let err = ArchiveCodec::new(format, 6, false).unwrap_err();
            assert!(matches!(err, AppError::UnsupportedFormat(_)));
        }
    }

    #[test]
    fn test_invalid_level_rejected() {
        assert!(ArchiveCodec::new(ArchiveFormat::TarGz, 0, false).is_err());
        assert!(ArchiveCodec::new(ArchiveFormat::TarGz, 10, false).is_err());
    }

    #[test]
    fn test_format_names_parse() {
        assert_eq!("tgz".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);
        assert_eq!("ZSTD".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarZst);
        assert!("rar".parse::<ArchiveFormat>().is_err());
    }

    #[test]
    fn test_unpacked_dir_strips_suffixes() {
        assert_eq!(
            unpacked_dir_for(Path::new("/b/shopdb/2024-03/shopdb-2024-03-01.tar.gz")).unwrap(),
            PathBuf::from("/b/shopdb/2024-03/shopdb-2024-03-01")
        );
        assert_eq!(
            unpacked_dir_for(Path::new("/b/shopdb.tgz")).unwrap(),
            PathBuf::from("/b/shopdb")
        );
    }

    #[test]
    fn test_pack_rejects_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let codec = ArchiveCodec::new(ArchiveFormat::TarGz, 6, false).unwrap();
        assert!(codec.pack(&tmp.path().join("missing")).is_err());
    }
}
