//! Source archive unpacking and repacking.
//!
//! Staging unpacks a package's source archive into [`EXTRACT_DIR`] so upstream
//! sources can be edited like any other file. After such an edit the archive
//! is rebuilt from that tree under its original name and compression, since
//! the build service only ever receives top-level files.
//!
//! Tarballs are written with deterministic headers and zip entries with a
//! fixed timestamp: repacking an unchanged tree yields identical bytes, which
//! keeps the working-copy digest stable.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tracing::debug;

use crate::error::ArtifactError;

/// Directory inside the working copy holding the unpacked source archive.
pub const EXTRACT_DIR: &str = "extracted";

const XZ_PRESET: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarXz,
    TarBz2,
    Zip,
}

impl ArchiveFormat {
    /// Format implied by a file name's suffix.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            Some(Self::TarXz)
        } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz") {
            Some(Self::TarBz2)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

fn format_of(archive: &Path) -> Result<ArchiveFormat, ArtifactError> {
    archive
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(ArchiveFormat::from_name)
        .ok_or_else(|| archive_error(archive, "unsupported archive format".into()))
}

fn archive_error(path: &Path, message: String) -> ArtifactError {
    ArtifactError::Archive {
        path: path.to_path_buf(),
        message,
    }
}

/// Unpack `archive` into `dest`, creating it if needed.
///
/// Members with absolute paths or `..` components are not written outside
/// `dest`.
pub fn unpack(archive: &Path, dest: &Path) -> Result<(), ArtifactError> {
    let format = format_of(archive)?;
    fs::create_dir_all(dest).map_err(|e| ArtifactError::io(dest, e))?;
    let file = File::open(archive).map_err(|e| ArtifactError::io(archive, e))?;
    let reader = BufReader::new(file);

    let result = match format {
        ArchiveFormat::TarGz => unpack_tar(flate2::read::GzDecoder::new(reader), dest),
        ArchiveFormat::TarXz => unpack_tar(xz2::read::XzDecoder::new(reader), dest),
        ArchiveFormat::TarBz2 => unpack_tar(bzip2::read::BzDecoder::new(reader), dest),
        ArchiveFormat::Zip => zip::ZipArchive::new(reader)
            .and_then(|mut zip| zip.extract(dest))
            .map_err(|e| e.to_string()),
    };
    result.map_err(|message| archive_error(archive, message))?;

    debug!(archive = %archive.display(), dest = %dest.display(), "unpacked source archive");
    Ok(())
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<(), String> {
    tar::Archive::new(reader)
        .unpack(dest)
        .map_err(|e| e.to_string())
}

/// Rebuild `archive` from the entries of `src_dir`, each stored under its
/// name relative to `src_dir`.
///
/// The new archive is written beside the old one and renamed over it, so a
/// failed repack leaves the previous archive in place.
pub fn pack(src_dir: &Path, archive: &Path) -> Result<(), ArtifactError> {
    let format = format_of(archive)?;
    let items = top_level_items(src_dir)?;
    let partial = partial_path(archive);

    let file = File::create(&partial).map_err(|e| ArtifactError::io(&partial, e))?;
    let writer = BufWriter::new(file);
    let written = match format {
        ArchiveFormat::TarGz => write_tar(
            flate2::write::GzEncoder::new(writer, flate2::Compression::default()),
            src_dir,
            &items,
        )
        .and_then(|enc| enc.finish()),
        ArchiveFormat::TarXz => write_tar(
            xz2::write::XzEncoder::new(writer, XZ_PRESET),
            src_dir,
            &items,
        )
        .and_then(|enc| enc.finish()),
        ArchiveFormat::TarBz2 => write_tar(
            bzip2::write::BzEncoder::new(writer, bzip2::Compression::default()),
            src_dir,
            &items,
        )
        .and_then(|enc| enc.finish()),
        ArchiveFormat::Zip => write_zip(writer, src_dir),
    }
    .and_then(|mut w| w.flush());

    if let Err(e) = written {
        let _ = fs::remove_file(&partial);
        return Err(archive_error(archive, e.to_string()));
    }
    fs::rename(&partial, archive).map_err(|e| ArtifactError::io(archive, e))?;

    debug!(archive = %archive.display(), entries = items.len(), "repacked source archive");
    Ok(())
}

fn partial_path(archive: &Path) -> PathBuf {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    archive.with_file_name(format!(".{name}.partial"))
}

fn top_level_items(src_dir: &Path) -> Result<Vec<String>, ArtifactError> {
    let read = fs::read_dir(src_dir).map_err(|e| ArtifactError::io(src_dir, e))?;
    let mut items = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| ArtifactError::io(src_dir, e))?;
        items.push(entry.file_name().to_string_lossy().into_owned());
    }
    items.sort();
    Ok(items)
}

fn write_tar<W: Write>(writer: W, src_dir: &Path, items: &[String]) -> io::Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);
    for name in items {
        let path = src_dir.join(name);
        if path.is_dir() {
            builder.append_dir_all(name, &path)?;
        } else {
            builder.append_path_with_name(&path, name)?;
        }
    }
    builder.into_inner()
}

fn write_zip<W: Write + Seek>(writer: W, src_dir: &Path) -> io::Result<W> {
    let mut zip = zip::ZipWriter::new(writer);

    let walker = WalkBuilder::new(src_dir)
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();
    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(src_dir) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let name = rel.to_string_lossy().replace('\\', "/");
        let meta = path.metadata()?;
        let options = zip::write::SimpleFileOptions::default()
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(file_mode(&meta));
        if meta.is_dir() {
            zip.add_directory(name, options).map_err(io::Error::other)?;
        } else {
            zip.start_file(name, options).map_err(io::Error::other)?;
            io::copy(&mut File::open(path)?, &mut zip)?;
        }
    }
    zip.finish().map_err(io::Error::other)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_tree(root: &Path) -> PathBuf {
        let tree = root.join("tree");
        fs::create_dir_all(tree.join("bc-1.07/src")).unwrap();
        fs::write(tree.join("bc-1.07/configure.ac"), "AC_INIT([bc], [1.07])\n").unwrap();
        fs::write(tree.join("bc-1.07/src/main.c"), "int main(void) { return 0; }\n").unwrap();
        tree
    }

    #[test]
    fn format_follows_suffix() {
        assert_eq!(ArchiveFormat::from_name("bc-1.07.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("bc.TGZ"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("bc.tar.xz"), Some(ArchiveFormat::TarXz));
        assert_eq!(ArchiveFormat::from_name("bc.tbz"), Some(ArchiveFormat::TarBz2));
        assert_eq!(ArchiveFormat::from_name("bc.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_name("bc.tar.zst"), None);
    }

    #[test]
    fn every_format_unpacks_what_was_packed() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = source_tree(tmp.path());
        for name in ["a.tar.gz", "a.tar.xz", "a.tar.bz2", "a.zip"] {
            let archive = tmp.path().join(name);
            pack(&tree, &archive).unwrap();
            let out = tmp.path().join(format!("out-{name}"));
            unpack(&archive, &out).unwrap();
            assert_eq!(
                fs::read_to_string(out.join("bc-1.07/src/main.c")).unwrap(),
                "int main(void) { return 0; }\n",
                "{name}"
            );
            assert!(!tmp.path().join(format!(".{name}.partial")).exists());
        }
    }

    #[test]
    fn repacking_unchanged_tree_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = source_tree(tmp.path());
        for name in ["a.tar.gz", "a.zip"] {
            let archive = tmp.path().join(name);
            pack(&tree, &archive).unwrap();
            let first = fs::read(&archive).unwrap();
            pack(&tree, &archive).unwrap();
            assert_eq!(fs::read(&archive).unwrap(), first, "{name}");
        }
    }

    #[test]
    fn corrupt_archive_does_not_unpack() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("bc.tar.gz");
        fs::write(&archive, [0x1f, 0x8b, 0x08, 0x00]).unwrap();
        let err = unpack(&archive, &tmp.path().join("out")).unwrap_err();
        assert!(matches!(err, ArtifactError::Archive { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn unknown_suffix_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = source_tree(tmp.path());
        let err = pack(&tree, &tmp.path().join("bc.rar")).unwrap_err();
        assert!(matches!(err, ArtifactError::Archive { .. }));
    }
}
