//! Repository structure extraction.
//!
//! Produces the listing the model sees when it asks what a package contains:
//! relative paths with sizes, optionally the (truncated) text of shallow
//! files, and the member names of zip source archives. Unpacked upstream
//! sources sit deeper than `content_depth` and are listed without text; the
//! model reads them one at a time.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;
use crate::package::is_archive;

/// Files and directories that carry no build information.
pub const EXCLUDED_NAMES: &[&str] = &[
    "AUTHORS",
    "CHANGELOG.md",
    "CONTRIBUTING.md",
    "README.md",
    "LICENSE",
    "doc",
];

const TRUNCATION_MARKER: &str = "\n... [truncated]";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureOptions {
    pub include_contents: bool,
    /// Deepest level whose file text is included; top-level files are 1.
    pub content_depth: usize,
    pub max_file_bytes: usize,
    pub max_entries: usize,
}

impl Default for StructureOptions {
    fn default() -> Self {
        Self {
            include_contents: true,
            content_depth: 1,
            max_file_bytes: 8 * 1024,
            max_entries: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub path: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Member names when the entry is a listable archive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoListing {
    pub root: String,
    pub entries: Vec<ListingEntry>,
    /// True when `max_entries` cut the walk short.
    pub truncated: bool,
}

impl RepoListing {
    pub fn entry(&self, path: &str) -> Option<&ListingEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Compact text form used inside prompts.
    pub fn render(&self) -> String {
        let mut out = format!("{}/\n", self.root);
        for e in &self.entries {
            let _ = writeln!(out, "  {} ({} bytes)", e.path, e.size);
            if let Some(members) = &e.members {
                for m in members {
                    let _ = writeln!(out, "    - {m}");
                }
            }
        }
        if self.truncated {
            out.push_str("  ... (listing truncated)\n");
        }
        out
    }
}

/// Walk `root` and describe its contents.
///
/// Fails with [`ArtifactError::Archive`] when a source archive cannot be read.
pub fn extract_structure(
    root: &Path,
    opts: &StructureOptions,
) -> Result<RepoListing, ArtifactError> {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map_or(true, |n| !EXCLUDED_NAMES.contains(&n))
        })
        .build();

    let mut entries = Vec::new();
    let mut truncated = false;

    for entry in walker {
        let entry = entry
            .map_err(|e| ArtifactError::io(root, std::io::Error::other(e.to_string())))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if entries.len() >= opts.max_entries {
            truncated = true;
            break;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        let size = path.metadata().map_err(|e| ArtifactError::io(path, e))?.len();

        let (content, members) = if is_archive(&rel) {
            (None, list_archive(path)?)
        } else if opts.include_contents && entry.depth() <= opts.content_depth {
            (read_text(path, opts.max_file_bytes)?, None)
        } else {
            (None, None)
        };

        entries.push(ListingEntry {
            path: rel,
            size,
            content,
            members,
        });
    }

    Ok(RepoListing {
        root: root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        entries,
        truncated,
    })
}

/// Text content truncated to `max_bytes`; `None` for binary files.
fn read_text(path: &Path, max_bytes: usize) -> Result<Option<String>, ArtifactError> {
    let bytes = std::fs::read(path).map_err(|e| ArtifactError::io(path, e))?;
    if bytes.contains(&0) {
        return Ok(None);
    }
    let Ok(text) = String::from_utf8(bytes) else {
        return Ok(None);
    };
    Ok(Some(truncate_text(&text, max_bytes)))
}

pub fn truncate_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &text[..cut])
}

/// Zip archives are listed member by member. Compressed tarballs are only
/// checked for a valid magic number; their members are not listed.
fn list_archive(path: &Path) -> Result<Option<Vec<String>>, ArtifactError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let archive_err = |message: String| ArtifactError::Archive {
        path: path.to_path_buf(),
        message,
    };

    if name.ends_with(".zip") {
        let file = File::open(path).map_err(|e| ArtifactError::io(path, e))?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| archive_err(e.to_string()))?;
        let mut members = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let member = zip.by_index(i).map_err(|e| archive_err(e.to_string()))?;
            members.push(member.name().to_string());
        }
        return Ok(Some(members));
    }

    let mut magic = [0u8; 6];
    let mut file = File::open(path).map_err(|e| ArtifactError::io(path, e))?;
    let n = file.read(&mut magic).map_err(|e| ArtifactError::io(path, e))?;
    let magic = &magic[..n];

    let ok = if name.ends_with(".gz") || name.ends_with(".tgz") {
        magic.starts_with(&[0x1f, 0x8b])
    } else if name.ends_with(".xz") || name.ends_with(".txz") {
        magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00])
    } else if name.ends_with(".bz2") || name.ends_with(".tbz") {
        magic.starts_with(b"BZh")
    } else {
        true
    };

    if ok {
        Ok(None)
    } else {
        Err(archive_err("bad magic number for archive type".into()))
    }
}
