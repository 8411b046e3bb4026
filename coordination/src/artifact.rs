//! Working copy of a package under repair.
//!
//! [`ArtifactStore::stage`] copies the package directory into a private work
//! root and unpacks its source archive under `extracted/`. From then on the
//! only mutation path is [`ArtifactStore::apply`], which takes exactly one
//! [`RepairAction`]. The set of known files is fixed at staging time: actions
//! can rewrite or patch existing files but never create or delete them.
//!
//! Only files that reach the build service are editable: top-level text files,
//! which are uploaded as they are, and files under `extracted/`, which are
//! repacked into the source archive after every edit.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::archive::{self, EXTRACT_DIR};
use crate::error::ArtifactError;
use crate::package::{is_archive, Package};
use crate::patch::{apply_hunks, parse_patch};

/// A single model-proposed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairAction {
    FullFileRewrite { path: String, content: String },
    Patch { path: String, diff: String },
}

impl RepairAction {
    pub fn path(&self) -> &str {
        match self {
            Self::FullFileRewrite { path, .. } | Self::Patch { path, .. } => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::FullFileRewrite { .. } => "full_file_rewrite",
            Self::Patch { .. } => "patch",
        }
    }
}

/// Record of one applied action, kept for later prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub path: String,
    /// Unified diff from the previous content to the new content.
    pub diff: String,
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
}

const NOT_KNOWN: &str = "not a file in the package";
const ARCHIVE_TARGET: &str = "source archives are rebuilt from extracted/, edit the files there";
const NOT_UPLOADED: &str = "only top-level files and files under extracted/ reach the build";
const NOT_TEXT: &str = "not a UTF-8 text file";

pub struct ArtifactStore {
    package: Package,
    root: PathBuf,
    known: BTreeSet<String>,
    /// Archive rebuilt from `extracted/`, when one was unpacked at staging.
    repacked: Option<String>,
    revision: u64,
    modifications: Vec<ModificationRecord>,
}

impl ArtifactStore {
    /// Copy `package.source_dir` into `<work_root>/<package.id>`, unpack the
    /// source archive and index everything.
    ///
    /// Any previous working copy at that location is discarded. An archive
    /// that cannot be unpacked fails staging with [`ArtifactError::Archive`].
    pub fn stage(package: Package, work_root: &Path) -> Result<Self, ArtifactError> {
        let root = work_root.join(&package.id);
        if root.exists() {
            fs::remove_dir_all(&root).map_err(|e| ArtifactError::io(&root, e))?;
        }
        fs::create_dir_all(&root).map_err(|e| ArtifactError::io(&root, e))?;

        let walker = WalkBuilder::new(&package.source_dir)
            .standard_filters(false)
            .build();

        let mut known = BTreeSet::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                ArtifactError::io(&package.source_dir, std::io::Error::other(e.to_string()))
            })?;
            let src = entry.path();
            let Ok(rel) = src.strip_prefix(&package.source_dir) else {
                continue;
            };
            if rel.as_os_str().is_empty() {
                continue;
            }
            let dest = root.join(rel);
            if src.is_dir() {
                fs::create_dir_all(&dest).map_err(|e| ArtifactError::io(&dest, e))?;
            } else if src.is_file() {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| ArtifactError::io(parent, e))?;
                }
                fs::copy(src, &dest).map_err(|e| ArtifactError::io(src, e))?;
                known.insert(rel_key(rel));
            }
        }

        let repacked = match package.source_archive.as_deref() {
            Some(name) if archive::ArchiveFormat::from_name(name).is_some() => {
                let dest = root.join(EXTRACT_DIR);
                if dest.exists() {
                    fs::remove_dir_all(&dest).map_err(|e| ArtifactError::io(&dest, e))?;
                }
                known.retain(|k| !in_extract_dir(k));
                archive::unpack(&root.join(name), &dest)?;
                index_tree(&root, &dest, &mut known)?;
                Some(name.to_string())
            }
            _ => None,
        };

        info!(
            package = %package.id,
            files = known.len(),
            extracted = repacked.is_some(),
            root = %root.display(),
            "staged working copy"
        );

        Ok(Self {
            package,
            root,
            known,
            repacked,
            revision: 0,
            modifications: Vec::new(),
        })
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn known_files(&self) -> &BTreeSet<String> {
        &self.known
    }

    /// Bumped once per applied action.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn modifications(&self) -> &[ModificationRecord] {
        &self.modifications
    }

    /// Normalized key if `path` names a known file.
    pub fn resolve(&self, path: &str) -> Option<String> {
        let key = normalize(path)?;
        self.known.contains(&key).then_some(key)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.resolve(path).is_some()
    }

    /// Key of a known file that actions may change.
    pub fn editable(&self, path: &str) -> Result<String, ArtifactError> {
        let key = self
            .resolve(path)
            .ok_or_else(|| ArtifactError::invalid_target(path, NOT_KNOWN))?;
        if is_archive(&key) {
            return Err(ArtifactError::invalid_target(key, ARCHIVE_TARGET));
        }
        let repackable = self.repacked.is_some() && in_extract_dir(&key);
        if key.contains('/') && !repackable {
            return Err(ArtifactError::invalid_target(key, NOT_UPLOADED));
        }
        Ok(key)
    }

    /// Current content of a known file. Invalid UTF-8 is replaced.
    pub fn read(&self, path: &str) -> Result<String, ArtifactError> {
        let key = self
            .resolve(path)
            .ok_or_else(|| ArtifactError::invalid_target(path, NOT_KNOWN))?;
        let abs = self.root.join(&key);
        let bytes = fs::read(&abs).map_err(|e| ArtifactError::io(&abs, e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Text of the initial failure log, if the package shipped one.
    pub fn initial_log(&self) -> Result<Option<String>, ArtifactError> {
        match self.package.initial_log.as_deref() {
            Some(name) if self.contains(name) => self.read(name).map(Some),
            _ => Ok(None),
        }
    }

    /// Apply one action. On error the working copy is unchanged.
    ///
    /// An edit under `extracted/` also rebuilds the source archive.
    pub fn apply(&mut self, action: &RepairAction) -> Result<ModificationRecord, ArtifactError> {
        let key = self.editable(action.path())?;
        let abs = self.root.join(&key);
        let bytes = fs::read(&abs).map_err(|e| ArtifactError::io(&abs, e))?;
        let old = String::from_utf8(bytes)
            .map_err(|_| ArtifactError::invalid_target(key.as_str(), NOT_TEXT))?;

        let new = match action {
            RepairAction::FullFileRewrite { content, .. } => content.clone(),
            RepairAction::Patch { diff, .. } => self.patched_content(&key, &old, diff)?,
        };

        fs::write(&abs, &new).map_err(|e| ArtifactError::io(&abs, e))?;
        if in_extract_dir(&key) {
            if let Err(err) = self.repack() {
                fs::write(&abs, &old).map_err(|e| ArtifactError::io(&abs, e))?;
                return Err(err);
            }
        }
        self.revision += 1;

        let record = ModificationRecord {
            diff: render_diff(&key, &old, &new),
            path: key,
            revision: self.revision,
            timestamp: Utc::now(),
        };
        debug!(
            package = %self.package.id,
            path = %record.path,
            kind = action.kind(),
            revision = self.revision,
            "applied repair action"
        );
        self.modifications.push(record.clone());
        Ok(record)
    }

    fn patched_content(&self, key: &str, old: &str, diff: &str) -> Result<String, ArtifactError> {
        let rejected = |source| ArtifactError::PatchRejected {
            path: key.to_string(),
            source,
        };
        let blocks = parse_patch(diff).map_err(rejected)?;

        let mut content = old.to_string();
        for block in &blocks {
            if block.is_creation() || block.is_deletion() {
                return Err(ArtifactError::invalid_target(
                    block.target().unwrap_or("/dev/null"),
                    "patches cannot create or delete files",
                ));
            }
            let target = block.target().unwrap_or_default();
            // Headerless diffs bind to the action's own path.
            if !target.is_empty() && normalize(target).as_deref() != Some(key) {
                return Err(ArtifactError::invalid_target(
                    target,
                    "diff names a different file than the action",
                ));
            }
            content = apply_hunks(&content, &block.hunks)
                .map_err(rejected)?
                .patched;
        }
        Ok(content)
    }

    /// Rebuild the source archive from `extracted/`. A no-op for packages
    /// without an unpacked archive.
    pub fn repack(&self) -> Result<(), ArtifactError> {
        let Some(name) = &self.repacked else {
            return Ok(());
        };
        archive::pack(&self.root.join(EXTRACT_DIR), &self.root.join(name))
    }

    /// Content digest over the upload set; equal digests mean an identical
    /// upload.
    pub fn digest(&self) -> Result<String, ArtifactError> {
        let mut hasher = blake3::Hasher::new();
        for key in self.upload_set() {
            let abs = self.root.join(&key);
            let bytes = fs::read(&abs).map_err(|e| ArtifactError::io(&abs, e))?;
            hasher.update(key.as_bytes());
            hasher.update(&[0]);
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Files at the top level of the working copy, which is what the build
    /// service receives.
    pub fn upload_set(&self) -> Vec<String> {
        self.known
            .iter()
            .filter(|k| !k.contains('/'))
            .cloned()
            .collect()
    }
}

fn in_extract_dir(key: &str) -> bool {
    key.strip_prefix(EXTRACT_DIR)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Add every file under `dir` to `known`, keyed relative to `root`.
fn index_tree(root: &Path, dir: &Path, known: &mut BTreeSet<String>) -> Result<(), ArtifactError> {
    let walker = WalkBuilder::new(dir).standard_filters(false).build();
    for entry in walker {
        let entry =
            entry.map_err(|e| ArtifactError::io(dir, std::io::Error::other(e.to_string())))?;
        if !entry.path().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            known.insert(rel_key(rel));
        }
    }
    Ok(())
}

fn rel_key(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalize a model-supplied relative path. Absolute paths and `..` never
/// resolve.
fn normalize(path: &str) -> Option<String> {
    let trimmed = path.trim();
    let p = Path::new(trimmed);
    let mut parts = Vec::new();
    for c in p.components() {
        match c {
            Component::Normal(s) => parts.push(s.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn render_diff(path: &str, old: &str, new: &str) -> String {
    let diff = similar::TextDiff::from_lines(old, new);
    let mut out = format!("--- a/{path}\n+++ b/{path}\n");
    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        out.push_str(&hunk.to_string());
    }
    out
}
