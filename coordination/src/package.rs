//! Package identity and discovery.
//!
//! A package is a directory holding a build spec (`*.spec`), usually a source
//! archive, and optionally the log of the failed cross-ISA build that started
//! the repair. Identity is immutable; content lives in the
//! [`ArtifactStore`](crate::artifact::ArtifactStore) once staged.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::archive::ArchiveFormat;
use crate::error::ArtifactError;

/// File name the build service's failure log is saved under.
pub const FAILED_LOG_NAME: &str = "log_failed.txt";

/// Source and target instruction-set architectures for one repair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsaPair {
    pub source: String,
    pub target: String,
}

impl IsaPair {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl Default for IsaPair {
    fn default() -> Self {
        Self::new("x86_64", "riscv64")
    }
}

impl fmt::Display for IsaPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

impl FromStr for IsaPair {
    type Err = String;

    /// Accepts `source:target` or `source->target`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, target) = s
            .split_once("->")
            .or_else(|| s.split_once(':'))
            .ok_or_else(|| format!("expected `source:target`, got `{s}`"))?;
        let (source, target) = (source.trim(), target.trim());
        if source.is_empty() || target.is_empty() {
            return Err(format!("empty ISA in `{s}`"));
        }
        Ok(Self::new(source, target))
    }
}

/// A package under repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Directory name; also the package name on the build service.
    pub id: String,
    /// Original package directory. Never mutated.
    pub source_dir: PathBuf,
    /// Source archive, relative to the package root.
    pub source_archive: Option<String>,
    /// Build spec file, relative to the package root.
    pub build_spec: String,
    /// Failure log from the initial cross build, relative to the package root.
    pub initial_log: Option<String>,
    pub isa: IsaPair,
}

impl Package {
    /// Inspect `dir` and build a package description from what it contains.
    pub fn discover(dir: &Path, isa: IsaPair) -> Result<Self, ArtifactError> {
        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ArtifactError::io(
                    dir,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "no directory name"),
                )
            })?;

        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| ArtifactError::io(dir, e))? {
            let entry = entry.map_err(|e| ArtifactError::io(dir, e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| ArtifactError::io(entry.path(), e))?
                .is_file();
            if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();

        let build_spec = names
            .iter()
            .find(|n| n.ends_with(".spec"))
            .cloned()
            .ok_or_else(|| ArtifactError::MissingSpec(dir.to_path_buf()))?;

        let source_archive = names.iter().find(|n| is_archive(n)).cloned();

        let initial_log = if names.iter().any(|n| n == FAILED_LOG_NAME) {
            Some(FAILED_LOG_NAME.to_string())
        } else {
            names.iter().find(|n| n.ends_with(".log")).cloned()
        };

        Ok(Self {
            id,
            source_dir: dir.to_path_buf(),
            source_archive,
            build_spec,
            initial_log,
            isa,
        })
    }
}

/// Whether `name` carries one of the recognised archive suffixes.
pub fn is_archive(name: &str) -> bool {
    ArchiveFormat::from_name(name).is_some()
}

/// List candidate package directories under `base_dir`, sorted by name.
pub fn discover_packages(base_dir: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(base_dir).map_err(|e| ArtifactError::io(base_dir, e))? {
        let entry = entry.map_err(|e| ArtifactError::io(base_dir, e))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
