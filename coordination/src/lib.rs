//! Deterministic core for cross-ISA package repair.
//!
//! This library provides the model-free half of the repair loop:
//! - Package discovery and a staged, single-writer working copy
//! - Strict unified-diff application and modification history
//! - Repository structure extraction for the model's query tools
//! - The remote build-service boundary and a bounded upload/poll submitter
//!
//! # Modules
//!
//! ## Artifacts
//! - [`package`]: `Package`, `IsaPair`, directory discovery
//! - [`artifact`]: `ArtifactStore`, `RepairAction`, `ModificationRecord`
//! - [`archive`]: unpack/repack of tar.gz, tar.xz, tar.bz2 and zip sources
//! - [`patch`]: `---`/`+++`/`@@` parser and exact hunk application
//! - [`structure`]: `extract_structure` listing with truncated contents
//!
//! ## Build validation
//! - [`verdict`]: `BuildVerdict`, `RemoteStatus`
//! - [`build_service`]: `BuildService` trait, OBS client, `BuildSubmitter`
//! - [`fakes`]: scripted in-memory `BuildService` for tests

#![allow(clippy::uninlined_format_args)]

pub mod archive;
pub mod artifact;
pub mod build_service;
pub mod error;
pub mod fakes;
pub mod package;
pub mod patch;
pub mod structure;
pub mod verdict;

pub use artifact::{ArtifactStore, ModificationRecord, RepairAction};
pub use build_service::{
    BuildService, BuildSubmitter, ObsClient, ObsConfig, SubmissionHandle, SubmissionPermits,
    SubmitterConfig,
};
pub use error::{ArtifactError, ServiceError};
pub use package::{discover_packages, IsaPair, Package};
pub use structure::{extract_structure, ListingEntry, RepoListing, StructureOptions};
pub use verdict::{BuildVerdict, RemoteStatus};
