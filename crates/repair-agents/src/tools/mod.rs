//! Tools the model can call, and the registry that exposes them.
//!
//! Query tools (`extract_structure`, `read_file`) run against the staged
//! working copy and never mutate it. The action tool (`write_file` or
//! `apply_patch`, depending on strategy) is not executed here: the
//! coordinator turns it into a `RepairAction` for the session to apply.
//! Uploading and polling are driven by the session through `BuildSubmitter`;
//! a model asking for them gets `NotModelCallable`.

pub mod guard;
pub mod repo_tools;

use std::fmt;
use std::str::FromStr;

use repair_coordination::{
    extract_structure, ArtifactError, ArtifactStore, RepoListing, StructureOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ToolDefinition;
pub use guard::{call_key, GuardDecision, ToolCallGuard};
pub use repo_tools::{ExtractStructureTool, ReadFileTool};

pub const EXTRACT_STRUCTURE: &str = "extract_structure";
pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const APPLY_PATCH: &str = "apply_patch";
pub const UPLOAD_FILES: &str = "upload_files";
pub const CHECK_BUILD_RESULT: &str = "check_build_result";

/// Errors that can occur during tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),

    #[error("invalid arguments for `{tool}`: {message}")]
    InvalidArgs { tool: String, message: String },

    #[error("`{0}` runs automatically after each repair action; propose a fix instead")]
    NotModelCallable(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

impl ToolError {
    /// Only artifact failures that leave the package unusable are fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Artifact(e) if e.is_fatal())
    }
}

/// How the model is asked to express its fix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepairStrategy {
    #[default]
    FullFile,
    Patch,
}

impl RepairStrategy {
    pub fn action_tool(self) -> &'static str {
        match self {
            Self::FullFile => WRITE_FILE,
            Self::Patch => APPLY_PATCH,
        }
    }
}

impl fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullFile => write!(f, "full-file"),
            Self::Patch => write!(f, "patch"),
        }
    }
}

impl FromStr for RepairStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full-file" | "full_file" | "rewrite" => Ok(Self::FullFile),
            "patch" | "diff" => Ok(Self::Patch),
            other => Err(format!("unknown repair strategy `{other}`")),
        }
    }
}

/// A read-only tool over the staged working copy.
pub trait Tool {
    const NAME: &'static str;
    type Args: DeserializeOwned;

    fn definition(&self) -> ToolDefinition;

    fn call(&self, store: &ArtifactStore, args: Self::Args) -> Result<String, ToolError>;
}

fn invoke<T: Tool>(tool: &T, store: &ArtifactStore, args: &Value) -> Result<String, ToolError> {
    // Models often send `null` or nothing for argument-less tools.
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args.clone()
    };
    let parsed = serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs {
        tool: T::NAME.to_string(),
        message: e.to_string(),
    })?;
    tool.call(store, parsed)
}

pub struct ToolRegistry {
    strategy: RepairStrategy,
    structure: ExtractStructureTool,
    read_file: ReadFileTool,
}

impl ToolRegistry {
    pub fn new(strategy: RepairStrategy, structure: StructureOptions) -> Self {
        let read_file = ReadFileTool {
            max_output_chars: structure.max_file_bytes,
        };
        Self {
            strategy,
            structure: ExtractStructureTool { options: structure },
            read_file,
        }
    }

    pub fn strategy(&self) -> RepairStrategy {
        self.strategy
    }

    pub fn structure_options(&self) -> &StructureOptions {
        &self.structure.options
    }

    /// Tool schemas offered to the model. Query tools are withdrawn once the
    /// tool-round budget is spent.
    pub fn definitions(&self, with_query_tools: bool) -> Vec<ToolDefinition> {
        let mut defs = Vec::with_capacity(3);
        if with_query_tools {
            defs.push(self.structure.definition());
            defs.push(self.read_file.definition());
        }
        defs.push(action_definition(self.strategy));
        defs
    }

    pub fn is_query_tool(name: &str) -> bool {
        matches!(name, EXTRACT_STRUCTURE | READ_FILE)
    }

    /// Run a model-requested query tool.
    pub fn execute(
        &self,
        store: &ArtifactStore,
        name: &str,
        args: &Value,
    ) -> Result<String, ToolError> {
        match name {
            EXTRACT_STRUCTURE => invoke(&self.structure, store, args),
            READ_FILE => invoke(&self.read_file, store, args),
            UPLOAD_FILES | CHECK_BUILD_RESULT => Err(ToolError::NotModelCallable(name.into())),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    /// Repository listing of the current working copy.
    pub fn extract_structure(&self, store: &ArtifactStore) -> Result<RepoListing, ArtifactError> {
        extract_structure(store.root(), &self.structure.options)
    }
}

fn action_definition(strategy: RepairStrategy) -> ToolDefinition {
    let diagnosis = serde_json::json!({
        "type": "string",
        "description": "One or two sentences on why the build fails for the target ISA"
    });
    match strategy {
        RepairStrategy::FullFile => ToolDefinition {
            name: WRITE_FILE.into(),
            description: "Replace the entire content of one existing file in the package. \
                          Only one file can be changed per attempt."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the package root, either a top-level \
                                        file (foo.spec) or a source file under extracted/"
                    },
                    "content": {
                        "type": "string",
                        "description": "Complete new file content"
                    },
                    "diagnosis": diagnosis
                },
                "required": ["path", "content"]
            }),
        },
        RepairStrategy::Patch => ToolDefinition {
            name: APPLY_PATCH.into(),
            description: "Apply a unified diff to one existing file in the package. \
                          Hunk headers must carry line ranges (@@ -41,11 +41,16 @@) and \
                          context lines must match the file exactly."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the package root (foo.spec or extracted/...)"
                    },
                    "diff": {
                        "type": "string",
                        "description": "Unified diff (git diff / diff -u format) for that file only"
                    },
                    "diagnosis": diagnosis
                },
                "required": ["path", "diff"]
            }),
        },
    }
}

/// Arguments of the action tools, shared with the coordinator's parser.
#[derive(Debug, Deserialize)]
pub(crate) struct ActionArgs {
    pub path: String,
    pub content: Option<String>,
    pub diff: Option<String>,
    pub diagnosis: Option<String>,
}
