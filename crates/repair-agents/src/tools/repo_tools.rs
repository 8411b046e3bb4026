//! Read-only tools over the staged package: structure listing and file reads.

use repair_coordination::structure::truncate_text;
use repair_coordination::{extract_structure, ArtifactStore, StructureOptions};
use serde::Deserialize;

use super::{Tool, ToolError, EXTRACT_STRUCTURE, READ_FILE};
use crate::model::ToolDefinition;

// ---------------------------------------------------------------------------
// ExtractStructureTool
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ExtractStructureArgs {
    /// Override for including file contents in the listing.
    pub include_contents: Option<bool>,
}

pub struct ExtractStructureTool {
    pub options: StructureOptions,
}

impl Tool for ExtractStructureTool {
    const NAME: &'static str = EXTRACT_STRUCTURE;
    type Args = ExtractStructureArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.into(),
            description: "List the files of the package (spec file, sources, patches, \
                          archive members) with sizes and truncated text contents."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "include_contents": {
                        "type": "boolean",
                        "description": "Include truncated file contents (default true)"
                    }
                }
            }),
        }
    }

    fn call(&self, store: &ArtifactStore, args: Self::Args) -> Result<String, ToolError> {
        let mut options = self.options.clone();
        if let Some(include) = args.include_contents {
            options.include_contents = include;
        }
        let listing = extract_structure(store.root(), &options)?;
        serde_json::to_string_pretty(&listing).map_err(|e| ToolError::InvalidArgs {
            tool: Self::NAME.into(),
            message: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// ReadFileTool
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ReadFileArgs {
    /// Path relative to the package root.
    pub path: String,
    /// First line to read (1-indexed, inclusive).
    pub start_line: Option<u32>,
    /// Last line to read (1-indexed, inclusive).
    pub end_line: Option<u32>,
}

/// Read one staged file, truncated to `max_output_chars`.
pub struct ReadFileTool {
    pub max_output_chars: usize,
}

impl Tool for ReadFileTool {
    const NAME: &'static str = READ_FILE;
    type Args = ReadFileArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.into(),
            description: "Read one file of the package. Use start_line/end_line for large files."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the package root"
                    },
                    "start_line": {
                        "type": "integer",
                        "description": "First line to read (1-indexed, inclusive)"
                    },
                    "end_line": {
                        "type": "integer",
                        "description": "Last line to read (1-indexed, inclusive)"
                    }
                },
                "required": ["path"]
            }),
        }
    }

    fn call(&self, store: &ArtifactStore, args: Self::Args) -> Result<String, ToolError> {
        let content = store.read(&args.path)?;

        let content = if args.start_line.is_some() || args.end_line.is_some() {
            let lines: Vec<&str> = content.lines().collect();
            let total = lines.len();
            let start = args
                .start_line
                .map(|n| (n as usize).saturating_sub(1))
                .unwrap_or(0)
                .min(total);
            let end = args.end_line.map(|n| (n as usize).min(total)).unwrap_or(total);
            if start >= end {
                return Ok(format!(
                    "[Empty range: start_line={} end_line={end} total_lines={total}]",
                    start + 1
                ));
            }
            let mut out = format!("[Lines {}-{end} of {total} total]\n", start + 1);
            for (i, l) in lines[start..end].iter().enumerate() {
                out.push_str(&format!("{:>5} | {l}\n", start + i + 1));
            }
            out
        } else {
            content
        };

        Ok(truncate_text(&content, self.max_output_chars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repair_coordination::{ArtifactError, IsaPair, Package};
    use std::fs;

    fn store_with(content: &str) -> (tempfile::TempDir, ArtifactStore) {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = tmp.path().join("in").join("pkg");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("pkg.spec"), content).unwrap();
        let package = Package::discover(&pkg, IsaPair::default()).unwrap();
        let store = ArtifactStore::stage(package, &tmp.path().join("work")).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_read_file_line_range() {
        let (_tmp, store) = store_with("a\nb\nc\nd\n");
        let tool = ReadFileTool {
            max_output_chars: 1000,
        };
        let out = tool
            .call(
                &store,
                ReadFileArgs {
                    path: "pkg.spec".into(),
                    start_line: Some(2),
                    end_line: Some(3),
                },
            )
            .unwrap();
        assert_eq!(out, "[Lines 2-3 of 4 total]\n    2 | b\n    3 | c\n");
    }

    #[test]
    fn test_read_file_truncates() {
        let (_tmp, store) = store_with(&"y".repeat(50));
        let tool = ReadFileTool {
            max_output_chars: 8,
        };
        let out = tool
            .call(
                &store,
                ReadFileArgs {
                    path: "pkg.spec".into(),
                    start_line: None,
                    end_line: None,
                },
            )
            .unwrap();
        assert!(out.starts_with("yyyyyyyy\n..."));
    }

    #[test]
    fn test_read_unknown_file_is_invalid_target() {
        let (_tmp, store) = store_with("x");
        let tool = ReadFileTool {
            max_output_chars: 100,
        };
        let err = tool
            .call(
                &store,
                ReadFileArgs {
                    path: "../../etc/passwd".into(),
                    start_line: None,
                    end_line: None,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ToolError::Artifact(ArtifactError::InvalidTarget { .. })
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_structure_without_contents() {
        let (_tmp, store) = store_with("Name: pkg\n");
        let tool = ExtractStructureTool {
            options: StructureOptions::default(),
        };
        let out = tool
            .call(
                &store,
                ExtractStructureArgs {
                    include_contents: Some(false),
                },
            )
            .unwrap();
        assert!(out.contains("pkg.spec"));
        assert!(!out.contains("Name: pkg"));
    }
}
