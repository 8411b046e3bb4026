//! Prompt text for the repair model.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever preamble content changes
//! so transcripts can be grouped by the prompt that produced them.

use std::fmt::Write as _;

use repair_coordination::IsaPair;

use crate::session::FailureContext;
use crate::tools::{RepairStrategy, EXTRACT_STRUCTURE, READ_FILE};

pub const PROMPT_VERSION: &str = "1.3.0";

/// System preamble for one session.
pub fn system_prompt(package: &str, isa: &IsaPair, strategy: RepairStrategy) -> String {
    let action = match strategy {
        RepairStrategy::FullFile => {
            "Call `write_file` with the path of ONE existing file and its complete new content. \
             Never elide unchanged parts of the file."
        }
        RepairStrategy::Patch => {
            "Call `apply_patch` with the path of ONE existing file and a unified diff for it. \
             Hunk headers need line ranges and context lines must match the file exactly."
        }
    };
    format!(
        "\
You are a build engineer porting Linux distribution packages between CPU architectures.

Package `{package}` builds on {source} but fails to build for {target}. Your job is to \
find the cause in the build log and fix the package sources so that it builds for {target}.

## Tools
- `{EXTRACT_STRUCTURE}`: list the package files (spec file, patches, unpacked sources).
- `{READ_FILE}`: read one package file.
- {action}

Each repair action is built on the remote build service automatically. You will see the \
new build log if it still fails. Only one file can change per attempt.

## Rules
- Only modify files that already exist in the package. Never create or delete files.
- Editable files are the top-level package files and the upstream sources unpacked \
  under `extracted/`. Edits there are packed back into the source archive for you; \
  never write the archive itself.
- Prefer minimal, architecture-conditional fixes in the spec file (`%ifarch`, \
  `ExclusiveArch`, `BuildRequires`) or in existing patches.
- Do not disable the test suite or the whole build to make it pass.
- Include a one or two sentence `diagnosis` with every action.",
        source = isa.source,
        target = isa.target,
    )
}

/// Render the per-iteration user turn.
pub fn render_context(ctx: &FailureContext) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Please analyze and repair package `{}` (attempt {}/{}).",
        ctx.package,
        ctx.iteration + 1,
        ctx.max_iterations
    );

    if !ctx.previous_modifications.is_empty() {
        let _ = writeln!(out, "\n## Previous modifications");
        for m in &ctx.previous_modifications {
            let _ = writeln!(out, "### {} (attempt {})", m.path, m.revision);
            let _ = writeln!(out, "```diff\n{}```", m.diff);
        }
        let _ = writeln!(
            out,
            "After {} attempt(s) the build still fails. Analyze the previous modifications \
             and the new log, then provide a new repair.",
            ctx.iteration
        );
    }

    if let Some(diagnosis) = &ctx.prior_diagnosis {
        let _ = writeln!(out, "\n## Your previous diagnosis\n{diagnosis}");
    }

    let _ = writeln!(out, "\n## Build log (tail)\n```\n{}\n```", ctx.build_log_excerpt);
    let _ = writeln!(out, "\n## Package files\n{}", ctx.repo_listing.render());
    out
}

/// Sent back when a reply contained neither a usable tool call nor an action.
pub fn clarification_nudge(strategy: RepairStrategy) -> String {
    format!(
        "Your reply could not be used. Respond with exactly one tool call: either a query \
         tool or `{}` with valid JSON arguments.",
        strategy.action_tool()
    )
}

/// Sent once the tool-round budget for an iteration is spent.
pub fn tool_budget_spent(strategy: RepairStrategy) -> String {
    format!(
        "You have used all information-gathering calls for this attempt. Call `{}` now.",
        strategy.action_tool()
    )
}

pub fn repeat_blocked(tool: &str) -> String {
    format!(
        "Do not call {tool} again with the same arguments in this attempt. \
         Continue with a repair or other tools."
    )
}

pub fn tool_result(name: &str, output: &str) -> String {
    format!("Result of `{name}`:\n{output}")
}
