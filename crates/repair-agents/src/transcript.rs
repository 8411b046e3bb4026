//! Persisted session transcripts.
//!
//! A transcript is the audit trail of one repair session: one record per
//! completed iteration, in order, plus the state-machine transition log and
//! the final status. Records are only ever appended.
//!
//! Two sinks are written per session:
//! - `<result_dir>/<package>_result.json`: the full transcript (pretty JSON);
//! - `<result_dir>/transcripts.jsonl`: one summary line per session.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use repair_coordination::{BuildVerdict, IsaPair, RepairAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::model::Usage;
use crate::session::FailureContext;
use crate::state_machine::TransitionRecord;
use crate::tools::RepairStrategy;

pub const JSONL_NAME: &str = "transcripts.jsonl";

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Succeeded,
    /// Iteration budget exhausted.
    Failed,
    /// Tooling broke or the session was cancelled.
    Aborted {
        cause: String,
        category: String,
    },
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// A query tool the model called during an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub args: Value,
    /// True when the repeat guard refused to run it.
    #[serde(default)]
    pub blocked: bool,
}

/// One completed Diagnosing → Acting → Validating cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based.
    pub iteration: u32,
    pub context: FailureContext,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    pub action: RepairAction,
    pub diagnosis: Option<String>,
    /// As reported by the build service; a `Timeout` stays a `Timeout` here
    /// even though the loop treats it as a failure.
    pub verdict: BuildVerdict,
    /// 0 when the action was rejected before submission.
    pub submission_attempts: u32,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTranscript {
    pub session_id: Uuid,
    pub package: String,
    pub isa: IsaPair,
    pub strategy: RepairStrategy,
    pub model: String,
    pub prompt_version: String,
    pub max_iterations: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub iterations: Vec<IterationRecord>,
    pub transitions: Vec<TransitionRecord>,
    pub model_calls: u32,
    pub usage: Usage,
    pub uploads: u32,
}

/// The JSONL line written per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSummary {
    pub session_id: Uuid,
    pub package: String,
    pub isa: String,
    pub strategy: RepairStrategy,
    pub model: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub iterations: u32,
    pub verdicts: Vec<String>,
    pub model_calls: u32,
    pub elapsed_ms: i64,
}

impl SessionTranscript {
    pub fn new(
        package: &str,
        isa: IsaPair,
        strategy: RepairStrategy,
        model: String,
        max_iterations: u32,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            package: package.to_string(),
            isa,
            strategy,
            model,
            prompt_version: crate::prompts::PROMPT_VERSION.to_string(),
            max_iterations,
            started_at: Utc::now(),
            finished_at: None,
            status: SessionStatus::Running,
            iterations: Vec::new(),
            transitions: Vec::new(),
            model_calls: 0,
            usage: Usage::default(),
            uploads: 0,
        }
    }

    /// Completed iterations so far.
    pub fn iteration_count(&self) -> u32 {
        self.iterations.len() as u32
    }

    pub fn push(&mut self, record: IterationRecord) {
        debug_assert_eq!(record.iteration, self.iteration_count() + 1);
        self.iterations.push(record);
    }

    pub fn final_verdict(&self) -> Option<&BuildVerdict> {
        self.iterations.last().map(|r| &r.verdict)
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn summary(&self) -> TranscriptSummary {
        let cause = match &self.status {
            SessionStatus::Aborted { cause, .. } => Some(cause.clone()),
            _ => None,
        };
        let end = self.finished_at.unwrap_or_else(Utc::now);
        TranscriptSummary {
            session_id: self.session_id,
            package: self.package.clone(),
            isa: self.isa.to_string(),
            strategy: self.strategy,
            model: self.model.clone(),
            status: self.status.label().to_string(),
            cause,
            iterations: self.iteration_count(),
            verdicts: self
                .iterations
                .iter()
                .map(|r| r.verdict.label().to_string())
                .collect(),
            model_calls: self.model_calls,
            elapsed_ms: (end - self.started_at).num_milliseconds(),
        }
    }

    pub fn result_path(&self, result_dir: &Path) -> PathBuf {
        result_dir.join(format!("{}_result.json", self.package))
    }

    /// Write the full transcript and append the summary line.
    pub fn persist(&self, result_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(result_dir)
            .with_context(|| format!("creating {}", result_dir.display()))?;

        let path = self.result_path(result_dir);
        let json = serde_json::to_string_pretty(self).context("serializing transcript")?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;

        let jsonl = result_dir.join(JSONL_NAME);
        let line = serde_json::to_string(&self.summary()).context("serializing summary")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&jsonl)
            .with_context(|| format!("opening {}", jsonl.display()))?;
        writeln!(file, "{line}").with_context(|| format!("appending {}", jsonl.display()))?;

        info!(path = %path.display(), status = self.status.label(), "Wrote session transcript");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
