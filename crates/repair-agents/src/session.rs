//! One end-to-end repair attempt for one package.
//!
//! `RepairSession` owns everything it touches: the staged working copy, its
//! own model conversation, its own submitter state and the transcript. Sessions
//! share nothing mutable, so any number of them can run side by side.
//!
//! Loop, per iteration:
//! 1. **Diagnosing**: build a [`FailureContext`] from the latest build log and
//!    the current package listing, hand it to the coordinator.
//! 2. **Acting**: a tool request is served and fed back (back to Diagnosing,
//!    no iteration spent); a repair action is applied to the working copy.
//! 3. **Validating**: submit to the build service and read the verdict.
//!
//! Recoverable problems (unknown path, patch that does not apply, build
//! failure, timeout) become a recorded `Failure`-like iteration and the loop
//! continues. Fatal ones end the session as `Aborted`.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use repair_coordination::{
    ArtifactError, ArtifactStore, BuildSubmitter, BuildVerdict, ModificationRecord, RepairAction,
    RepoListing,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{CoordinatorConfig, ModelCoordinator, ModelResponse, TurnInput};
use crate::errors::RepairError;
use crate::model::ChatModel;
use crate::prompts;
use crate::state_machine::{SessionState, StateMachine};
use crate::tools::{call_key, GuardDecision, ToolCallGuard, ToolError, ToolRegistry};
use crate::transcript::{IterationRecord, SessionStatus, SessionTranscript, ToolCallRecord};

const NO_LOG: &str = "(no build log available; inspect the package to find the failure)";

/// Everything the model sees at the start of an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub package: String,
    /// Completed iterations before this one.
    pub iteration: u32,
    pub max_iterations: u32,
    /// Tail of the latest build log.
    pub build_log_excerpt: String,
    pub repo_listing: RepoListing,
    pub prior_diagnosis: Option<String>,
    #[serde(default)]
    pub previous_modifications: Vec<ModificationRecord>,
}

/// Keep the last `max_chars` bytes of a log, cut at a line boundary.
pub fn log_excerpt(log: &str, max_chars: usize) -> String {
    if log.len() <= max_chars {
        return log.to_string();
    }
    let mut start = log.len() - max_chars;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    let tail = &log[start..];
    let tail = match tail.find('\n') {
        Some(nl) if nl + 1 < tail.len() => &tail[nl + 1..],
        _ => tail,
    };
    format!("[... {} earlier bytes omitted]\n{tail}", log.len() - tail.len())
}

/// Limits for one session. Loaded as the `[session]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_iterations: u32,
    /// Clarification nudges per turn before the model counts as unavailable.
    pub clarification_retries: u32,
    /// Backoff retries for transport errors per model call.
    pub transient_retries: u32,
    /// Tool-call turns per iteration before query tools are withdrawn.
    pub max_tool_rounds: u32,
    /// Extra submissions after a `Timeout` or `ServiceError` verdict.
    pub submission_retries: u32,
    pub max_repeat_tool_calls: u32,
    pub log_excerpt_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            clarification_retries: 2,
            transient_retries: 3,
            max_tool_rounds: 20,
            submission_retries: 1,
            max_repeat_tool_calls: 3,
            log_excerpt_chars: 6000,
        }
    }
}

impl SessionConfig {
    pub fn coordinator(&self, temperature: f32) -> CoordinatorConfig {
        CoordinatorConfig {
            clarification_retries: self.clarification_retries,
            transient_retries: self.transient_retries,
            max_tool_rounds: self.max_tool_rounds,
            temperature,
        }
    }
}

pub struct RepairSession {
    store: ArtifactStore,
    registry: Arc<ToolRegistry>,
    coordinator: ModelCoordinator,
    submitter: BuildSubmitter,
    config: SessionConfig,
    machine: StateMachine,
    guard: ToolCallGuard,
    transcript: SessionTranscript,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<IterationRecord>>,
}

impl RepairSession {
    pub fn new(
        store: ArtifactStore,
        model: Arc<dyn ChatModel>,
        registry: Arc<ToolRegistry>,
        submitter: BuildSubmitter,
        config: SessionConfig,
        temperature: f32,
    ) -> Self {
        let package = store.package();
        let coordinator = ModelCoordinator::new(
            model.clone(),
            registry.clone(),
            config.coordinator(temperature),
            &package.id,
            &package.isa,
        );
        let transcript = SessionTranscript::new(
            &package.id,
            package.isa.clone(),
            registry.strategy(),
            model.model_name(),
            config.max_iterations,
        );
        Self {
            guard: ToolCallGuard::new(config.max_repeat_tool_calls),
            store,
            registry,
            coordinator,
            submitter,
            config,
            machine: StateMachine::new(),
            transcript,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Stop signal checked between states.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Receive each iteration record as soon as it is appended.
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<IterationRecord>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn package_id(&self) -> &str {
        &self.store.package().id
    }

    /// Drive the session to a terminal state and return its transcript.
    pub async fn run(mut self) -> SessionTranscript {
        let started = Instant::now();
        let package = self.package_id().to_string();
        info!(
            package = %package,
            isa = %self.store.package().isa,
            strategy = %self.registry.strategy(),
            max_iterations = self.config.max_iterations,
            "Repair session starting"
        );

        let status = match self.drive().await {
            Ok(status) => status,
            Err(err) => {
                error!(package = %package, error = %err, "Repair session aborted");
                if let Err(e) = self.machine.abort(&err.to_string()) {
                    warn!(package = %package, error = %e, "abort from terminal state");
                }
                SessionStatus::Aborted {
                    cause: err.to_string(),
                    category: err.retry_category().to_string(),
                }
            }
        };

        let t = &mut self.transcript;
        t.status = status;
        t.finished_at = Some(Utc::now());
        t.transitions = self.machine.transitions().to_vec();
        t.model_calls = self.coordinator.calls();
        t.usage = self.coordinator.usage();
        t.uploads = self.submitter.upload_count();

        info!(
            package = %package,
            status = t.status.label(),
            iterations = t.iteration_count(),
            model_calls = t.model_calls,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Repair session finished: {}",
            self.machine.summary()
        );
        self.transcript
    }

    fn step(&mut self, to: SessionState, reason: Option<&str>) -> Result<(), RepairError> {
        self.machine
            .advance(to, reason)
            .map_err(|e| RepairError::Internal(e.into()))
    }

    fn check_cancelled(&self) -> Result<(), RepairError> {
        if self.cancel.is_cancelled() {
            return Err(RepairError::Cancelled(format!(
                "stop requested in {}",
                self.machine.current()
            )));
        }
        Ok(())
    }

    async fn drive(&mut self) -> Result<SessionStatus, RepairError> {
        if self.config.max_iterations == 0 {
            return Err(RepairError::Configuration(
                "max_iterations must be at least 1".into(),
            ));
        }
        self.check_cancelled()?;
        let mut latest_log = self
            .store
            .initial_log()?
            .unwrap_or_else(|| NO_LOG.to_string());
        let mut prior_diagnosis: Option<String> = None;
        self.step(SessionState::Diagnosing, None)?;

        loop {
            let iteration = self.transcript.iteration_count() + 1;
            let iter_started = Instant::now();
            self.guard.reset();

            let context = FailureContext {
                package: self.package_id().to_string(),
                iteration: iteration - 1,
                max_iterations: self.config.max_iterations,
                build_log_excerpt: log_excerpt(&latest_log, self.config.log_excerpt_chars),
                repo_listing: self.registry.extract_structure(&self.store)?,
                prior_diagnosis: prior_diagnosis.clone(),
                previous_modifications: self.store.modifications().to_vec(),
            };

            let (action, diagnosis, tool_calls) =
                self.negotiate(TurnInput::Context(context.clone())).await?;

            self.check_cancelled()?;
            let (verdict, submission_attempts) = match self.store.apply(&action) {
                Ok(record) => {
                    debug!(path = %record.path, revision = record.revision, "action applied");
                    self.step(
                        SessionState::Validating,
                        Some(&format!("{} {}", action.kind(), action.path())),
                    )?;
                    self.validate().await?
                }
                Err(e) => (rejected_verdict(e)?, 0),
            };

            let record = IterationRecord {
                iteration,
                context,
                tool_calls,
                action,
                diagnosis: diagnosis.clone(),
                verdict: verdict.clone(),
                submission_attempts,
                elapsed_ms: iter_started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            };
            self.append(record);
            self.machine.set_iteration(iteration);

            info!(
                package = %self.package_id(),
                iteration,
                verdict = verdict.label(),
                attempts = submission_attempts,
                "Iteration complete"
            );

            match &verdict {
                BuildVerdict::Success => {
                    self.step(SessionState::Succeeded, Some("build passed"))?;
                    return Ok(SessionStatus::Succeeded);
                }
                BuildVerdict::ServiceError { reason, fatal: true } => {
                    return Err(RepairError::Service(
                        repair_coordination::ServiceError::Rejected(reason.clone()),
                    ));
                }
                _ => {}
            }

            if iteration >= self.config.max_iterations {
                let reason = RepairError::IterationLimitReached(iteration).to_string();
                self.step(SessionState::Failed, Some(&reason))?;
                return Ok(SessionStatus::Failed);
            }

            self.check_cancelled()?;
            self.step(SessionState::Diagnosing, Some(verdict.label()))?;
            latest_log = next_log(&verdict);
            prior_diagnosis = diagnosis;
        }
    }

    /// Run model turns until one yields a repair action. Tool requests are
    /// served in between and do not count as iterations.
    async fn negotiate(
        &mut self,
        first: TurnInput,
    ) -> Result<(RepairAction, Option<String>, Vec<ToolCallRecord>), RepairError> {
        let mut input = first;
        let mut tool_calls = Vec::new();
        loop {
            self.check_cancelled()?;
            let response = self.coordinator.next_turn(input).await?;
            self.step(SessionState::Acting, None)?;

            match response {
                ModelResponse::ProposedAction { action, diagnosis } => {
                    return Ok((action, diagnosis, tool_calls))
                }
                ModelResponse::ToolCallRequest { name, args } => {
                    let (output, blocked) = self.serve_tool(&name, &args)?;
                    tool_calls.push(ToolCallRecord {
                        name: name.clone(),
                        args,
                        blocked,
                    });
                    self.step(
                        SessionState::Diagnosing,
                        Some(&format!("tool call: {name}")),
                    )?;
                    input = TurnInput::ToolResult { name, output };
                }
                ModelResponse::Unparseable { .. } => {
                    return Err(RepairError::ModelUnavailable(
                        "coordinator surfaced an unparseable reply".into(),
                    ))
                }
            }
        }
    }

    /// Execute a query tool through the repeat guard and the per-revision
    /// cache. Returns the text for the model and whether the guard blocked it.
    fn serve_tool(&mut self, name: &str, args: &Value) -> Result<(String, bool), RepairError> {
        let key = call_key(name, args);
        if let GuardDecision::Blocked { count } = self.guard.check(&key) {
            warn!(package = %self.package_id(), tool = name, count, "repeated tool call blocked");
            return Ok((prompts::repeat_blocked(name), true));
        }

        let revision = self.store.revision();
        if let Some(hit) = self.guard.cached(&key, revision) {
            debug!(tool = name, "tool cache hit");
            return Ok((hit.to_string(), false));
        }

        match self.registry.execute(&self.store, name, args) {
            Ok(output) => {
                if ToolRegistry::is_query_tool(name) {
                    self.guard.remember(&key, revision, output.clone());
                }
                Ok((output, false))
            }
            Err(ToolError::Artifact(e)) if e.is_fatal() => Err(RepairError::Io(e)),
            Err(e) => {
                debug!(tool = name, error = %e, "tool error returned to model");
                Ok((format!("Error: {e}"), false))
            }
        }
    }

    /// Submit, resubmitting inconclusive verdicts up to the configured bound.
    /// The verdict of the last attempt is returned unchanged.
    async fn validate(&mut self) -> Result<(BuildVerdict, u32), RepairError> {
        let mut attempts = 0;
        loop {
            self.check_cancelled()?;
            attempts += 1;
            let verdict = self.submitter.submit(&self.store).await?;
            if verdict.is_inconclusive()
                && !verdict.is_fatal()
                && attempts <= self.config.submission_retries
            {
                warn!(
                    package = %self.package_id(),
                    attempt = attempts,
                    verdict = verdict.label(),
                    "inconclusive build verdict, resubmitting"
                );
                continue;
            }
            return Ok((verdict, attempts));
        }
    }

    fn append(&mut self, record: IterationRecord) {
        if let Some(tx) = &self.progress {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(record.clone());
        }
        self.transcript.push(record);
    }
}

/// Verdict recorded for an action that never reached the build service.
fn rejected_verdict(err: ArtifactError) -> Result<BuildVerdict, RepairError> {
    match err {
        err @ ArtifactError::InvalidTarget { .. } => {
            warn!(error = %err, "action targets a file it may not change");
            Ok(BuildVerdict::Failure {
                log: err.to_string(),
            })
        }
        ArtifactError::PatchRejected { path, source } => {
            warn!(path = %path, error = %source, "patch did not apply");
            Ok(BuildVerdict::Failure {
                log: format!("patch rejected for {path}: {source}"),
            })
        }
        other => Err(other.into()),
    }
}

/// Log text for the next iteration's context.
fn next_log(verdict: &BuildVerdict) -> String {
    match verdict {
        BuildVerdict::Failure { log } => log.clone(),
        BuildVerdict::Timeout => {
            "The build service did not report a result in time. The previous change may \
             or may not build; review it and continue repairing."
                .to_string()
        }
        BuildVerdict::ServiceError { reason, .. } => {
            format!("The build service reported an error: {reason}")
        }
        BuildVerdict::Success => String::new(),
    }
}
