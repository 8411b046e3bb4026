//! Batch runner: one repair session per package, several at once.
//!
//! ```text
//! run_batch(packages)
//!   JoinSet::spawn(session for package_i) × N, bounded by max_sessions
//!     └─ stage working copy → RepairSession::run → send outcome
//!   result sink (mpsc) → persist transcript → BatchReport
//! ```
//!
//! Sessions share only immutable pieces (model client, tool registry) and
//! the submission permits; each owns its working copy and submitter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use repair_coordination::{
    ArtifactStore, BuildService, BuildSubmitter, Package, SubmissionPermits,
};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RepairConfig;
use crate::model::ChatModel;
use crate::session::RepairSession;
use crate::tools::ToolRegistry;
use crate::transcript::{SessionStatus, SessionTranscript};

/// What came back for one package.
#[derive(Debug)]
pub struct BatchOutcome {
    pub package: String,
    pub result: Result<SessionTranscript, String>,
    /// Where the transcript was written, when it was.
    pub result_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<BatchOutcome>,
}

impl BatchReport {
    fn count(&self, pred: impl Fn(&SessionStatus) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(&o.result, Ok(t) if pred(&t.status)))
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, SessionStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SessionStatus::Failed))
    }

    pub fn aborted(&self) -> usize {
        self.count(|s| matches!(s, SessionStatus::Aborted { .. }))
    }

    /// Packages without a transcript: bad layout, staging error or a session
    /// task that panicked.
    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} packages: {} succeeded, {} failed, {} aborted, {} skipped",
            self.outcomes.len(),
            self.succeeded(),
            self.failed(),
            self.aborted(),
            self.skipped()
        )
    }
}

/// Run every package in `packages` to completion (or cancellation).
pub async fn run_batch(
    config: &RepairConfig,
    model: Arc<dyn ChatModel>,
    service: Arc<dyn BuildService>,
    packages: Vec<PathBuf>,
    cancel: CancellationToken,
) -> BatchReport {
    let sessions = Arc::new(Semaphore::new(config.concurrency.max_sessions));
    let permits = SubmissionPermits::new(config.concurrency.max_submissions);
    let registry = Arc::new(ToolRegistry::new(config.strategy, config.structure.clone()));
    let config = Arc::new(config.clone());
    let (tx, mut rx) = mpsc::channel::<BatchOutcome>(config.concurrency.max_sessions.max(1));

    info!(
        packages = packages.len(),
        max_sessions = config.concurrency.max_sessions,
        strategy = %config.strategy,
        isa = %config.isa,
        "Batch starting"
    );

    let mut expected = Vec::with_capacity(packages.len());
    let mut join_set: JoinSet<()> = JoinSet::new();
    for dir in packages {
        let package = package_name(&dir);
        expected.push(package.clone());
        let sessions = sessions.clone();
        let permits = permits.clone();
        let registry = registry.clone();
        let config = config.clone();
        let model = model.clone();
        let service = service.clone();
        let cancel = cancel.clone();
        let tx = tx.clone();

        join_set.spawn(async move {
            let result = match sessions.acquire_owned().await {
                Ok(_permit) => {
                    run_one(&config, &dir, model, service, registry, permits, cancel).await
                }
                Err(e) => Err(format!("session limiter closed: {e}")),
            };
            if tx
                .send(BatchOutcome {
                    package,
                    result,
                    result_path: None,
                })
                .await
                .is_err()
            {
                warn!(dir = %dir.display(), "result sink closed before outcome was sent");
            }
        });
    }
    drop(tx);

    let mut report = BatchReport::default();
    while let Some(mut outcome) = rx.recv().await {
        match &outcome.result {
            Ok(transcript) => match transcript.persist(&config.paths.result_dir) {
                Ok(path) => outcome.result_path = Some(path),
                Err(e) => warn!(package = %outcome.package, error = %e, "could not persist transcript"),
            },
            Err(reason) => warn!(package = %outcome.package, reason = %reason, "package skipped"),
        }
        report.outcomes.push(outcome);
    }

    while let Some(res) = join_set.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "session task panicked");
        }
    }

    // A task that panicked never sent its outcome.
    for outcome in &report.outcomes {
        if let Some(i) = expected.iter().position(|p| *p == outcome.package) {
            expected.swap_remove(i);
        }
    }
    for package in expected {
        warn!(package = %package, "no outcome from session task");
        report.outcomes.push(BatchOutcome {
            package,
            result: Err("session task panicked".into()),
            result_path: None,
        });
    }

    report.outcomes.sort_by(|a, b| a.package.cmp(&b.package));
    info!("Batch finished: {}", report.summary());
    report
}

async fn run_one(
    config: &RepairConfig,
    dir: &Path,
    model: Arc<dyn ChatModel>,
    service: Arc<dyn BuildService>,
    registry: Arc<ToolRegistry>,
    permits: SubmissionPermits,
    cancel: CancellationToken,
) -> Result<SessionTranscript, String> {
    if cancel.is_cancelled() {
        return Err("cancelled before start".into());
    }
    let package = Package::discover(dir, config.isa.clone()).map_err(|e| e.to_string())?;
    let store =
        ArtifactStore::stage(package, &config.paths.work_dir).map_err(|e| e.to_string())?;
    let submitter = BuildSubmitter::new(service, config.submitter_config()).with_permits(permits);

    let session = RepairSession::new(
        store,
        model,
        registry,
        submitter,
        config.session.clone(),
        config.model.temperature,
    )
    .with_cancellation(cancel);
    Ok(session.run().await)
}

fn package_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}
