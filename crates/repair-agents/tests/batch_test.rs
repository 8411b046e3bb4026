//! Batch runs over several packages with shared model and build service.

mod common;

use std::fs;
use std::sync::Arc;

use async_trait::async_trait;
use common::{fixed_spec, write_spec, Fixture, ScriptedModel};
use repair_agents::model::{ChatModel, ChatRequest, ChatResponse, ModelError};
use repair_agents::transcript::JSONL_NAME;
use repair_agents::{run_batch, RepairConfig, SessionStatus, SessionTranscript};
use repair_coordination::fakes::ScriptedBuildService;
use tokio_util::sync::CancellationToken;

/// A client with a bug: every call panics inside the session task.
struct PanickingModel;

#[async_trait]
impl ChatModel for PanickingModel {
    fn model_name(&self) -> String {
        "panicking".into()
    }

    async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ModelError> {
        panic!("model client bug");
    }
}

fn config(fx: &Fixture) -> RepairConfig {
    let mut config = RepairConfig::default();
    config.paths.base_dir = fx.base.clone();
    config.paths.work_dir = fx.work.clone();
    config.paths.result_dir = fx.results.clone();
    config.session.max_iterations = 2;
    config.poll.interval_secs = 5;
    config.poll.max_attempts = 3;
    config.concurrency.max_sessions = 2;
    config.concurrency.max_submissions = 1;
    config
}

/// Test: each package gets its own session, transcript file and summary line.
///
/// The model always rewrites `bc.spec`, which only exists in `bc`; `m4`
/// exhausts its iterations on invalid targets and `empty` has no spec at all.
#[tokio::test(start_paused = true)]
async fn test_batch_runs_each_package_independently() {
    let fx = Fixture::new();
    fx.add_package("m4");
    let empty = fx.base.join("empty");
    fs::create_dir_all(&empty).unwrap();

    let model = Arc::new(ScriptedModel::new(write_spec(&fixed_spec())));
    let service = Arc::new(ScriptedBuildService::always_succeeding());
    let packages = vec![fx.package_dir("m4"), empty, fx.package_dir("bc")];

    let report = run_batch(
        &config(&fx),
        model,
        service.clone(),
        packages,
        CancellationToken::new(),
    )
    .await;

    let names: Vec<&str> = report.outcomes.iter().map(|o| o.package.as_str()).collect();
    assert_eq!(names, vec!["bc", "empty", "m4"]);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.aborted(), 0);
    assert_eq!(report.skipped(), 1);
    assert_eq!(
        report.summary(),
        "3 packages: 1 succeeded, 1 failed, 0 aborted, 1 skipped"
    );

    // Only bc ever reached the build service.
    assert_eq!(service.upload_calls(), 1);
    assert_eq!(fx.staged_file("bc", "bc.spec"), fixed_spec());
    assert!(fx.staged_file("m4", "m4.spec").contains("Name: m4"));

    let bc = report.outcomes[0].result_path.as_ref().unwrap();
    let reloaded = SessionTranscript::load(bc).unwrap();
    assert_eq!(reloaded.package, "bc");
    assert_eq!(reloaded.status, SessionStatus::Succeeded);
    assert_eq!(reloaded.iteration_count(), 1);

    let m4 = SessionTranscript::load(&fx.results.join("m4_result.json")).unwrap();
    assert_eq!(m4.status, SessionStatus::Failed);
    assert_eq!(m4.iteration_count(), 2);
    assert!(m4.iterations.iter().all(|r| r.submission_attempts == 0));

    let lines = fs::read_to_string(fx.results.join(JSONL_NAME)).unwrap();
    assert_eq!(lines.lines().count(), 2);
    for line in lines.lines() {
        let summary: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(summary["package"] == "bc" || summary["package"] == "m4");
    }
}

/// Test: a batch cancelled up front starts no sessions and writes nothing.
#[tokio::test(start_paused = true)]
async fn test_cancelled_batch_skips_everything() {
    let fx = Fixture::new();
    fx.add_package("m4");
    let model = Arc::new(ScriptedModel::new(write_spec(&fixed_spec())));
    let service = Arc::new(ScriptedBuildService::always_succeeding());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = run_batch(
        &config(&fx),
        model.clone(),
        service,
        vec![fx.package_dir("bc"), fx.package_dir("m4")],
        cancel,
    )
    .await;

    assert_eq!(report.skipped(), 2);
    assert_eq!(model.calls(), 0);
    assert!(!fx.results.join(JSONL_NAME).exists());
}

/// Test: a package whose session task panics is still reported, by name.
#[tokio::test(start_paused = true)]
async fn test_panicked_session_is_reported() {
    let fx = Fixture::new();
    fx.add_package("m4");
    let service = Arc::new(ScriptedBuildService::always_succeeding());

    let report = run_batch(
        &config(&fx),
        Arc::new(PanickingModel),
        service.clone(),
        vec![fx.package_dir("m4"), fx.package_dir("bc")],
        CancellationToken::new(),
    )
    .await;

    let names: Vec<&str> = report.outcomes.iter().map(|o| o.package.as_str()).collect();
    assert_eq!(names, vec!["bc", "m4"]);
    for outcome in &report.outcomes {
        assert_eq!(outcome.result.as_ref().unwrap_err(), "session task panicked");
        assert!(outcome.result_path.is_none());
    }
    assert_eq!(report.skipped(), 2);
    assert_eq!(service.upload_calls(), 0);
    assert!(!fx.results.join(JSONL_NAME).exists());
}
