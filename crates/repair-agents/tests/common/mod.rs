//! Shared fixtures: a scripted chat model and a small failing package.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use repair_agents::model::{ChatModel, ChatRequest, ChatResponse, ModelError};
use repair_agents::{RepairSession, RepairStrategy, SessionConfig, ToolRegistry};
use repair_coordination::archive;
use repair_coordination::{
    ArtifactStore, BuildService, BuildSubmitter, IsaPair, Package, StructureOptions,
    SubmitterConfig,
};
use serde_json::json;
use tempfile::TempDir;

pub const SPEC: &str = "Name: bc\nVersion: 1.07\nExclusiveArch: x86_64\n\n%build\nmake\n";
pub const LOG: &str = "[  12s] error: Architecture is not included: riscv64\n";
pub const CONFIGURE_AC: &str = "AC_INIT([bc], [1.07])\nAC_CANONICAL_HOST\ncase $host_cpu in\n  x86_64) ;;\n  *) AC_MSG_ERROR([unsupported cpu]) ;;\nesac\n";

/// Replies from a queue, then `fallback` forever. Records every request.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ChatResponse, ModelError>>>,
    fallback: ChatResponse,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(fallback: ChatResponse) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, reply: ChatResponse) -> Self {
        self.replies.lock().unwrap().push_back(Ok(reply));
        self
    }

    pub fn then_err(self, err: ModelError) -> Self {
        self.replies.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> String {
        "scripted".into()
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ModelError> {
        self.requests.lock().unwrap().push(request);
        match self.replies.lock().unwrap().pop_front() {
            Some(next) => next,
            None => Ok(self.fallback.clone()),
        }
    }
}

pub fn write_spec(content: &str) -> ChatResponse {
    write_file("bc.spec", content)
}

pub fn write_file(path: &str, content: &str) -> ChatResponse {
    ChatResponse::tool_call(
        "write_file",
        json!({
            "path": path,
            "content": content,
            "diagnosis": "riscv64 missing from ExclusiveArch"
        }),
    )
}

pub fn fixed_spec() -> String {
    SPEC.replace("ExclusiveArch: x86_64", "ExclusiveArch: x86_64 riscv64")
}

pub struct Fixture {
    pub tmp: TempDir,
    pub base: PathBuf,
    pub work: PathBuf,
    pub results: PathBuf,
}

impl Fixture {
    /// One package `bc` under `<tmp>/packages`.
    pub fn new() -> Self {
        let fx = Self::empty();
        fx.add_package("bc");
        fx
    }

    pub fn empty() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("packages");
        fs::create_dir_all(&base).unwrap();
        Self {
            work: tmp.path().join("work"),
            results: tmp.path().join("results"),
            base,
            tmp,
        }
    }

    /// Spec, failure log and a source tarball holding `<name>-1.07/configure.ac`.
    pub fn add_package(&self, name: &str) -> PathBuf {
        let dir = self.base.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{name}.spec")), SPEC.replace("bc", name)).unwrap();
        fs::write(dir.join("log_failed.txt"), LOG).unwrap();

        let upstream = self.tmp.path().join("upstream").join(name);
        let src = upstream.join(format!("{name}-1.07"));
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("configure.ac"), CONFIGURE_AC.replace("bc", name)).unwrap();
        archive::pack(&upstream, &dir.join(format!("{name}-1.07.tar.gz"))).unwrap();
        dir
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    pub fn staged_file(&self, package: &str, file: &str) -> String {
        fs::read_to_string(self.work.join(package).join(file)).unwrap()
    }

    /// Unpack the staged source archive of `package` and return its root.
    pub fn unpack_staged_archive(&self, package: &str) -> PathBuf {
        let out = self.tmp.path().join("unpacked").join(package);
        let archive_path = self.work.join(package).join(format!("{package}-1.07.tar.gz"));
        archive::unpack(&archive_path, &out).unwrap();
        out
    }
}

pub fn submitter_config() -> SubmitterConfig {
    SubmitterConfig {
        poll_interval: Duration::from_secs(5),
        max_polls: 3,
        upload_retries: 0,
    }
}

pub fn session(
    fx: &Fixture,
    model: Arc<ScriptedModel>,
    service: Arc<dyn BuildService>,
    strategy: RepairStrategy,
    config: SessionConfig,
) -> RepairSession {
    session_for(&fx.package_dir("bc"), &fx.work, model, service, strategy, config)
}

pub fn session_for(
    dir: &Path,
    work: &Path,
    model: Arc<ScriptedModel>,
    service: Arc<dyn BuildService>,
    strategy: RepairStrategy,
    config: SessionConfig,
) -> RepairSession {
    let package = Package::discover(dir, IsaPair::default()).unwrap();
    let store = ArtifactStore::stage(package, work).unwrap();
    let registry = Arc::new(ToolRegistry::new(strategy, StructureOptions::default()));
    let submitter = BuildSubmitter::new(service, submitter_config());
    RepairSession::new(store, model, registry, submitter, config, 0.0)
}
