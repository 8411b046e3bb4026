//! Runtime configuration.
//!
//! Layering, lowest to highest precedence: built-in defaults, an optional TOML
//! file, environment variables, then CLI flags (applied in `main`).
//!
//! Model credentials use `API_KEY` / `API_BASE_URL`; every other variable is
//! prefixed `ISA_REPAIR_`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use repair_coordination::{IsaPair, ObsConfig, StructureOptions, SubmitterConfig};
use serde::{Deserialize, Serialize};

use crate::errors::RepairError;
use crate::model::OpenAiConfig;
use crate::session::SessionConfig;
use crate::tools::RepairStrategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model: "gpt-4o".into(),
            temperature: 0.2,
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSection {
    pub interval_secs: u64,
    pub max_attempts: u32,
    pub upload_retries: u32,
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_attempts: 6,
            upload_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// One subdirectory per package.
    pub base_dir: PathBuf,
    /// Staged working copies.
    pub work_dir: PathBuf,
    pub result_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("packages"),
            work_dir: PathBuf::from("work"),
            result_dir: PathBuf::from("results"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySection {
    /// Sessions running at once.
    pub max_sessions: usize,
    /// Builds in flight at once across all sessions.
    pub max_submissions: usize,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            max_submissions: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub strategy: RepairStrategy,
    pub model: ModelSection,
    pub obs: ObsConfig,
    pub session: SessionConfig,
    pub poll: PollSection,
    pub structure: StructureOptions,
    pub paths: PathsSection,
    pub isa: IsaPair,
    pub concurrency: ConcurrencySection,
}

impl RepairConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                Self::from_toml_str(&text).with_context(|| format!("parsing {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from environment variables, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("API_KEY") {
            self.model.api_key = v;
        }
        if let Some(v) = var("API_BASE_URL") {
            self.model.base_url = v;
        }
        if let Some(v) = var("ISA_REPAIR_MODEL") {
            self.model.model = v;
        }
        if let Some(v) = var("ISA_REPAIR_MAX_ITERATIONS") {
            self.session.max_iterations = v
                .parse()
                .with_context(|| format!("ISA_REPAIR_MAX_ITERATIONS={v}"))?;
        }
        if let Some(v) = var("ISA_REPAIR_STRATEGY") {
            self.strategy = v.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(v) = var("ISA_REPAIR_ISA") {
            self.isa = v.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(v) = var("ISA_REPAIR_OBS_API_URL") {
            self.obs.api_url = v;
        }
        if let Some(v) = var("ISA_REPAIR_OBS_USER") {
            self.obs.username = v;
        }
        if let Some(v) = var("ISA_REPAIR_OBS_PASSWORD") {
            self.obs.password = v;
        }
        if let Some(v) = var("ISA_REPAIR_OBS_PROJECT") {
            self.obs.project = v;
        }
        if let Some(v) = var("ISA_REPAIR_BASE_DIR") {
            self.paths.base_dir = v.into();
        }
        if let Some(v) = var("ISA_REPAIR_WORK_DIR") {
            self.paths.work_dir = v.into();
        }
        if let Some(v) = var("ISA_REPAIR_RESULT_DIR") {
            self.paths.result_dir = v.into();
        }
        Ok(())
    }

    /// Reject settings the repair loop cannot run with.
    pub fn validate(&self) -> Result<(), RepairError> {
        let invalid = |msg: String| Err(RepairError::Configuration(msg));
        if self.session.max_iterations == 0 {
            return invalid("session.max_iterations must be at least 1".into());
        }
        if self.poll.max_attempts == 0 {
            return invalid("poll.max_attempts must be at least 1".into());
        }
        if self.concurrency.max_sessions == 0 || self.concurrency.max_submissions == 0 {
            return invalid("concurrency limits must be at least 1".into());
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return invalid(format!(
                "model.temperature must be within 0.0..=2.0, got {}",
                self.model.temperature
            ));
        }
        if self.model.base_url.is_empty() || self.model.model.is_empty() {
            return invalid("model.base_url and model.model are required".into());
        }
        if self.isa.source == self.isa.target {
            return invalid(format!("source and target ISA are both {}", self.isa.source));
        }
        Ok(())
    }

    /// The target ISA doubles as the build service architecture unless the
    /// config names one explicitly.
    pub fn obs_config(&self) -> ObsConfig {
        let mut obs = self.obs.clone();
        if obs.architecture.is_empty() {
            obs.architecture = self.isa.target.clone();
        }
        obs
    }

    pub fn submitter_config(&self) -> SubmitterConfig {
        SubmitterConfig {
            poll_interval: Duration::from_secs(self.poll.interval_secs),
            max_polls: self.poll.max_attempts,
            upload_retries: self.poll.upload_retries,
        }
    }

    pub fn openai_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.model.base_url.clone(),
            api_key: self.model.api_key.clone(),
            model: self.model.model.clone(),
            request_timeout: Duration::from_secs(self.model.request_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = RepairConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.max_iterations, 3);
        assert_eq!(config.strategy, RepairStrategy::FullFile);
    }

    #[test]
    fn test_partial_toml() {
        let config = RepairConfig::from_toml_str(
            r#"
strategy = "patch"

[isa]
source = "x86_64"
target = "loongarch64"

[session]
max_iterations = 5

[obs]
project = "home:porter"
"#,
        )
        .unwrap();
        assert_eq!(config.strategy, RepairStrategy::Patch);
        assert_eq!(config.isa.target, "loongarch64");
        assert_eq!(config.session.max_iterations, 5);
        assert_eq!(config.session.clarification_retries, 2);
        assert_eq!(config.obs.project, "home:porter");
        assert_eq!(config.obs.api_url, "https://api.opensuse.org");
        assert_eq!(config.poll.max_attempts, 6);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("API_KEY", "sk-test"),
            ("API_BASE_URL", "http://localhost:8000/v1"),
            ("ISA_REPAIR_MAX_ITERATIONS", "7"),
            ("ISA_REPAIR_ISA", "x86_64:aarch64"),
        ]
        .into_iter()
        .collect();
        let mut config = RepairConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.model.api_key, "sk-test");
        assert_eq!(config.model.base_url, "http://localhost:8000/v1");
        assert_eq!(config.session.max_iterations, 7);
        assert_eq!(config.isa, IsaPair::new("x86_64", "aarch64"));
    }

    #[test]
    fn test_bad_env_value_is_error() {
        let mut config = RepairConfig::default();
        let err = config
            .apply_env(|k| (k == "ISA_REPAIR_STRATEGY").then(|| "both".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("unknown repair strategy"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = RepairConfig::default();
        config.session.max_iterations = 0;
        assert!(matches!(
            config.validate(),
            Err(RepairError::Configuration(_))
        ));

        let mut config = RepairConfig::default();
        config.model.temperature = 3.5;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("temperature"));

        let mut config = RepairConfig::default();
        config.isa = IsaPair::new("riscv64", "riscv64");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_not_serialized() {
        let mut config = RepairConfig::default();
        config.model.api_key = "secret".into();
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("secret"));
    }
}
