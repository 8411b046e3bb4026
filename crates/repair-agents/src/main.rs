use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use repair_agents::model::OpenAiCompatModel;
use repair_agents::{run_batch, RepairConfig, RepairStrategy};
use repair_coordination::{discover_packages, IsaPair, ObsClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Repair packages that fail to build for a target ISA.
#[derive(Debug, Parser)]
#[command(name = "isa-repair", version)]
struct Cli {
    /// TOML config file.
    #[arg(short, long, env = "ISA_REPAIR_CONFIG")]
    config: Option<PathBuf>,

    /// Directory with one subdirectory per package.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    #[arg(long)]
    work_dir: Option<PathBuf>,

    #[arg(long)]
    result_dir: Option<PathBuf>,

    /// `source:target`, e.g. `x86_64:riscv64`.
    #[arg(long)]
    isa: Option<IsaPair>,

    /// `full-file` or `patch`.
    #[arg(long)]
    strategy: Option<RepairStrategy>,

    #[arg(long)]
    max_iterations: Option<u32>,

    #[arg(long)]
    model: Option<String>,

    /// Only repair these packages (repeatable).
    #[arg(short, long = "package")]
    packages: Vec<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// List the packages that would be repaired and exit.
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn apply(&self, config: &mut RepairConfig) {
        if let Some(v) = &self.base_dir {
            config.paths.base_dir = v.clone();
        }
        if let Some(v) = &self.work_dir {
            config.paths.work_dir = v.clone();
        }
        if let Some(v) = &self.result_dir {
            config.paths.result_dir = v.clone();
        }
        if let Some(v) = &self.isa {
            config.isa = v.clone();
        }
        if let Some(v) = self.strategy {
            config.strategy = v;
        }
        if let Some(v) = self.max_iterations {
            config.session.max_iterations = v;
        }
        if let Some(v) = &self.model {
            config.model.model = v.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = RepairConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let mut packages = discover_packages(&config.paths.base_dir)
        .with_context(|| format!("listing {}", config.paths.base_dir.display()))?;
    if !cli.packages.is_empty() {
        packages.retain(|p| {
            p.file_name()
                .is_some_and(|n| cli.packages.iter().any(|want| n == want.as_str()))
        });
    }
    info!(
        count = packages.len(),
        base_dir = %config.paths.base_dir.display(),
        isa = %config.isa,
        strategy = %config.strategy,
        model = %config.model.model,
        "Packages selected"
    );

    if cli.dry_run {
        for p in &packages {
            println!("{}", p.display());
        }
        return Ok(());
    }
    if packages.is_empty() {
        warn!("Nothing to repair");
        return Ok(());
    }
    if config.model.api_key.is_empty() {
        warn!("API_KEY is not set; requests go out unauthenticated");
    }

    let model = Arc::new(
        OpenAiCompatModel::new(config.openai_config()).context("building model client")?,
    );
    let service =
        Arc::new(ObsClient::new(config.obs_config()).context("building build service client")?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping sessions after their current step");
                cancel.cancel();
            }
        });
    }

    let report = run_batch(&config, model, service, packages, cancel).await;
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(t) => println!(
                "{:<32} {:<10} iterations={}",
                outcome.package,
                t.status.label(),
                t.iteration_count()
            ),
            Err(reason) => println!("{:<32} {:<10} {reason}", outcome.package, "skipped"),
        }
    }
    println!("{}", report.summary());
    Ok(())
}
