//! `maestro run` - drive the phased autonomous executor.
//!
//! The CLI ships with the deterministic canned backend; real deployments
//! embed the core and inject a provider-backed `LlmBackend`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use colored::Colorize;

use maestro_core::{
    AutonomousConfig, CannedBackend, ExecutionManifest, MaestroConfig, PhasedAutonomousExecutor,
    PolicyLoader,
};

#[derive(Args)]
pub struct RunArgs {
    /// The natural-language requirement to execute
    #[arg(long)]
    pub requirement: String,

    /// Optional execution manifest (.json or .toml)
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Output directory for deliverables, artifacts, and logs
    #[arg(long, default_value = "maestro-output")]
    pub output: PathBuf,

    /// Policy file; omit for built-in defaults
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Hold a group discussion at each phase boundary
    #[arg(long)]
    pub discussions: bool,

    /// SQLite database for contract history and bypass requests; defaults
    /// to registry.db under the platform data directory
    #[arg(long)]
    pub registry_db: Option<PathBuf>,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let env = MaestroConfig::from_env()?;
    let policy = match &args.policy {
        Some(path) => Arc::new(
            PolicyLoader::from_path(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
        ),
        None => Arc::new(PolicyLoader::default()),
    };

    let manifest = match &args.manifest {
        Some(path) => Some(
            ExecutionManifest::from_path(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
        ),
        None => None,
    };

    let mut config = AutonomousConfig::new(&args.output);
    config.enable_discussions = args.discussions;
    config.max_remediation_iterations = env.remediation_iterations();
    config.executor.default_timeout_secs = env.node_timeout_secs();
    config.registry_db = Some(
        args.registry_db
            .clone()
            .unwrap_or_else(|| MaestroConfig::data_dir().join("registry.db")),
    );

    let executor =
        PhasedAutonomousExecutor::new(Arc::new(CannedBackend::new()), policy, config).await?;
    let report = executor
        .execute_requirement(&args.requirement, manifest.as_ref())
        .await?;

    println!(
        "{} workflow {} (iteration {})",
        "completed:".green().bold(),
        report.workflow_id,
        report.iteration_id
    );
    for outcome in &report.phases {
        let marker = if outcome.bypassed {
            "bypassed".yellow()
        } else {
            "passed".green()
        };
        println!(
            "  {:<16} {}  score {:.2}  iterations {}",
            outcome.phase.to_string(),
            marker,
            outcome.gate.score,
            outcome.iterations
        );
    }
    let stats = &report.conversation_stats;
    println!(
        "  conversation: {} messages, {} decisions, {} questions, {} answers",
        stats.messages, stats.decisions, stats.questions, stats.answers
    );
    Ok(())
}
