//! `maestro validate` - check a manifest and preview its scheduling waves.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use colored::Colorize;

use maestro_core::ExecutionManifest;

#[derive(Args)]
pub struct ValidateArgs {
    /// Path to the execution manifest (.json or .toml)
    #[arg(long)]
    pub manifest: PathBuf,
}

pub fn run(args: ValidateArgs) -> anyhow::Result<()> {
    let manifest = ExecutionManifest::from_path(&args.manifest)
        .with_context(|| format!("failed to load {}", args.manifest.display()))?;
    manifest.validate()?;

    let dag = manifest.build_dag()?;
    let waves = dag.topological_groups()?;

    println!(
        "{} {} ({} nodes, iteration {})",
        "valid:".green().bold(),
        manifest.project,
        manifest.nodes.len(),
        manifest.iteration_id
    );
    for (index, wave) in waves.iter().enumerate() {
        println!("  wave {}: {}", index + 1, wave.join(", "));
    }
    Ok(())
}
