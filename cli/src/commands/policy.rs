//! `maestro policy` - show effective gate thresholds.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::Args;
use colored::Colorize;

use maestro_core::{Phase, PolicyLoader};

#[derive(Args)]
pub struct PolicyArgs {
    /// Policy file (.toml or .json); omit for the built-in defaults
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Restrict output to one phase
    #[arg(long)]
    pub phase: Option<String>,
}

const STANDARD_GATES: &[&str] = &[
    "deliverable_quality",
    "test_coverage",
    "code_quality",
    "documentation",
    "security_scan",
];

pub fn run(args: PolicyArgs) -> anyhow::Result<()> {
    let loader = match &args.file {
        Some(path) => PolicyLoader::from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PolicyLoader::default(),
    };

    let phases: Vec<Phase> = match &args.phase {
        Some(name) => vec![Phase::from_str(name).map_err(anyhow::Error::msg)?],
        None => Phase::sequence().to_vec(),
    };

    for phase in phases {
        println!("{}", phase.to_string().bold());
        let declared: Vec<String> = loader
            .document()
            .phases
            .get(phase.as_str())
            .map(|p| p.gates.keys().cloned().collect())
            .unwrap_or_default();
        let mut gates: Vec<String> = STANDARD_GATES.iter().map(|g| g.to_string()).collect();
        for gate in declared {
            if !gates.contains(&gate) {
                gates.push(gate);
            }
        }
        for gate in gates {
            let declared = loader
                .document()
                .phases
                .get(phase.as_str())
                .map(|p| p.gates.contains_key(&gate))
                .unwrap_or(false);
            let marker = if declared { "" } else { " (default)" };
            println!(
                "  {:<20} threshold {:.2}  severity {}{}",
                gate,
                loader.threshold(phase, &gate),
                loader.severity(phase, &gate),
                marker.dimmed()
            );
        }
    }
    Ok(())
}
