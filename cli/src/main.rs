//! Maestro command-line driver.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use maestro_core::api::{
    EXIT_CANCELLED, EXIT_GATE_FAILURE, EXIT_INTERNAL_ERROR, EXIT_SUCCESS, EXIT_VALIDATION_FAILURE,
};
use maestro_core::{ConfigError, GateError, ValidationError, WorkflowError};

#[derive(Parser)]
#[command(
    name = "maestro",
    version,
    about = "Multi-agent software-delivery orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (equivalent to RUST_LOG=debug)
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an execution manifest and show its scheduling waves
    Validate(commands::validate::ValidateArgs),

    /// Show effective policy thresholds
    Policy(commands::policy::PolicyArgs),

    /// Run a requirement through the phased lifecycle (canned backend)
    Run(commands::run::RunArgs),

    /// Scan a JSONL audit log
    Audit(commands::audit::AuditArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Validate(args) => commands::validate::run(args),
        Commands::Policy(args) => commands::policy::run(args),
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Audit(args) => commands::audit::run(args),
    };

    match result {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(error) => {
            eprintln!("error: {:#}", error);
            std::process::exit(exit_code_for(&error));
        }
    }
}

/// Map error kinds onto the documented driver exit codes.
fn exit_code_for(error: &anyhow::Error) -> i32 {
    for cause in error.chain() {
        if cause.downcast_ref::<ValidationError>().is_some()
            || cause.downcast_ref::<ConfigError>().is_some()
        {
            return EXIT_VALIDATION_FAILURE;
        }
        if let Some(workflow) = cause.downcast_ref::<WorkflowError>() {
            if matches!(workflow, WorkflowError::Cancelled) {
                return EXIT_CANCELLED;
            }
            if matches!(workflow, WorkflowError::Validation(_)) {
                return EXIT_VALIDATION_FAILURE;
            }
        }
        if cause.downcast_ref::<GateError>().is_some() {
            return EXIT_GATE_FAILURE;
        }
    }
    EXIT_INTERNAL_ERROR
}
