//! `maestro audit` - scan a JSONL audit log.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use maestro_core::{AuditFilter, AuditLog};

#[derive(Args)]
pub struct AuditArgs {
    /// Path to the audit log (JSONL)
    #[arg(long)]
    pub log: PathBuf,

    /// Filter by event type (e.g. bypass_approved)
    #[arg(long)]
    pub event_type: Option<String>,

    /// Filter by workflow id
    #[arg(long)]
    pub workflow: Option<String>,
}

pub fn run(args: AuditArgs) -> anyhow::Result<()> {
    let log = AuditLog::open(&args.log)
        .with_context(|| format!("failed to open {}", args.log.display()))?;

    let mut filter = AuditFilter::new();
    if let Some(event_type) = &args.event_type {
        filter = filter.event_type(event_type);
    }
    if let Some(workflow) = &args.workflow {
        filter = filter.workflow_id(workflow);
    }

    let mut count = 0usize;
    for event in log.scan(filter)? {
        let event = event?;
        println!("{}", serde_json::to_string(&event)?);
        count += 1;
    }
    eprintln!("{} event(s)", count);
    Ok(())
}
