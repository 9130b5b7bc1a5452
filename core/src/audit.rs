//! Append-only JSONL audit log.
//!
//! One JSON object per line, flushed per event. The log is single-appender:
//! concurrent callers serialize on the internal writer lock. Files are never
//! rewritten in place; readers get a lazy line-by-line scan.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::AuditResult;
use crate::phase::Phase;

/// Standard location of the bypass-subsystem log, relative to the log root.
pub const BYPASS_LOG: &str = "logs/phase_gate_bypasses.jsonl";
/// Standard location of the workflow-event log, relative to the log root.
pub const WORKFLOW_EVENT_LOG: &str = "logs/workflow_events.jsonl";

/// One audited event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bypass_id: Option<Uuid>,
    #[serde(default)]
    pub payload: Value,
}

impl AuditEvent {
    pub fn new(event_type: &str, actor: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            workflow_id: None,
            phase: None,
            node_id: None,
            bypass_id: None,
            payload: Value::Null,
        }
    }

    pub fn with_workflow(mut self, workflow_id: &str) -> Self {
        self.workflow_id = Some(workflow_id.to_string());
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn with_bypass(mut self, bypass_id: Uuid) -> Self {
        self.bypass_id = Some(bypass_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Filter for [`AuditLog::scan`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<String>,
    pub actor: Option<String>,
    pub workflow_id: Option<String>,
    pub phase: Option<Phase>,
    pub bypass_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    pub fn workflow_id(mut self, workflow_id: &str) -> Self {
        self.workflow_id = Some(workflow_id.to_string());
        self
    }

    pub fn bypass_id(mut self, bypass_id: Uuid) -> Self {
        self.bypass_id = Some(bypass_id);
        self
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        self.event_type
            .as_deref()
            .map_or(true, |t| event.event_type == t)
            && self.actor.as_deref().map_or(true, |a| event.actor == a)
            && self
                .workflow_id
                .as_deref()
                .map_or(true, |w| event.workflow_id.as_deref() == Some(w))
            && self.phase.map_or(true, |p| event.phase == Some(p))
            && self
                .bypass_id
                .map_or(true, |b| event.bypass_id == Some(b))
            && self.since.map_or(true, |t| event.timestamp >= t)
    }
}

/// Append-only JSONL event stream.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl AuditLog {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> AuditResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event; the write is flushed before returning.
    pub fn append(&self, event: &AuditEvent) -> AuditResult<()> {
        let line = serde_json::to_string(event)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Lazily scan events matching `filter`, in append order.
    ///
    /// Malformed lines surface as errors so callers can decide whether to
    /// skip or abort.
    pub fn scan(
        &self,
        filter: AuditFilter,
    ) -> AuditResult<impl Iterator<Item = AuditResult<AuditEvent>>> {
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(reader.lines().filter_map(move |line| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) if filter.matches(&event) => Some(Ok(event)),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            },
            Err(e) => Some(Err(e.into())),
        }))
    }

    /// Convenience: collect all matching events, skipping malformed lines.
    pub fn collect(&self, filter: AuditFilter) -> AuditResult<Vec<AuditEvent>> {
        Ok(self.scan(filter)?.filter_map(|e| e.ok()).collect())
    }
}
