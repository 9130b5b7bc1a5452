//! Workflow event stream.
//!
//! The executor publishes timestamped events to a broadcast bus; subscribers
//! (the HTTP surface, loggers, tests) receive them in emission order per
//! workflow. Envelopes serialize with a flattened `type` tag, matching the
//! wire format pushed over the WebSocket surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_id: String,
        total_nodes: usize,
    },
    NodeStarted {
        workflow_id: String,
        node_id: String,
        attempt: u32,
    },
    NodeCompleted {
        workflow_id: String,
        node_id: String,
        duration_ms: u64,
    },
    NodeFailed {
        workflow_id: String,
        node_id: String,
        reason: String,
        will_retry: bool,
    },
    Progress {
        workflow_id: String,
        completed: usize,
        total: usize,
    },
    WorkflowCompleted {
        workflow_id: String,
        duration_ms: u64,
    },
    WorkflowFailed {
        workflow_id: String,
        reason: String,
    },
    WorkflowCancelled {
        workflow_id: String,
    },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::WorkflowStarted { workflow_id, .. }
            | WorkflowEvent::NodeStarted { workflow_id, .. }
            | WorkflowEvent::NodeCompleted { workflow_id, .. }
            | WorkflowEvent::NodeFailed { workflow_id, .. }
            | WorkflowEvent::Progress { workflow_id, .. }
            | WorkflowEvent::WorkflowCompleted { workflow_id, .. }
            | WorkflowEvent::WorkflowFailed { workflow_id, .. }
            | WorkflowEvent::WorkflowCancelled { workflow_id } => workflow_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted { .. } => "workflow_started",
            WorkflowEvent::NodeStarted { .. } => "node_started",
            WorkflowEvent::NodeCompleted { .. } => "node_completed",
            WorkflowEvent::NodeFailed { .. } => "node_failed",
            WorkflowEvent::Progress { .. } => "progress",
            WorkflowEvent::WorkflowCompleted { .. } => "workflow_completed",
            WorkflowEvent::WorkflowFailed { .. } => "workflow_failed",
            WorkflowEvent::WorkflowCancelled { .. } => "workflow_cancelled",
        }
    }
}

/// A timestamped event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: WorkflowEvent,
}

/// Broadcast bus for workflow events.
///
/// Slow subscribers may lag and lose old events; emission never blocks the
/// executor.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`, for async consumers.
    pub fn subscribe_stream(&self) -> BroadcastStream<EventEnvelope> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Publish an event; returns the envelope for mirroring into logs.
    pub fn emit(&self, event: WorkflowEvent) -> EventEnvelope {
        let envelope = EventEnvelope {
            timestamp: Utc::now(),
            event,
        };
        // No subscribers is fine.
        let _ = self.tx.send(envelope.clone());
        envelope
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
