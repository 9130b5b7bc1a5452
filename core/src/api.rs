//! Wire contracts for the external HTTP/WebSocket surface.
//!
//! The HTTP server itself is an external collaborator; these are the request
//! and response shapes it exchanges with the core, plus the exit codes CLI
//! drivers map results onto. Keeping the types here ensures the surface and
//! the core agree on one schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{NodeState, WorkflowStatus};

/// Process exit code: success.
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit code: input validation failure.
pub const EXIT_VALIDATION_FAILURE: i32 = 2;
/// Process exit code: gate failed with no covering bypass.
pub const EXIT_GATE_FAILURE: i32 = 3;
/// Process exit code: run cancelled.
pub const EXIT_CANCELLED: i32 = 4;
/// Process exit codes above this value are internal errors.
pub const EXIT_INTERNAL_ERROR: i32 = 11;

/// WebSocket close code sent when the auth token is missing or invalid.
pub const WS_CLOSE_UNAUTHORIZED: u16 = 4001;

/// `GET /workflows` list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub iteration_id: String,
    pub requirement: String,
    pub total_nodes: usize,
    pub created_at: DateTime<Utc>,
}

/// `GET /workflows/{id}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub summary: WorkflowSummary,
    pub nodes: Vec<NodeSummary>,
}

/// One node in a workflow detail response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

/// `POST /workflows/{id}/execute` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub requirement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_context: Option<Value>,
}

/// `POST /workflows/{id}/execute` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub execution_id: Uuid,
    pub status: WorkflowStatus,
}

/// `GET /executions/{id}` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusResponse {
    pub status: WorkflowStatus,
    pub completed_nodes: usize,
    pub total_nodes: usize,
    pub progress_percent: f64,
    pub node_states: Vec<NodeStateEntry>,
}

/// One node state in an execution status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStateEntry {
    pub node_id: String,
    #[serde(flatten)]
    pub state: NodeState,
}

impl ExecutionStatusResponse {
    pub fn new(
        status: WorkflowStatus,
        completed_nodes: usize,
        total_nodes: usize,
        node_states: Vec<NodeStateEntry>,
    ) -> Self {
        let progress_percent = if total_nodes == 0 {
            100.0
        } else {
            completed_nodes as f64 * 100.0 / total_nodes as f64
        };
        Self {
            status,
            completed_nodes,
            total_nodes,
            progress_percent,
            node_states,
        }
    }
}

/// Frame pushed over `WS /ws/workflow/{workflow_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEventFrame {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// `GET /health` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// `GET /audit/{iteration}/report` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReportResponse {
    pub iteration_id: String,
    pub events: usize,
    pub bypasses_approved: usize,
    pub bypasses_rejected: usize,
    pub gates_evaluated: usize,
    #[serde(default)]
    pub findings: Vec<String>,
}

/// Error body returned by the CLI and API surfaces.
///
/// Raw stack traces never cross this boundary; unexpected failures become
/// `internal_error` with a correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ApiError {
    pub fn new(kind: &str, message: &str) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.to_string(),
            details: None,
            retryable: None,
        }
    }

    /// Wrap an unexpected failure, hiding its detail behind a correlation id.
    pub fn internal(correlation_id: Uuid) -> Self {
        Self {
            kind: "internal_error".to_string(),
            message: format!("Internal error; correlation id {}", correlation_id),
            details: None,
            retryable: Some(true),
        }
    }
}
