//! Workflow and node execution state.
//!
//! A [`Workflow`] is immutable once execution starts; all mutable run state
//! lives in per-node [`NodeState`] records and the shared
//! [`WorkflowContext`]. Node status transitions are guarded: terminal states
//! never move back to a non-terminal state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::dag::WorkflowDag;
use crate::errors::{WorkflowError, WorkflowResult};

/// Execution status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Cancelled
        )
    }

    /// Allowed transitions. `failed -> ready` re-arms a node for retry;
    /// `completed` never leaves.
    pub fn can_transition_to(&self, target: NodeStatus) -> bool {
        matches!(
            (self, target),
            (NodeStatus::Pending, NodeStatus::Ready)
                | (NodeStatus::Pending, NodeStatus::Skipped)
                | (NodeStatus::Pending, NodeStatus::Cancelled)
                | (NodeStatus::Ready, NodeStatus::Running)
                | (NodeStatus::Ready, NodeStatus::Skipped)
                | (NodeStatus::Ready, NodeStatus::Cancelled)
                | (NodeStatus::Running, NodeStatus::Completed)
                | (NodeStatus::Running, NodeStatus::Failed)
                | (NodeStatus::Running, NodeStatus::Cancelled)
                | (NodeStatus::Failed, NodeStatus::Ready)
        )
    }
}

/// Mutable execution record for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    /// Failure or skip reason, when the status calls for one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            outputs: BTreeMap::new(),
            artifacts: Vec::new(),
            assigned_agent: None,
            reason: None,
        }
    }
}

impl NodeState {
    /// Apply a guarded status transition, stamping timestamps and the
    /// attempt counter.
    pub fn transition(&mut self, node_id: &str, target: NodeStatus) -> WorkflowResult<()> {
        if !self.status.can_transition_to(target) {
            return Err(WorkflowError::InvalidTransition {
                node_id: node_id.to_string(),
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        if target == NodeStatus::Running {
            self.started_at = Some(Utc::now());
            self.attempts += 1;
        }
        if target.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        if target == NodeStatus::Ready {
            // Re-armed for retry; clear the stale completion stamp.
            self.completed_at = None;
        }
        self.status = target;
        Ok(())
    }
}

/// Immutable workflow metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub iteration_id: String,
    pub created_at: DateTime<Utc>,
    pub requirement: String,
}

/// A workflow definition: id, graph, metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub dag: WorkflowDag,
    pub metadata: WorkflowMetadata,
}

impl Workflow {
    pub fn new(id: &str, dag: WorkflowDag, iteration_id: &str, requirement: &str) -> Self {
        Self {
            id: id.to_string(),
            dag,
            metadata: WorkflowMetadata {
                iteration_id: iteration_id.to_string(),
                created_at: Utc::now(),
                requirement: requirement.to_string(),
            },
        }
    }

    pub fn total_nodes(&self) -> usize {
        self.dag.len()
    }
}

/// Terminal status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Shared per-execution context.
///
/// Carries the requirement, iteration id and output directory, plus
/// node-output and metric maps shared across concurrently running nodes.
/// Cancellation is cooperative: node implementations observe
/// [`WorkflowContext::cancellation_token`].
pub struct WorkflowContext {
    pub requirement: String,
    pub iteration_id: String,
    pub output_dir: PathBuf,
    node_outputs: DashMap<String, BTreeMap<String, Value>>,
    metrics: DashMap<String, f64>,
    cancel: CancellationToken,
}

impl WorkflowContext {
    pub fn new(requirement: &str, iteration_id: &str, output_dir: &Path) -> Self {
        Self {
            requirement: requirement.to_string(),
            iteration_id: iteration_id.to_string(),
            output_dir: output_dir.to_path_buf(),
            node_outputs: DashMap::new(),
            metrics: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Signal cooperative cancellation to every in-flight node.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record the outputs of a completed node.
    pub fn record_outputs(&self, node_id: &str, outputs: BTreeMap<String, Value>) {
        self.node_outputs.insert(node_id.to_string(), outputs);
    }

    pub fn outputs_of(&self, node_id: &str) -> Option<BTreeMap<String, Value>> {
        self.node_outputs.get(node_id).map(|v| v.clone())
    }

    pub fn set_metric(&self, name: &str, value: f64) {
        self.metrics.insert(name.to_string(), value);
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).map(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{NodeType, WorkflowNode};

    #[test]
    fn test_status_lifecycle_happy_path() {
        let mut state = NodeState::default();
        state.transition("n", NodeStatus::Ready).unwrap();
        state.transition("n", NodeStatus::Running).unwrap();
        assert_eq!(state.attempts, 1);
        assert!(state.started_at.is_some());
        state.transition("n", NodeStatus::Completed).unwrap();
        assert!(state.completed_at.is_some());
        assert!(state.started_at.unwrap() <= state.completed_at.unwrap());
    }

    #[test]
    fn test_completed_is_monotonic() {
        let mut state = NodeState::default();
        state.transition("n", NodeStatus::Ready).unwrap();
        state.transition("n", NodeStatus::Running).unwrap();
        state.transition("n", NodeStatus::Completed).unwrap();
        for target in [
            NodeStatus::Pending,
            NodeStatus::Ready,
            NodeStatus::Running,
            NodeStatus::Failed,
        ] {
            let err = state.transition("n", target).unwrap_err();
            assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
        }
        assert_eq!(state.status, NodeStatus::Completed);
    }

    #[test]
    fn test_failed_rearms_for_retry_and_counts_attempts() {
        let mut state = NodeState::default();
        state.transition("n", NodeStatus::Ready).unwrap();
        state.transition("n", NodeStatus::Running).unwrap();
        state.transition("n", NodeStatus::Failed).unwrap();
        state.transition("n", NodeStatus::Ready).unwrap();
        assert!(state.completed_at.is_none());
        state.transition("n", NodeStatus::Running).unwrap();
        assert_eq!(state.attempts, 2);
    }

    #[test]
    fn test_pending_can_be_skipped_or_cancelled() {
        let mut state = NodeState::default();
        state.transition("n", NodeStatus::Skipped).unwrap();
        assert!(state.status.is_terminal());

        let mut state = NodeState::default();
        state.transition("n", NodeStatus::Cancelled).unwrap();
        assert!(state.status.is_terminal());
    }

    #[test]
    fn test_context_cancellation_propagates() {
        let ctx = WorkflowContext::new("req", "iter-1", Path::new("/tmp/out"));
        let token = ctx.cancellation_token();
        assert!(!token.is_cancelled());
        ctx.cancel();
        assert!(token.is_cancelled());
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_context_outputs_and_metrics() {
        let ctx = WorkflowContext::new("req", "iter-1", Path::new("/tmp/out"));
        let mut outputs = BTreeMap::new();
        outputs.insert("report".to_string(), Value::String("done".to_string()));
        ctx.record_outputs("A", outputs);
        assert_eq!(
            ctx.outputs_of("A").unwrap()["report"],
            Value::String("done".to_string())
        );
        assert!(ctx.outputs_of("B").is_none());

        ctx.set_metric("quality_score", 0.92);
        assert_eq!(ctx.metric("quality_score"), Some(0.92));
    }

    #[test]
    fn test_workflow_construction() {
        let mut dag = WorkflowDag::new();
        dag.add_node(WorkflowNode::new("A", NodeType::Action)).unwrap();
        let workflow = Workflow::new("wf-1", dag, "iter-1", "build an api");
        assert_eq!(workflow.total_nodes(), 1);
        assert_eq!(workflow.metadata.iteration_id, "iter-1");
    }
}
