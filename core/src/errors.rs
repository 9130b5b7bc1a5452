/// Error types for the Maestro orchestration core.
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Fatal errors raised while loading manifests or policy documents.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed policy document: {0}")]
    MalformedPolicy(String),

    #[error("Malformed execution manifest: {0}")]
    MalformedManifest(String),

    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Missing file: {0}")]
    MissingFile(PathBuf),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Synchronous contract violations on API inputs.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Requirement must not be empty")]
    EmptyRequirement,

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Unknown dependency '{dependency}' referenced by node '{node}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Duplicate deliverable name '{0}' in contract")]
    DuplicateDeliverable(String),

    #[error("Duplicate message id: {0}")]
    DuplicateMessageId(Uuid),

    #[error("Invalid input: {0}")]
    Invalid(String),
}

/// Result type for input validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Errors from the DAG model and workflow executor.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Cycle detected in workflow graph: {0}")]
    CycleDetected(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    MissingDependency { node: String, dependency: String },

    #[error("Node '{node_id}' timed out after {seconds}s")]
    NodeTimeout { node_id: String, seconds: u64 },

    #[error("Node '{node_id}' failed: {reason}")]
    NodeFailure { node_id: String, reason: String },

    #[error("Node '{node_id}' unreachable: upstream node '{upstream}' did not complete")]
    DependencyError { node_id: String, upstream: String },

    #[error("Invalid status transition for node '{node_id}': {from} -> {to}")]
    InvalidTransition {
        node_id: String,
        from: String,
        to: String,
    },

    #[error("Workflow cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors surfaced by the phase gate layer.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Contract violation in phase {phase}: {detail}")]
    ContractViolation { phase: String, detail: String },

    #[error("Gate '{gate}' in phase {phase} requires a bypass to proceed")]
    BypassRequired { gate: String, phase: String },

    #[error("Bypass rejected: {0}")]
    BypassRejected(String),

    #[error("Bypass expired: {0}")]
    BypassExpired(Uuid),

    #[error("Phase {phase} failed its exit gate after {iterations} remediation iterations")]
    RemediationExhausted { phase: String, iterations: u32 },

    #[error("Entry gate for phase {phase} failed: {detail}")]
    EntryGateFailed { phase: String, detail: String },

    #[error("No contract registered for phase {0}")]
    MissingContract(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the bypass request lifecycle.
#[derive(Error, Debug)]
pub enum BypassError {
    #[error("Gate '{gate}' in phase {phase} is not bypassable by policy")]
    NotBypassable { gate: String, phase: String },

    #[error("Approval of bypass for gate '{gate}' requires an ADR path")]
    AdrRequired { gate: String },

    #[error("Invalid bypass status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Bypass request not found: {0}")]
    NotFound(Uuid),

    #[error("Audit log error: {0}")]
    Audit(String),
}

/// Result type for bypass operations.
pub type BypassResult<T> = Result<T, BypassError>;

/// Errors from the conversation store.
#[derive(Error, Debug)]
pub enum ConversationError {
    #[error("Duplicate message id: {0}")]
    DuplicateId(Uuid),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for conversation operations.
pub type ConversationResult<T> = Result<T, ConversationError>;

/// Errors from the append-only audit log.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for audit log operations.
pub type AuditResult<T> = Result<T, AuditError>;

/// Errors from the SQLite-backed registry store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for registry store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from LLM collaborator backends.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Stream closed unexpectedly")]
    StreamClosed,

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),
}

/// Result type for LLM backend operations.
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors from the group-chat orchestrator.
#[derive(Error, Debug)]
pub enum GroupChatError {
    #[error("A discussion needs at least two participants, got {0}")]
    NotEnoughParticipants(usize),

    #[error("Backend error: {0}")]
    Backend(#[from] LlmError),

    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),
}

/// Result type for group-chat operations.
pub type GroupChatResult<T> = Result<T, GroupChatError>;

/// Errors from persona execution.
#[derive(Error, Debug)]
pub enum PersonaError {
    #[error("Unknown persona: {0}")]
    UnknownPersona(String),

    #[error("Backend error: {0}")]
    Backend(#[from] LlmError),

    #[error("Artifact stamping failed: {0}")]
    Artifact(String),

    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for persona execution.
pub type PersonaResult<T> = Result<T, PersonaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        let err = WorkflowError::NodeTimeout {
            node_id: "BE.Impl".to_string(),
            seconds: 600,
        };
        assert_eq!(err.to_string(), "Node 'BE.Impl' timed out after 600s");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::UnknownDependency {
            node: "QA.Tests".to_string(),
            dependency: "FE.UI".to_string(),
        };
        assert!(err.to_string().contains("QA.Tests"));
        assert!(err.to_string().contains("FE.UI"));
    }

    #[test]
    fn test_bypass_error_display() {
        let err = BypassError::NotBypassable {
            gate: "security_scan".to_string(),
            phase: "deployment".to_string(),
        };
        assert!(err.to_string().contains("not bypassable"));
    }

    #[test]
    fn test_validation_error_converts_into_workflow_error() {
        let err: WorkflowError = ValidationError::EmptyRequirement.into();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }
}
