// Maestro: Multi-Agent Software-Delivery Orchestrator
// Core library providing the DAG engine, phase gates, conversation
// substrate, and bypass subsystem.

pub mod api;
pub mod artifacts;
pub mod audit;
pub mod autonomous;
pub mod bypass;
pub mod config;
pub mod contracts;
pub mod conversation;
pub mod dag;
pub mod errors;
pub mod events;
pub mod executor;
pub mod gates;
pub mod groupchat;
pub mod llm;
pub mod manifest;
pub mod persona;
pub mod phase;
pub mod policy;
pub mod snapshot;
pub mod store;
pub mod validator;
pub mod workflow;

// Re-export commonly used types
pub use errors::{
    AuditError, AuditResult, BypassError, BypassResult, ConfigError, ConfigResult,
    ConversationError, ConversationResult, GateError, GroupChatError, GroupChatResult, LlmError,
    LlmResult, PersonaError, PersonaResult, StoreError, StoreResult, ValidationError,
    ValidationResult, WorkflowError, WorkflowResult,
};

pub use phase::Phase;

pub use policy::{
    BypassRequirements, BypassRules, BypassableGate, GateRef, GateSeverity, GateSlo, PhasePolicy,
    PolicyDocument, PolicyLoader,
};

pub use contracts::{ContractRegistry, Deliverable, PhaseContract};

pub use snapshot::FsSnapshot;

pub use validator::{
    ArtifactValidator, DeliverableReport, DeliverableStatus, ProjectType, StubSeverity,
    SubstanceReport, ValidationReport, ValidatorConfig,
};

pub use conversation::{
    Answer, Conversation, ConversationStats, Decision, DependencyNote, DiscussionKind,
    DiscussionNote, Message, MessageKind, MessagePayload, MessageQuery, PersonaWork, Question,
    SystemLevel, SystemNote,
};

pub use groupchat::{
    ConsensusCheck, DiscussionOutcome, DiscussionSynthesis, GroupChatConfig, GroupChatOrchestrator,
    Participant,
};

pub use dag::{NodeConfig, NodeType, RetryPolicy, WorkflowDag, WorkflowNode};

pub use workflow::{
    NodeState, NodeStatus, Workflow, WorkflowContext, WorkflowMetadata, WorkflowStatus,
};

pub use events::{EventBus, EventEnvelope, WorkflowEvent};

pub use executor::{ExecutionReport, ExecutorConfig, NodeOutput, NodeRunner, WorkflowExecutor};

pub use gates::{EntryCheck, GateResult, PhaseGateValidator, Violation, DELIVERABLE_GATE};

pub use bypass::{
    BypassDuration, BypassManager, BypassMetrics, BypassRequest, BypassRequestSpec, BypassStatus,
    RiskAssessment, RiskLevel,
};

pub use artifacts::{ArtifactError, ArtifactMeta, ArtifactResult, ArtifactStore, StampLabels, StampedArtifact};

pub use audit::{AuditEvent, AuditFilter, AuditLog, BYPASS_LOG, WORKFLOW_EVENT_LOG};

pub use persona::{PersonaCatalog, PersonaExecution, PersonaExecutor, PersonaProfile, PersonaTask};

pub use manifest::{ExecutionManifest, ManifestNode, PolicyRef};

pub use autonomous::{
    AutonomousConfig, PhaseOutcome, PhasedAutonomousExecutor, RequirementRunReport,
};

pub use api::{ApiError, ExecuteRequest, ExecuteResponse, ExecutionStatusResponse, WsEventFrame};

pub use config::MaestroConfig;

pub use llm::{CannedBackend, GenerationOptions, LlmBackend, TextStream};

pub use store::SqliteRegistryStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
