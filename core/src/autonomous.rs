//! Phased autonomous executor.
//!
//! The top-level driver: takes a natural-language requirement and walks it
//! through the lifecycle phases. Each phase checks its entry gate, optionally
//! holds a group discussion, runs the persona plan through the DAG executor,
//! resolves pending cross-persona questions, then loops on the exit gate
//! with targeted remediation until it passes, is fully bypassed, or the
//! remediation budget is exhausted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog, BYPASS_LOG, WORKFLOW_EVENT_LOG};
use crate::bypass::BypassManager;
use crate::contracts::ContractRegistry;
use crate::conversation::{Conversation, ConversationStats, Message, SystemLevel};
use crate::dag::{NodeType, WorkflowDag, WorkflowNode};
use crate::errors::{GateError, ValidationError, WorkflowError, WorkflowResult};
use crate::events::EventBus;
use crate::executor::{ExecutorConfig, NodeOutput, NodeRunner, WorkflowExecutor};
use crate::gates::{GateResult, PhaseGateValidator};
use crate::groupchat::{GroupChatOrchestrator, Participant};
use crate::llm::LlmBackend;
use crate::manifest::ExecutionManifest;
use crate::persona::{PersonaExecutor, PersonaTask};
use crate::phase::Phase;
use crate::policy::PolicyLoader;
use crate::store::SqliteRegistryStore;
use crate::workflow::{Workflow, WorkflowContext, WorkflowStatus};

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct AutonomousConfig {
    pub output_dir: PathBuf,
    pub max_remediation_iterations: u32,
    pub enable_discussions: bool,
    pub max_question_resolutions: usize,
    pub executor: ExecutorConfig,
    /// SQLite database for contract history and bypass requests. `None`
    /// keeps all registry state in memory for the lifetime of the process.
    pub registry_db: Option<PathBuf>,
}

impl AutonomousConfig {
    pub fn new(output_dir: &std::path::Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            max_remediation_iterations: 3,
            enable_discussions: false,
            max_question_resolutions: 10,
            executor: ExecutorConfig::default(),
            registry_db: None,
        }
    }
}

/// Gate outcome for one completed phase.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub gate: GateResult,
    pub bypassed: bool,
    pub iterations: u32,
    pub personas_run: Vec<String>,
}

/// Final report of a requirement run.
#[derive(Debug, Clone)]
pub struct RequirementRunReport {
    pub workflow_id: String,
    pub iteration_id: String,
    pub status: WorkflowStatus,
    pub phases: Vec<PhaseOutcome>,
    pub conversation_stats: ConversationStats,
}

/// Runs persona nodes for one phase on behalf of the DAG executor.
struct PersonaNodeRunner {
    phase: Phase,
    personas: Arc<PersonaExecutor>,
    conversation: Arc<Conversation>,
}

#[async_trait]
impl NodeRunner for PersonaNodeRunner {
    async fn run(&self, node: &WorkflowNode, ctx: &WorkflowContext) -> WorkflowResult<NodeOutput> {
        let persona_id = node.config.persona_id.clone().ok_or_else(|| {
            WorkflowError::NodeFailure {
                node_id: node.id.clone(),
                reason: "node has no persona assigned".to_string(),
            }
        })?;
        let task = PersonaTask {
            persona_id,
            phase: self.phase,
            node_id: node.id.clone(),
            capability: node.config.capability.clone(),
            contract_version: node.config.contract_version,
        };
        let execution = self
            .personas
            .run(&task, ctx, &self.conversation)
            .await
            .map_err(|e| WorkflowError::NodeFailure {
                node_id: node.id.clone(),
                reason: e.to_string(),
            })?;

        let mut outputs = BTreeMap::new();
        outputs.insert("message_id".to_string(), json!(execution.message_id));
        outputs.insert("files_created".to_string(), json!(execution.files_created));
        Ok(NodeOutput {
            outputs,
            artifacts: execution.artifacts.iter().map(|a| a.id.clone()).collect(),
            agent: Some(execution.persona_id),
        })
    }
}

/// Composes the engine, gates, personas, group chat, and bypass subsystems.
pub struct PhasedAutonomousExecutor {
    backend: Arc<dyn LlmBackend>,
    registry: Arc<ContractRegistry>,
    gates: PhaseGateValidator,
    bypass: Arc<BypassManager>,
    personas: Arc<PersonaExecutor>,
    groupchat: GroupChatOrchestrator,
    conversation: Arc<Conversation>,
    audit: Arc<AuditLog>,
    engine: WorkflowExecutor,
    store: Option<SqliteRegistryStore>,
    config: AutonomousConfig,
}

impl PhasedAutonomousExecutor {
    /// Build the executor. When `config.registry_db` is set, the store is
    /// opened here: persisted contract versions and bypass requests are
    /// restored before the first run, and the current contract history is
    /// written back so a fresh database starts populated.
    pub async fn new(
        backend: Arc<dyn LlmBackend>,
        policy: Arc<PolicyLoader>,
        config: AutonomousConfig,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(ContractRegistry::with_defaults());
        let audit = Arc::new(
            AuditLog::open(&config.output_dir.join(BYPASS_LOG))
                .context("failed to open gate audit log")?,
        );
        let bypass = Arc::new(BypassManager::new(Arc::clone(&policy), Arc::clone(&audit)));

        let store = match &config.registry_db {
            Some(path) => Some(
                SqliteRegistryStore::new(path)
                    .await
                    .with_context(|| format!("failed to open registry store {}", path.display()))?,
            ),
            None => None,
        };
        if let Some(store) = &store {
            store
                .hydrate_registry(&registry)
                .await
                .context("failed to restore contract history")?;
            store
                .save_registry(&registry)
                .await
                .context("failed to persist contract history")?;
            bypass.import(
                store
                    .load_bypasses()
                    .await
                    .context("failed to restore bypass requests")?,
            );
        }

        let gates = PhaseGateValidator::new(Arc::clone(&policy), Arc::clone(&registry));
        let personas = Arc::new(PersonaExecutor::new(
            Arc::clone(&backend),
            Arc::clone(&registry),
        ));
        let groupchat = GroupChatOrchestrator::new(Arc::clone(&backend));
        let conversation = Arc::new(
            Conversation::new().with_mirror(&config.output_dir.join("conversation.json")),
        );
        let mut executor_config = config.executor.clone();
        if executor_config.event_log.is_none() {
            executor_config.event_log = Some(config.output_dir.join(WORKFLOW_EVENT_LOG));
        }
        let engine = WorkflowExecutor::new(executor_config);

        Ok(Self {
            backend,
            registry,
            gates,
            bypass,
            personas,
            groupchat,
            conversation,
            audit,
            engine,
            store,
            config,
        })
    }

    /// Flush the current bypass-request state to the registry store.
    ///
    /// Runs automatically after every gate/bypass evaluation and at the end
    /// of a run; external surfaces that approve or reject through
    /// [`PhasedAutonomousExecutor::bypass_manager`] should call it after
    /// their own transitions.
    pub async fn persist_bypasses(&self) -> anyhow::Result<()> {
        if let Some(store) = &self.store {
            store
                .sync_bypasses(&self.bypass)
                .await
                .context("failed to persist bypass requests")?;
        }
        Ok(())
    }

    pub fn bypass_manager(&self) -> &Arc<BypassManager> {
        &self.bypass
    }

    pub fn conversation(&self) -> &Arc<Conversation> {
        &self.conversation
    }

    pub fn registry(&self) -> &Arc<ContractRegistry> {
        &self.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        self.engine.event_bus()
    }

    /// Execute a requirement through the full phase sequence.
    pub async fn execute_requirement(
        &self,
        requirement: &str,
        manifest: Option<&ExecutionManifest>,
    ) -> anyhow::Result<RequirementRunReport> {
        if requirement.trim().is_empty() {
            return Err(ValidationError::EmptyRequirement.into());
        }
        if let Some(manifest) = manifest {
            manifest.validate().context("manifest validation failed")?;
        }

        let iteration_id = manifest
            .map(|m| m.iteration_id.clone())
            .unwrap_or_else(|| format!("iter-{}", short_id()));
        let workflow_id = format!("wf-{}", short_id());
        let ctx = Arc::new(WorkflowContext::new(
            requirement,
            &iteration_id,
            &self.config.output_dir,
        ));

        info!(%workflow_id, %iteration_id, "starting requirement run");
        self.audit_event(
            AuditEvent::new("requirement_accepted", "orchestrator")
                .with_workflow(&workflow_id)
                .with_payload(json!({ "requirement": requirement })),
        )?;

        let mut phases = Vec::new();
        for phase in Phase::sequence() {
            let outcome = self
                .run_phase(phase, &workflow_id, manifest, &ctx)
                .await
                .with_context(|| format!("phase {} failed", phase))?;
            phases.push(outcome);

            if ctx.is_cancelled() {
                self.audit_event(
                    AuditEvent::new("workflow_cancelled", "orchestrator")
                        .with_workflow(&workflow_id),
                )?;
                return Err(WorkflowError::Cancelled.into());
            }
        }

        self.persist_bypasses().await?;
        self.audit_event(
            AuditEvent::new("workflow_completed", "orchestrator")
                .with_workflow(&workflow_id)
                .with_payload(json!({ "phases": phases.len() })),
        )?;
        info!(%workflow_id, "requirement run completed");

        Ok(RequirementRunReport {
            workflow_id,
            iteration_id,
            status: WorkflowStatus::Completed,
            phases,
            conversation_stats: self.conversation.summary_stats(),
        })
    }

    async fn run_phase(
        &self,
        phase: Phase,
        workflow_id: &str,
        manifest: Option<&ExecutionManifest>,
        ctx: &Arc<WorkflowContext>,
    ) -> anyhow::Result<PhaseOutcome> {
        let entry = self.gates.entry_gate(phase, ctx)?;
        if !entry.pass {
            let detail = entry
                .violations
                .iter()
                .map(|v| v.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            self.audit_event(
                AuditEvent::new("entry_gate_failed", "orchestrator")
                    .with_workflow(workflow_id)
                    .with_phase(phase)
                    .with_payload(json!({ "violations": detail })),
            )?;
            return Err(GateError::EntryGateFailed {
                phase: phase.to_string(),
                detail,
            }
            .into());
        }

        let plan = self.persona_plan(phase, manifest);
        info!(%phase, personas = ?plan, "phase started");

        if self.config.enable_discussions && plan.len() >= 2 {
            let participants: Vec<Participant> = plan
                .iter()
                .filter_map(|id| self.personas.catalog().get(id))
                .map(|p| Participant::new(&p.id, &p.expertise.join(", ")))
                .collect();
            if participants.len() >= 2 {
                self.groupchat
                    .run_discussion(
                        &self.conversation,
                        phase,
                        &format!("{} approach for: {}", phase, ctx.requirement),
                        &ctx.requirement,
                        &participants,
                    )
                    .await?;
            }
        }

        self.run_personas(phase, workflow_id, &plan, ctx).await?;

        self.groupchat
            .resolve_pending_questions(&self.conversation, phase, self.config.max_question_resolutions)
            .await?;

        // Remediation loop: re-evaluate the gate, re-invoking the phase
        // owners with the gate's recommendations until it passes or the
        // budget runs out.
        let max_iterations = self.config.max_remediation_iterations.max(1);
        let mut final_gate: Option<(GateResult, bool)> = None;
        for iteration in 1..=max_iterations {
            let measured = self.measured_metrics(phase, ctx);
            let result = self
                .gates
                .exit_gate(phase, &ctx.output_dir, iteration, &measured)?;
            self.audit_event(
                AuditEvent::new("gate_evaluated", "orchestrator")
                    .with_workflow(workflow_id)
                    .with_phase(phase)
                    .with_payload(json!({
                        "iteration": iteration,
                        "passed": result.passed,
                        "score": result.score,
                        "violations": result.violations.len(),
                    })),
            )?;

            if result.passed {
                final_gate = Some((result, false));
                break;
            }
            let covered = self
                .gates
                .all_blocking_bypassed(&result, &self.bypass, workflow_id)?;
            // The coverage check may have applied or expired requests.
            self.persist_bypasses().await?;
            if covered {
                info!(%phase, "blocking violations covered by bypass");
                final_gate = Some((result, true));
                break;
            }
            if iteration == max_iterations {
                final_gate = Some((result, false));
                break;
            }

            warn!(%phase, iteration, "exit gate failed, remediating");
            self.audit_event(
                AuditEvent::new("remediation_started", "orchestrator")
                    .with_workflow(workflow_id)
                    .with_phase(phase)
                    .with_payload(json!({ "iteration": iteration })),
            )?;
            self.conversation.append(Message::system(
                phase,
                SystemLevel::Warning,
                &format!(
                    "Exit gate failed (iteration {}). Remediation needed:\n{}",
                    iteration,
                    result.recommendations.join("\n")
                ),
            ))?;
            let targets = self.remediation_targets(phase, &result, &plan);
            self.run_personas(phase, workflow_id, &targets, ctx).await?;
        }

        let (gate, bypassed) = final_gate.unwrap_or_else(|| unreachable!("loop always sets gate"));
        if !(gate.passed || bypassed) {
            self.audit_event(
                AuditEvent::new("workflow_failed", "orchestrator")
                    .with_workflow(workflow_id)
                    .with_phase(phase)
                    .with_payload(json!({ "reason": "gate_unmet" })),
            )?;
            return Err(GateError::RemediationExhausted {
                phase: phase.to_string(),
                iterations: max_iterations,
            }
            .into());
        }

        Ok(PhaseOutcome {
            phase,
            iterations: gate.iteration,
            gate,
            bypassed,
            personas_run: plan,
        })
    }

    /// Run personas for a phase as a workflow: one action node per persona,
    /// chained so no persona runs twice concurrently within the phase.
    async fn run_personas(
        &self,
        phase: Phase,
        workflow_id: &str,
        plan: &[String],
        ctx: &Arc<WorkflowContext>,
    ) -> anyhow::Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        let mut dag = WorkflowDag::new();
        let mut previous: Option<String> = None;
        for persona_id in plan {
            let node_id = format!("{}.{}", phase, persona_id);
            let mut node = WorkflowNode::new(&node_id, NodeType::Action).with_persona(persona_id);
            if let Some(prev) = &previous {
                node = node.with_dependency(prev);
            }
            node.config.timeout_secs = Some(self.config.executor.default_timeout_secs);
            dag.add_node(node)?;
            previous = Some(node_id);
        }
        let workflow = Workflow::new(
            &format!("{}:{}", workflow_id, phase),
            dag,
            &ctx.iteration_id,
            &ctx.requirement,
        );
        let runner = Arc::new(PersonaNodeRunner {
            phase,
            personas: Arc::clone(&self.personas),
            conversation: Arc::clone(&self.conversation),
        });

        let report = self.engine.execute(&workflow, Arc::clone(ctx), runner).await?;
        match report.status {
            WorkflowStatus::Completed => Ok(()),
            WorkflowStatus::Cancelled => Err(WorkflowError::Cancelled.into()),
            _ => {
                let reason = report
                    .node_states
                    .values()
                    .find_map(|s| s.reason.clone())
                    .unwrap_or_else(|| "persona execution failed".to_string());
                Err(WorkflowError::NodeFailure {
                    node_id: format!("{}", phase),
                    reason,
                }
                .into())
            }
        }
    }

    /// Contract owners plus capability-routed additions from the manifest.
    fn persona_plan(&self, phase: Phase, manifest: Option<&ExecutionManifest>) -> Vec<String> {
        let mut plan = self.registry.owners(phase);
        if let Some(manifest) = manifest {
            for node in &manifest.nodes {
                if let (Some(persona), Some(capability)) = (&node.persona, &node.capability) {
                    if capability.to_lowercase().contains(phase.as_str())
                        && !plan.contains(persona)
                    {
                        plan.push(persona.clone());
                    }
                }
            }
        }
        plan.retain(|id| {
            let known = self.personas.catalog().get(id).is_some();
            if !known {
                warn!(persona = %id, "persona not in catalog, dropped from plan");
            }
            known
        });
        plan
    }

    /// Personas re-invoked to fix a failed gate. Violations name
    /// deliverables, and every deliverable belongs to the phase contract
    /// the plan's owners are responsible for, so the full plan re-runs with
    /// the recommendations in its context.
    fn remediation_targets(
        &self,
        _phase: Phase,
        _result: &GateResult,
        plan: &[String],
    ) -> Vec<String> {
        plan.to_vec()
    }

    /// Quality metric values measured so far, from the shared context.
    fn measured_metrics(&self, phase: Phase, ctx: &WorkflowContext) -> BTreeMap<String, f64> {
        let mut measured = BTreeMap::new();
        if let Some(contract) = self.registry.get(phase, None) {
            for metric in contract.quality_metrics.keys() {
                if let Some(value) = ctx.metric(metric) {
                    measured.insert(metric.clone(), value);
                }
            }
        }
        measured
    }

    fn audit_event(&self, event: AuditEvent) -> anyhow::Result<()> {
        self.audit.append(&event).context("audit append failed")
    }

    /// Backend identifier, exposed for logs and reports.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}
