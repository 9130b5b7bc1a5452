//! Persona execution.
//!
//! A persona is a role-specialized agent backed by the LLM collaborator.
//! Running one takes a filesystem snapshot, prompts the backend with the
//! requirement, contract deliverables, and conversation context, diffs the
//! output directory to find produced files, stamps them into the canonical
//! artifact tree, extracts a structured work summary with a second schema'd
//! prompt (falling back to a minimal file-list summary), and appends the
//! persona-work message to the shared conversation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactStore, StampLabels, StampedArtifact};
use crate::contracts::ContractRegistry;
use crate::conversation::{Conversation, Message, MessagePayload, PersonaWork};
use crate::errors::{PersonaError, PersonaResult};
use crate::llm::{extract_json, GenerationOptions, LlmBackend};
use crate::phase::Phase;
use crate::snapshot::FsSnapshot;
use crate::workflow::WorkflowContext;

/// A role-specialized agent definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub id: String,
    pub role: String,
    pub expertise: Vec<String>,
    pub system_prompt: String,
}

impl PersonaProfile {
    pub fn new(id: &str, role: &str, expertise: &[&str], system_prompt: &str) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            expertise: expertise.iter().map(|e| e.to_string()).collect(),
            system_prompt: system_prompt.to_string(),
        }
    }
}

/// The persona roster available to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct PersonaCatalog {
    personas: BTreeMap<String, PersonaProfile>,
}

impl PersonaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard roster owning the default lifecycle contracts.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        for profile in default_personas() {
            catalog.add(profile);
        }
        catalog
    }

    pub fn add(&mut self, profile: PersonaProfile) {
        self.personas.insert(profile.id.clone(), profile);
    }

    pub fn get(&self, id: &str) -> Option<&PersonaProfile> {
        self.personas.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.personas.keys().cloned().collect()
    }

    /// Personas advertising the given capability in their expertise.
    pub fn with_capability(&self, capability: &str) -> Vec<String> {
        let needle = capability.to_lowercase();
        self.personas
            .values()
            .filter(|p| p.expertise.iter().any(|e| e.to_lowercase().contains(&needle)))
            .map(|p| p.id.clone())
            .collect()
    }
}

fn default_personas() -> Vec<PersonaProfile> {
    vec![
        PersonaProfile::new(
            "requirements_analyst",
            "Requirements Analyst",
            &["requirements elicitation", "user stories", "acceptance criteria"],
            "You analyze raw requirements into precise, testable user stories. \
             Write requirements documents in markdown.",
        ),
        PersonaProfile::new(
            "product_manager",
            "Product Manager",
            &["product scope", "prioritization", "stakeholder alignment"],
            "You own product scope and priorities. Challenge ambiguity and keep \
             the requirement set minimal and coherent.",
        ),
        PersonaProfile::new(
            "solution_architect",
            "Solution Architect",
            &["system design", "api design", "architecture trade-offs"],
            "You design the system architecture. Produce design documents and \
             API specifications with explicit trade-offs.",
        ),
        PersonaProfile::new(
            "backend_developer",
            "Backend Developer",
            &["backend services", "data modeling", "api implementation"],
            "You implement backend services and data models following the agreed \
             design. Write production-quality code, not stubs.",
        ),
        PersonaProfile::new(
            "frontend_developer",
            "Frontend Developer",
            &["ui components", "frontend state", "accessibility"],
            "You implement user interfaces against the locked API contract.",
        ),
        PersonaProfile::new(
            "qa_engineer",
            "QA Engineer",
            &["test design", "test automation", "coverage analysis"],
            "You write tests for the implemented system and report coverage gaps.",
        ),
        PersonaProfile::new(
            "devops_engineer",
            "DevOps Engineer",
            &["deployment", "containers", "ci-cd"],
            "You produce deployment configuration for the implemented system.",
        ),
    ]
}

/// What to run: persona, phase, and artifact provenance labels.
#[derive(Debug, Clone)]
pub struct PersonaTask {
    pub persona_id: String,
    pub phase: Phase,
    pub node_id: String,
    pub capability: Option<String>,
    pub contract_version: Option<u32>,
}

/// Record of a completed persona execution.
#[derive(Debug, Clone)]
pub struct PersonaExecution {
    pub persona_id: String,
    pub node_id: String,
    pub message_id: Uuid,
    pub files_created: Vec<PathBuf>,
    pub artifacts: Vec<StampedArtifact>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Runs personas against the LLM collaborator.
pub struct PersonaExecutor {
    backend: Arc<dyn LlmBackend>,
    registry: Arc<ContractRegistry>,
    catalog: PersonaCatalog,
}

impl PersonaExecutor {
    pub fn new(backend: Arc<dyn LlmBackend>, registry: Arc<ContractRegistry>) -> Self {
        Self {
            backend,
            registry,
            catalog: PersonaCatalog::with_defaults(),
        }
    }

    pub fn with_catalog(mut self, catalog: PersonaCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn catalog(&self) -> &PersonaCatalog {
        &self.catalog
    }

    /// Execute one persona for one node.
    pub async fn run(
        &self,
        task: &PersonaTask,
        ctx: &WorkflowContext,
        conversation: &Conversation,
    ) -> PersonaResult<PersonaExecution> {
        let profile = self
            .catalog
            .get(&task.persona_id)
            .ok_or_else(|| PersonaError::UnknownPersona(task.persona_id.clone()))?;
        let started_at = Utc::now();
        let started = std::time::Instant::now();

        let pre = FsSnapshot::capture(&ctx.output_dir)?;
        let prompt = self.build_prompt(profile, task, ctx, conversation);
        debug!(persona = %task.persona_id, phase = %task.phase, "invoking backend");
        let response = self
            .backend
            .generate_text(&prompt, &GenerationOptions::default())
            .await?;

        let post = FsSnapshot::capture(&ctx.output_dir)?;
        let files_created: Vec<PathBuf> = pre
            .diff(&post)
            .into_iter()
            .filter(|p| !p.starts_with("artifacts") && !p.starts_with("logs"))
            .collect();

        let store = ArtifactStore::new(&ctx.output_dir);
        let labels = StampLabels {
            capability: task.capability.clone(),
            contract_version: task.contract_version,
        };
        let mut artifacts = Vec::new();
        for file in &files_created {
            let stamped = store
                .stamp(&ctx.iteration_id, &task.node_id, &ctx.output_dir.join(file), &labels)
                .map_err(|e| PersonaError::Artifact(e.to_string()))?;
            artifacts.push(stamped);
        }

        let work = self
            .extract_work(profile, task, &response, &files_created)
            .await;
        let message = Message::new(
            &task.persona_id,
            task.phase,
            MessagePayload::PersonaWork(work),
        );
        let message_id = conversation.append(message)?;

        let completed_at = Utc::now();
        let execution = PersonaExecution {
            persona_id: task.persona_id.clone(),
            node_id: task.node_id.clone(),
            message_id,
            files_created,
            artifacts,
            started_at,
            completed_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            persona = %task.persona_id,
            node = %task.node_id,
            files = execution.files_created.len(),
            duration_ms = execution.duration_ms,
            "persona execution finished"
        );
        Ok(execution)
    }

    fn build_prompt(
        &self,
        profile: &PersonaProfile,
        task: &PersonaTask,
        ctx: &WorkflowContext,
        conversation: &Conversation,
    ) -> String {
        let deliverables = self.registry.required_deliverables(task.phase);
        let deliverable_lines = if deliverables.is_empty() {
            "- (none declared)".to_string()
        } else {
            deliverables
                .iter()
                .map(|d| {
                    format!(
                        "- {}{} (patterns: {})",
                        d.name,
                        if d.optional { " [optional]" } else { "" },
                        d.patterns.join(", ")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        let context = conversation.context_for(&task.persona_id, Some(10));

        format!(
            "{system}\n\n\
             Role: {role}\n\
             Expertise: {expertise}\n\n\
             Requirement:\n{requirement}\n\n\
             Current phase: {phase}\n\
             Deliverables expected from this phase:\n{deliverables}\n\n\
             {context}\n\
             Work on the {phase} phase now. Write your deliverables as files \
             under the working directory, using the deliverable names above as \
             guidance for file naming.",
            system = profile.system_prompt,
            role = profile.role,
            expertise = profile.expertise.join(", "),
            requirement = ctx.requirement,
            phase = task.phase,
            deliverables = deliverable_lines,
            context = context,
        )
    }

    /// Ask the backend to structure its own work into a persona-work record;
    /// fall back to a minimal file-list summary when extraction fails.
    async fn extract_work(
        &self,
        profile: &PersonaProfile,
        task: &PersonaTask,
        response: &str,
        files_created: &[PathBuf],
    ) -> PersonaWork {
        let prompt = format!(
            "Summarize the work you just did as persona '{id}' in the {phase} phase.\n\
             Your raw output was:\n---\n{response}\n---\n\
             Files created: {files:?}\n\n\
             Respond with JSON only, matching exactly this schema:\n\
             {{\"summary\": string, \
               \"decisions\": [{{\"decision\": string, \"rationale\": string, \
                 \"alternatives\": [string], \"trade_offs\": string}}], \
               \"deliverables\": {{string: [string]}}, \
               \"questions\": [{{\"for\": string, \"question\": string, \"context\": string}}], \
               \"assumptions\": [string], \
               \"concerns\": [string]}}",
            id = profile.id,
            phase = task.phase,
            response = response,
            files = files_created,
        );

        let fallback = |reason: &str| {
            warn!(persona = %task.persona_id, reason, "work extraction failed, using minimal summary");
            PersonaWork {
                summary: format!(
                    "{} completed {} phase work ({} file(s) produced)",
                    task.persona_id,
                    task.phase,
                    files_created.len()
                ),
                files_created: files_created.to_vec(),
                ..Default::default()
            }
        };

        let extracted = match self
            .backend
            .generate_text(&prompt, &GenerationOptions::default())
            .await
        {
            Ok(text) => text,
            Err(error) => return fallback(&error.to_string()),
        };
        let Some(value) = extract_json(&extracted) else {
            return fallback("no JSON object in extraction response");
        };
        match serde_json::from_value::<PersonaWork>(value) {
            Ok(mut work) => {
                work.files_created = files_created.to_vec();
                work
            }
            Err(error) => fallback(&error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::MessageKind;
    use crate::conversation::MessageQuery;
    use crate::errors::{LlmError, LlmResult};
    use crate::llm::TextStream;
    use async_trait::async_trait;

    /// Canned backend that also drops a file into the output directory on
    /// its first call, like a real collaborator writing deliverables.
    struct WritingBackend {
        output_dir: PathBuf,
        file_name: String,
        content: String,
        extraction: Option<String>,
        calls: parking_lot::Mutex<u32>,
    }

    #[async_trait]
    impl crate::llm::LlmBackend for WritingBackend {
        fn name(&self) -> &str {
            "writing-canned"
        }

        async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> LlmResult<TextStream> {
            let mut calls = self.calls.lock();
            *calls += 1;
            let response = if prompt.contains("Respond with JSON only") {
                match &self.extraction {
                    Some(json) => json.clone(),
                    None => return Err(LlmError::BackendError("no extraction".to_string())),
                }
            } else {
                std::fs::create_dir_all(&self.output_dir).unwrap();
                std::fs::write(self.output_dir.join(&self.file_name), &self.content).unwrap();
                "Wrote the requirements document.".to_string()
            };
            let stream = async_stream::stream! { yield Ok(response); };
            Ok(Box::pin(stream))
        }
    }

    fn task() -> PersonaTask {
        PersonaTask {
            persona_id: "requirements_analyst".to_string(),
            phase: Phase::Requirements,
            node_id: "REQ.Analysis".to_string(),
            capability: Some("requirements".to_string()),
            contract_version: Some(1),
        }
    }

    #[tokio::test]
    async fn test_run_snapshots_stamps_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(WritingBackend {
            output_dir: dir.path().to_path_buf(),
            file_name: "requirements.md".to_string(),
            content: "# Requirements\nusers can order\n".to_string(),
            extraction: Some(
                r#"{"summary": "Captured ordering requirements", "decisions": [],
                    "deliverables": {"requirements_doc": ["requirements.md"]},
                    "questions": [], "assumptions": ["single currency"], "concerns": []}"#
                    .to_string(),
            ),
            calls: parking_lot::Mutex::new(0),
        });
        let registry = Arc::new(ContractRegistry::with_defaults());
        let executor = PersonaExecutor::new(backend, registry);
        let ctx = WorkflowContext::new("order system", "iter-1", dir.path());
        let conversation = Conversation::new();

        let execution = executor.run(&task(), &ctx, &conversation).await.unwrap();

        assert_eq!(execution.files_created, vec![PathBuf::from("requirements.md")]);
        assert_eq!(execution.artifacts.len(), 1);
        assert_eq!(
            execution.artifacts[0].id,
            "iter-1/REQ.Analysis/requirements.md"
        );
        assert!(dir
            .path()
            .join("artifacts/iter-1/REQ.Analysis/requirements.md")
            .exists());
        assert!(dir
            .path()
            .join("artifacts/iter-1/REQ.Analysis/requirements.md.meta.json")
            .exists());

        let work_messages = conversation.filter(&MessageQuery::new().kind(MessageKind::PersonaWork));
        assert_eq!(work_messages.len(), 1);
        if let MessagePayload::PersonaWork(work) = &work_messages[0].payload {
            assert_eq!(work.summary, "Captured ordering requirements");
            assert_eq!(work.assumptions, vec!["single currency"]);
            assert_eq!(work.files_created, vec![PathBuf::from("requirements.md")]);
        } else {
            panic!("expected persona work message");
        }
        assert!(execution.started_at <= execution.completed_at);
    }

    #[tokio::test]
    async fn test_extraction_failure_falls_back_to_minimal_summary() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(WritingBackend {
            output_dir: dir.path().to_path_buf(),
            file_name: "requirements.md".to_string(),
            content: "content".to_string(),
            extraction: Some("I cannot produce JSON right now.".to_string()),
            calls: parking_lot::Mutex::new(0),
        });
        let registry = Arc::new(ContractRegistry::with_defaults());
        let executor = PersonaExecutor::new(backend, registry);
        let ctx = WorkflowContext::new("req", "iter-2", dir.path());
        let conversation = Conversation::new();

        executor.run(&task(), &ctx, &conversation).await.unwrap();

        let messages = conversation.messages();
        if let MessagePayload::PersonaWork(work) = &messages[0].payload {
            assert!(work.summary.contains("requirements_analyst"));
            assert!(work.summary.contains("1 file(s)"));
            assert_eq!(work.files_created, vec![PathBuf::from("requirements.md")]);
        } else {
            panic!("expected persona work message");
        }
    }

    #[tokio::test]
    async fn test_unknown_persona_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(crate::llm::CannedBackend::new());
        let registry = Arc::new(ContractRegistry::with_defaults());
        let executor = PersonaExecutor::new(backend, registry);
        let ctx = WorkflowContext::new("req", "iter", dir.path());
        let conversation = Conversation::new();

        let mut bad_task = task();
        bad_task.persona_id = "nonexistent".to_string();
        let err = executor.run(&bad_task, &ctx, &conversation).await.unwrap_err();
        assert!(matches!(err, PersonaError::UnknownPersona(_)));
    }

    #[test]
    fn test_catalog_capability_routing() {
        let catalog = PersonaCatalog::with_defaults();
        let designers = catalog.with_capability("api design");
        assert!(designers.contains(&"solution_architect".to_string()));
        assert!(!designers.contains(&"qa_engineer".to_string()));
    }

    #[test]
    fn test_catalog_defaults_cover_contract_owners() {
        let catalog = PersonaCatalog::with_defaults();
        let registry = ContractRegistry::with_defaults();
        for phase in Phase::sequence() {
            for owner in registry.owners(phase) {
                assert!(
                    catalog.get(&owner).is_some(),
                    "contract owner {} missing from catalog",
                    owner
                );
            }
        }
    }

    #[test]
    fn test_prompt_contains_deliverables_and_context() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ContractRegistry::with_defaults());
        let executor = PersonaExecutor::new(Arc::new(crate::llm::CannedBackend::new()), registry);
        let ctx = WorkflowContext::new("build an order api", "iter", dir.path());
        let conversation = Conversation::new();
        let profile = executor.catalog().get("requirements_analyst").unwrap().clone();

        let prompt = executor.build_prompt(&profile, &task(), &ctx, &conversation);
        assert!(prompt.contains("requirements_doc"));
        assert!(prompt.contains("build an order api"));
        assert!(prompt.contains("Requirements Analyst"));
    }
}
