//! Per-phase deliverable contracts and their version history.
//!
//! A contract declares what a phase must produce (deliverables matched by
//! file patterns, with a minimum quality score) and which personas own the
//! phase. Contracts are immutable: "updating" one appends a new version and
//! old versions remain readable forever.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::{ValidationError, ValidationResult};
use crate::phase::Phase;

/// A named required output of a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deliverable {
    pub name: String,

    /// Case-insensitive glob or substring patterns that identify files
    /// belonging to this deliverable.
    pub patterns: Vec<String>,

    /// Minimum acceptable substance score, in [0, 1].
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,

    /// Optional deliverables do not fail the gate when missing.
    #[serde(default)]
    pub optional: bool,
}

fn default_min_quality() -> f64 {
    0.7
}

impl Deliverable {
    pub fn new(name: &str, patterns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            min_quality: default_min_quality(),
            optional: false,
        }
    }

    pub fn with_min_quality(mut self, min_quality: f64) -> Self {
        self.min_quality = min_quality;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// One immutable version of a phase contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseContract {
    pub phase: Phase,

    /// Monotonic version, assigned by the registry starting at 1.
    pub version: u32,

    pub deliverables: Vec<Deliverable>,

    /// Named quality metrics and their thresholds, evaluated by the exit
    /// gate alongside the policy document.
    #[serde(default)]
    pub quality_metrics: BTreeMap<String, f64>,

    /// Persona ids responsible for producing this phase's deliverables.
    #[serde(default)]
    pub owners: Vec<String>,

    pub created_at: DateTime<Utc>,
}

/// Registry of contract versions, keyed by `(phase, version)`.
#[derive(Default)]
pub struct ContractRegistry {
    inner: RwLock<HashMap<Phase, Vec<PhaseContract>>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the standard lifecycle contracts.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for (phase, deliverables, metrics, owners) in default_contract_table() {
            registry
                .create(phase, deliverables, metrics, owners)
                .unwrap_or_else(|_| unreachable!("default contracts are well-formed"));
        }
        registry
    }

    /// Register a new contract version for a phase.
    ///
    /// Every deliverable name must be unique within the contract.
    pub fn create(
        &self,
        phase: Phase,
        deliverables: Vec<Deliverable>,
        quality_metrics: BTreeMap<String, f64>,
        owners: Vec<String>,
    ) -> ValidationResult<u32> {
        let mut seen = HashSet::new();
        for deliverable in &deliverables {
            if !seen.insert(deliverable.name.clone()) {
                return Err(ValidationError::DuplicateDeliverable(
                    deliverable.name.clone(),
                ));
            }
        }

        let mut inner = self.inner.write();
        let versions = inner.entry(phase).or_default();
        let version = versions.len() as u32 + 1;
        versions.push(PhaseContract {
            phase,
            version,
            deliverables,
            quality_metrics,
            owners,
            created_at: Utc::now(),
        });
        Ok(version)
    }

    /// Fetch a contract; `version = None` returns the latest.
    pub fn get(&self, phase: Phase, version: Option<u32>) -> Option<PhaseContract> {
        let inner = self.inner.read();
        let versions = inner.get(&phase)?;
        match version {
            Some(v) => versions.get(v.checked_sub(1)? as usize).cloned(),
            None => versions.last().cloned(),
        }
    }

    /// All registered versions for a phase, ascending.
    pub fn list_versions(&self, phase: Phase) -> Vec<u32> {
        self.inner
            .read()
            .get(&phase)
            .map(|versions| versions.iter().map(|c| c.version).collect())
            .unwrap_or_default()
    }

    /// Deliverables of the latest contract for a phase.
    pub fn required_deliverables(&self, phase: Phase) -> Vec<Deliverable> {
        self.get(phase, None)
            .map(|c| c.deliverables)
            .unwrap_or_default()
    }

    /// Owner persona ids of the latest contract for a phase.
    pub fn owners(&self, phase: Phase) -> Vec<String> {
        self.get(phase, None).map(|c| c.owners).unwrap_or_default()
    }

    /// Import a previously persisted contract version verbatim.
    ///
    /// Versions must arrive in ascending order per phase.
    pub fn restore(&self, contract: PhaseContract) -> ValidationResult<()> {
        let mut inner = self.inner.write();
        let versions = inner.entry(contract.phase).or_default();
        let expected = versions.len() as u32 + 1;
        if contract.version != expected {
            return Err(ValidationError::Invalid(format!(
                "contract version {} for phase {} arrived out of order (expected {})",
                contract.version, contract.phase, expected
            )));
        }
        versions.push(contract);
        Ok(())
    }
}

type ContractRow = (
    Phase,
    Vec<Deliverable>,
    BTreeMap<String, f64>,
    Vec<String>,
);

/// The standard lifecycle contracts the platform ships with.
fn default_contract_table() -> Vec<ContractRow> {
    vec![
        (
            Phase::Requirements,
            vec![
                Deliverable::new(
                    "requirements_doc",
                    &["*requirements*.md", "*user_stories*.md"],
                ),
                Deliverable::new("acceptance_criteria", &["*acceptance*.md"]).optional(),
            ],
            BTreeMap::new(),
            vec![
                "requirements_analyst".to_string(),
                "product_manager".to_string(),
            ],
        ),
        (
            Phase::Design,
            vec![
                Deliverable::new("design_doc", &["*design*.md", "*architecture*.md"]),
                Deliverable::new(
                    "api_spec",
                    &["*api*.md", "*openapi*.yaml", "*openapi*.yml", "*openapi*.json"],
                )
                .optional(),
            ],
            BTreeMap::new(),
            vec!["solution_architect".to_string()],
        ),
        (
            Phase::Implementation,
            vec![
                Deliverable::new(
                    "source_code",
                    &["*.py", "*.rs", "*.ts", "*.tsx", "*.js", "*.jsx", "*.go", "*.java"],
                ),
                Deliverable::new("readme", &["README*", "*readme*"]).optional(),
            ],
            BTreeMap::from([("test_coverage".to_string(), 0.80)]),
            vec![
                "backend_developer".to_string(),
                "frontend_developer".to_string(),
            ],
        ),
        (
            Phase::Testing,
            vec![
                Deliverable::new("tests", &["*test*", "*spec*", "tests/*"]),
                Deliverable::new("test_report", &["*test_report*", "*test-results*"]).optional(),
            ],
            BTreeMap::from([("test_coverage".to_string(), 0.80)]),
            vec!["qa_engineer".to_string()],
        ),
        (
            Phase::Deployment,
            vec![Deliverable::new(
                "deployment_config",
                &[
                    "Dockerfile",
                    "*docker-compose*",
                    "*.dockerfile",
                    "k8s/*",
                    "*deploy*.yaml",
                    "*deploy*.yml",
                ],
            )],
            BTreeMap::new(),
            vec!["devops_engineer".to_string()],
        ),
    ]
}
