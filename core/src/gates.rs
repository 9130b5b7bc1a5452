//! Phase entry/exit gates.
//!
//! A phase only advances when its exit gate passes: every required
//! deliverable present and above its quality floor, and every measured
//! quality metric above the policy threshold. Violations carry the severity
//! the policy assigns to their gate; any blocking violation fails the gate
//! unless an approved bypass covers it. Gate evaluation is a pure function
//! of the output directory, the contract, and the policy, so re-running it
//! on an unchanged directory yields the same result.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bypass::BypassManager;
use crate::contracts::ContractRegistry;
use crate::errors::{BypassResult, GateError};
use crate::phase::Phase;
use crate::policy::{GateSeverity, PolicyLoader};
use crate::validator::{ArtifactValidator, DeliverableStatus};
use crate::workflow::WorkflowContext;

/// Gate name used for deliverable presence/quality checks.
pub const DELIVERABLE_GATE: &str = "deliverable_quality";

/// One gate violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub gate: String,
    pub severity: GateSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliverable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<f64>,
}

/// Result of an exit-gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub phase: Phase,
    pub iteration: u32,
    pub passed: bool,
    pub score: f64,
    pub violations: Vec<Violation>,
    pub recommendations: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl GateResult {
    pub fn blocking_violations(&self) -> Vec<&Violation> {
        self.violations
            .iter()
            .filter(|v| v.severity == GateSeverity::Blocking)
            .collect()
    }
}

/// Result of an entry-gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryCheck {
    pub phase: Phase,
    pub pass: bool,
    pub violations: Vec<Violation>,
}

/// Evaluates phase gates from contracts, policy, and the artifact validator.
pub struct PhaseGateValidator {
    policy: Arc<PolicyLoader>,
    registry: Arc<ContractRegistry>,
    validator: ArtifactValidator,
}

impl PhaseGateValidator {
    pub fn new(policy: Arc<PolicyLoader>, registry: Arc<ContractRegistry>) -> Self {
        Self {
            policy,
            registry,
            validator: ArtifactValidator::new(),
        }
    }

    pub fn with_validator(mut self, validator: ArtifactValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Check that the predecessor phase's artifacts exist and meet their
    /// contract. The first phase has no predecessor and passes vacuously.
    pub fn entry_gate(&self, phase: Phase, ctx: &WorkflowContext) -> Result<EntryCheck, GateError> {
        let Some(predecessor) = phase.predecessor() else {
            return Ok(EntryCheck {
                phase,
                pass: true,
                violations: Vec::new(),
            });
        };
        let Some(contract) = self.registry.get(predecessor, None) else {
            debug!(%phase, %predecessor, "no predecessor contract, entry gate passes");
            return Ok(EntryCheck {
                phase,
                pass: true,
                violations: Vec::new(),
            });
        };

        let report = self.validator.validate(&contract, &ctx.output_dir, None)?;
        let violations = self.deliverable_violations(predecessor, &report);
        let pass = !violations
            .iter()
            .any(|v| v.severity == GateSeverity::Blocking);
        if !pass {
            warn!(%phase, %predecessor, violations = violations.len(), "entry gate failed");
        }
        Ok(EntryCheck {
            phase,
            pass,
            violations,
        })
    }

    /// Evaluate the exit gate for `phase` against the output directory and
    /// externally measured quality metrics (e.g. test coverage).
    pub fn exit_gate(
        &self,
        phase: Phase,
        output_dir: &Path,
        iteration: u32,
        measured: &BTreeMap<String, f64>,
    ) -> Result<GateResult, GateError> {
        let contract = self
            .registry
            .get(phase, None)
            .ok_or_else(|| GateError::MissingContract(phase.to_string()))?;

        let report = self.validator.validate(&contract, output_dir, None)?;
        let mut violations = self.deliverable_violations(phase, &report);

        for (metric, _contract_threshold) in &contract.quality_metrics {
            let required = self.policy.threshold(phase, metric);
            let severity = self.policy.severity(phase, metric);
            match measured.get(metric) {
                Some(value) if *value < required => {
                    violations.push(Violation {
                        gate: metric.clone(),
                        severity,
                        message: format!(
                            "{} is {:.2}, required {:.2}",
                            metric, value, required
                        ),
                        deliverable: None,
                        current: Some(*value),
                        required: Some(required),
                    });
                }
                Some(_) => {}
                None => {
                    debug!(%phase, metric, "quality metric not measured, skipping");
                }
            }
        }

        let recommendations = self.recommendations(&violations, &report);
        let passed = !violations
            .iter()
            .any(|v| v.severity == GateSeverity::Blocking);

        let result = GateResult {
            phase,
            iteration,
            passed,
            score: report.quality_score,
            violations,
            recommendations,
            evaluated_at: Utc::now(),
        };
        info!(
            %phase,
            iteration,
            passed = result.passed,
            score = result.score,
            violations = result.violations.len(),
            "exit gate evaluated"
        );
        Ok(result)
    }

    /// Whether every blocking violation in `result` is covered by an
    /// approved bypass for this workflow.
    pub fn all_blocking_bypassed(
        &self,
        result: &GateResult,
        bypass: &BypassManager,
        workflow_id: &str,
    ) -> BypassResult<bool> {
        let blocking = result.blocking_violations();
        if blocking.is_empty() {
            return Ok(true);
        }
        for violation in blocking {
            if !bypass.covers(workflow_id, result.phase, &violation.gate)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn deliverable_violations(
        &self,
        phase: Phase,
        report: &crate::validator::ValidationReport,
    ) -> Vec<Violation> {
        let severity = self.policy.severity(phase, DELIVERABLE_GATE);
        let mut violations = Vec::new();
        for deliverable in &report.deliverables {
            if deliverable.optional {
                continue;
            }
            match deliverable.status {
                DeliverableStatus::Satisfied => {}
                DeliverableStatus::Missing => violations.push(Violation {
                    gate: DELIVERABLE_GATE.to_string(),
                    severity,
                    message: format!("deliverable '{}' is missing", deliverable.name),
                    deliverable: Some(deliverable.name.clone()),
                    current: Some(0.0),
                    required: Some(deliverable.min_quality),
                }),
                DeliverableStatus::BelowThreshold => violations.push(Violation {
                    gate: DELIVERABLE_GATE.to_string(),
                    severity,
                    message: format!(
                        "deliverable '{}' scored {:.2}, required {:.2}",
                        deliverable.name, deliverable.score, deliverable.min_quality
                    ),
                    deliverable: Some(deliverable.name.clone()),
                    current: Some(deliverable.score),
                    required: Some(deliverable.min_quality),
                }),
            }
        }
        violations
    }

    fn recommendations(
        &self,
        violations: &[Violation],
        report: &crate::validator::ValidationReport,
    ) -> Vec<String> {
        let mut recommendations = Vec::new();
        for violation in violations {
            match &violation.deliverable {
                Some(name) => {
                    let deliverable = report.deliverables.iter().find(|d| &d.name == name);
                    if violation.current == Some(0.0)
                        && deliverable.map(|d| d.files_matched.is_empty()).unwrap_or(true)
                    {
                        recommendations
                            .push(format!("Create the missing deliverable '{}'", name));
                    } else if let Some(deliverable) = deliverable {
                        recommendations.push(format!(
                            "Improve '{}' (score {:.2} < {:.2})",
                            name, deliverable.score, deliverable.min_quality
                        ));
                        for issue in deliverable.issues.iter().take(5) {
                            recommendations.push(format!("  {}", issue));
                        }
                    }
                }
                None => recommendations.push(format!(
                    "Raise {} from {:.2} to at least {:.2}",
                    violation.gate,
                    violation.current.unwrap_or(0.0),
                    violation.required.unwrap_or(0.0)
                )),
            }
        }
        recommendations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::bypass::{BypassDuration, BypassRequestSpec, RiskAssessment, RiskLevel};
    use std::fs;

    const POLICY: &str = r#"
[phases.implementation.gates.test_coverage]
threshold = 0.80
severity = "blocking"

[phases.requirements.gates.deliverable_quality]
threshold = 0.70
severity = "blocking"

[[bypass_rules.bypassable_gates]]
gate = "test_coverage"
phase = "implementation"
requires_adr = true
approval_level = "tech_lead"
"#;

    fn gate_validator() -> PhaseGateValidator {
        let policy = Arc::new(PolicyLoader::from_toml_str(POLICY).unwrap());
        let registry = Arc::new(ContractRegistry::with_defaults());
        PhaseGateValidator::new(policy, registry)
    }

    fn good_requirements(dir: &Path) {
        let body = "# Requirements\n\n".to_string()
            + &"The system shall expose an authenticated REST API for order intake.\n".repeat(20);
        fs::write(dir.join("requirements.md"), body).unwrap();
    }

    #[test]
    fn test_first_phase_entry_gate_passes_vacuously() {
        let validator = gate_validator();
        let ctx = WorkflowContext::new("req", "iter", Path::new("/nonexistent"));
        let check = validator.entry_gate(Phase::Requirements, &ctx).unwrap();
        assert!(check.pass);
        assert!(check.violations.is_empty());
    }

    #[test]
    fn test_entry_gate_checks_predecessor_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let validator = gate_validator();
        let ctx = WorkflowContext::new("req", "iter", dir.path());

        // Design entry requires requirements artifacts; empty dir fails.
        let check = validator.entry_gate(Phase::Design, &ctx).unwrap();
        assert!(!check.pass);

        good_requirements(dir.path());
        let check = validator.entry_gate(Phase::Design, &ctx).unwrap();
        assert!(check.pass);
    }

    #[test]
    fn test_exit_gate_passes_on_satisfied_contract() {
        let dir = tempfile::tempdir().unwrap();
        good_requirements(dir.path());

        let validator = gate_validator();
        let result = validator
            .exit_gate(Phase::Requirements, dir.path(), 1, &BTreeMap::new())
            .unwrap();
        assert!(result.passed);
        assert!(result.blocking_violations().is_empty());
        assert!(result.score > 0.7);
    }

    #[test]
    fn test_exit_gate_empty_dir_all_missing() {
        let dir = tempfile::tempdir().unwrap();
        let validator = gate_validator();
        let result = validator
            .exit_gate(Phase::Requirements, dir.path(), 1, &BTreeMap::new())
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert!(result
            .violations
            .iter()
            .any(|v| v.message.contains("requirements_doc")));
        assert!(result
            .recommendations
            .iter()
            .any(|r| r.contains("missing deliverable")));
    }

    #[test]
    fn test_stub_blocks_gate_with_critical_quality() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("requirements.md"), "TODO: implement\n\n\n\n").unwrap();

        let validator = gate_validator();
        let result = validator
            .exit_gate(Phase::Requirements, dir.path(), 1, &BTreeMap::new())
            .unwrap();
        assert!(!result.passed);
        let violation = result
            .violations
            .iter()
            .find(|v| v.deliverable.as_deref() == Some("requirements_doc"))
            .unwrap();
        assert!(violation.current.unwrap() <= 0.2);
        assert_eq!(violation.severity, GateSeverity::Blocking);
        assert!(result
            .recommendations
            .iter()
            .any(|r| r.contains("stub marker")));
    }

    #[test]
    fn test_exit_gate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("requirements.md"), "TODO: implement\n").unwrap();

        let validator = gate_validator();
        let first = validator
            .exit_gate(Phase::Requirements, dir.path(), 1, &BTreeMap::new())
            .unwrap();
        let second = validator
            .exit_gate(Phase::Requirements, dir.path(), 2, &BTreeMap::new())
            .unwrap();
        assert_eq!(first.passed, second.passed);
        assert_eq!(first.score, second.score);
        assert_eq!(first.violations, second.violations);
    }

    #[test]
    fn test_measured_metric_violation_and_bypass() {
        let dir = tempfile::tempdir().unwrap();
        // Satisfy the implementation contract's source_code deliverable.
        let code = "def handler(event):\n".to_string()
            + &"    return process(event)\n".repeat(40);
        fs::write(dir.path().join("service.py"), code).unwrap();

        let validator = gate_validator();
        let mut measured = BTreeMap::new();
        measured.insert("test_coverage".to_string(), 0.68);

        let result = validator
            .exit_gate(Phase::Implementation, dir.path(), 1, &measured)
            .unwrap();
        assert!(!result.passed);
        let coverage = result
            .violations
            .iter()
            .find(|v| v.gate == "test_coverage")
            .unwrap();
        assert_eq!(coverage.current, Some(0.68));
        assert_eq!(coverage.required, Some(0.80));

        // An approved bypass for the failing gate flips the outcome.
        let tmp = tempfile::tempdir().unwrap();
        let policy = Arc::new(PolicyLoader::from_toml_str(POLICY).unwrap());
        let audit = Arc::new(AuditLog::open(&tmp.path().join("bypasses.jsonl")).unwrap());
        let manager = BypassManager::new(policy, audit);
        let request = manager
            .create_request(BypassRequestSpec {
                workflow_id: "wf-1".to_string(),
                phase: Phase::Implementation,
                gate: "test_coverage".to_string(),
                current_value: 0.68,
                required_threshold: 0.80,
                justification: "legacy module".to_string(),
                risks: RiskAssessment {
                    technical: RiskLevel::Medium,
                    business: RiskLevel::Low,
                    security: RiskLevel::Low,
                },
                duration: BypassDuration::Temporary,
                expiration: None,
                remediation_plan: None,
                compensating_controls: vec![],
                requested_by: "backend_developer".to_string(),
            })
            .unwrap();

        assert!(!validator
            .all_blocking_bypassed(&result, &manager, "wf-1")
            .unwrap());
        manager
            .approve(request.id, "tech_lead", Some(Path::new("docs/adr/7.md")), None, None)
            .unwrap();
        assert!(validator
            .all_blocking_bypassed(&result, &manager, "wf-1")
            .unwrap());
    }
}
