//! Phase SLO and bypass policy.
//!
//! A policy document declares, per phase, the quality gates that must hold at
//! the phase exit and the rules governing which gates may be bypassed. The
//! loader exposes typed lookups with a documented default table for gates the
//! document does not mention.
//!
//! Accepted formats are TOML and JSON, selected by file extension:
//!
//! ```toml
//! [phases.implementation.gates.test_coverage]
//! threshold = 0.80
//! severity = "blocking"
//!
//! [[bypass_rules.bypassable_gates]]
//! gate = "test_coverage"
//! phase = "implementation"
//! requires_adr = true
//! approval_level = "tech_lead"
//!
//! [bypass_rules.audit_trail]
//! log_location = "logs/phase_gate_bypasses.jsonl"
//! alert_threshold = 0.10
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{ConfigError, ConfigResult};
use crate::phase::Phase;

/// How a gate violation affects a phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSeverity {
    /// The phase cannot advance while this gate is violated.
    Blocking,
    /// Recorded and reported, does not block the transition.
    Warning,
    /// Informational only.
    Info,
}

impl fmt::Display for GateSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateSeverity::Blocking => write!(f, "blocking"),
            GateSeverity::Warning => write!(f, "warning"),
            GateSeverity::Info => write!(f, "info"),
        }
    }
}

/// Threshold and severity for one gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateSlo {
    pub threshold: f64,
    pub severity: GateSeverity,
}

/// Gates declared for one phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasePolicy {
    #[serde(default)]
    pub gates: HashMap<String, GateSlo>,
}

/// A gate declared bypassable, with its approval requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassableGate {
    pub gate: String,
    pub phase: String,
    #[serde(default = "default_true")]
    pub requires_adr: bool,
    #[serde(default = "default_approval_level")]
    pub approval_level: String,
}

fn default_true() -> bool {
    true
}

fn default_approval_level() -> String {
    "tech_lead".to_string()
}

/// Reference to a gate within a phase. The phase may be `"*"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRef {
    pub gate: String,
    pub phase: String,
}

/// Audit trail configuration for the bypass subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditTrailConfig {
    #[serde(default = "default_bypass_log")]
    pub log_location: PathBuf,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
}

fn default_bypass_log() -> PathBuf {
    PathBuf::from("logs/phase_gate_bypasses.jsonl")
}

fn default_alert_threshold() -> f64 {
    0.10
}

impl Default for AuditTrailConfig {
    fn default() -> Self {
        Self {
            log_location: default_bypass_log(),
            alert_threshold: default_alert_threshold(),
        }
    }
}

/// Which gates may be bypassed and how the bypass trail is kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BypassRules {
    #[serde(default)]
    pub bypassable_gates: Vec<BypassableGate>,
    #[serde(default)]
    pub non_bypassable_gates: Vec<GateRef>,
    #[serde(default)]
    pub audit_trail: AuditTrailConfig,
}

/// The complete policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub phases: HashMap<String, PhasePolicy>,
    #[serde(default)]
    pub bypass_rules: BypassRules,
}

/// Approval requirements for bypassing a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassRequirements {
    pub requires_adr: bool,
    pub approval_level: String,
}

/// Default SLO table, used when the policy document has no entry for a gate.
///
/// | gate | threshold | severity |
/// |---|---|---|
/// | test_coverage | 0.80 | blocking |
/// | code_quality | 0.85 | blocking |
/// | deliverable_quality | 0.75 | blocking |
/// | security_scan | 0.95 | blocking |
/// | documentation | 0.70 | warning |
/// | anything else | 0.75 | blocking |
const DEFAULT_GATE_TABLE: &[(&str, f64, GateSeverity)] = &[
    ("test_coverage", 0.80, GateSeverity::Blocking),
    ("code_quality", 0.85, GateSeverity::Blocking),
    ("deliverable_quality", 0.75, GateSeverity::Blocking),
    ("security_scan", 0.95, GateSeverity::Blocking),
    ("documentation", 0.70, GateSeverity::Warning),
];

const FALLBACK_SLO: GateSlo = GateSlo {
    threshold: 0.75,
    severity: GateSeverity::Blocking,
};

/// Typed lookups over a loaded policy document.
#[derive(Debug)]
pub struct PolicyLoader {
    doc: PolicyDocument,
    logged_fallbacks: Mutex<HashSet<(String, String)>>,
}

impl PolicyLoader {
    pub fn new(doc: PolicyDocument) -> Self {
        Self {
            doc,
            logged_fallbacks: Mutex::new(HashSet::new()),
        }
    }

    /// Load a policy file; format is chosen by extension (`.toml`, `.json`).
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(ConfigError::UnsupportedFormat(format!(
                "policy file extension {:?}",
                other
            ))),
        }
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let doc: PolicyDocument =
            toml::from_str(content).map_err(|e| ConfigError::MalformedPolicy(e.to_string()))?;
        Self::validated(doc)
    }

    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        let doc: PolicyDocument = serde_json::from_str(content)
            .map_err(|e| ConfigError::MalformedPolicy(e.to_string()))?;
        Self::validated(doc)
    }

    fn validated(doc: PolicyDocument) -> ConfigResult<Self> {
        for (phase, policy) in &doc.phases {
            for (gate, slo) in &policy.gates {
                if !(0.0..=1.0).contains(&slo.threshold) {
                    return Err(ConfigError::InvalidValue {
                        key: format!("phases.{}.gates.{}.threshold", phase, gate),
                        reason: format!("{} is outside [0, 1]", slo.threshold),
                    });
                }
            }
        }
        let alert = doc.bypass_rules.audit_trail.alert_threshold;
        if !(0.0..=1.0).contains(&alert) {
            return Err(ConfigError::InvalidValue {
                key: "bypass_rules.audit_trail.alert_threshold".to_string(),
                reason: format!("{} is outside [0, 1]", alert),
            });
        }
        Ok(Self::new(doc))
    }

    pub fn document(&self) -> &PolicyDocument {
        &self.doc
    }

    fn lookup(&self, phase: Phase, gate: &str) -> Option<GateSlo> {
        self.doc
            .phases
            .get(phase.as_str())
            .and_then(|p| p.gates.get(gate))
            .copied()
    }

    fn fallback(&self, phase: Phase, gate: &str) -> GateSlo {
        let key = (phase.as_str().to_string(), gate.to_string());
        if self.logged_fallbacks.lock().insert(key) {
            debug!(
                phase = %phase,
                gate,
                "policy has no entry for gate, using default table"
            );
        }
        DEFAULT_GATE_TABLE
            .iter()
            .find(|(name, _, _)| *name == gate)
            .map(|(_, threshold, severity)| GateSlo {
                threshold: *threshold,
                severity: *severity,
            })
            .unwrap_or(FALLBACK_SLO)
    }

    /// Quality threshold for a gate in a phase.
    pub fn threshold(&self, phase: Phase, gate: &str) -> f64 {
        match self.lookup(phase, gate) {
            Some(slo) => slo.threshold,
            None => self.fallback(phase, gate).threshold,
        }
    }

    /// Severity of a gate violation in a phase.
    pub fn severity(&self, phase: Phase, gate: &str) -> GateSeverity {
        match self.lookup(phase, gate) {
            Some(slo) => slo.severity,
            None => self.fallback(phase, gate).severity,
        }
    }

    /// Whether policy permits bypassing this gate in this phase.
    ///
    /// The non-bypassable list always wins; gates listed in neither table are
    /// not bypassable.
    pub fn can_bypass(&self, gate: &str, phase: Phase) -> bool {
        let rules = &self.doc.bypass_rules;
        if rules
            .non_bypassable_gates
            .iter()
            .any(|r| r.gate == gate && phase_matches(&r.phase, phase))
        {
            return false;
        }
        rules
            .bypassable_gates
            .iter()
            .any(|b| b.gate == gate && phase_matches(&b.phase, phase))
    }

    /// Approval requirements for bypassing a gate. Defaults to requiring an
    /// ADR at tech-lead level when the gate is not explicitly listed.
    pub fn bypass_requirements(&self, gate: &str, phase: Phase) -> BypassRequirements {
        self.doc
            .bypass_rules
            .bypassable_gates
            .iter()
            .find(|b| b.gate == gate && phase_matches(&b.phase, phase))
            .map(|b| BypassRequirements {
                requires_adr: b.requires_adr,
                approval_level: b.approval_level.clone(),
            })
            .unwrap_or(BypassRequirements {
                requires_adr: true,
                approval_level: default_approval_level(),
            })
    }

    /// Alert threshold for the bypass-rate metric.
    pub fn alert_threshold(&self) -> f64 {
        self.doc.bypass_rules.audit_trail.alert_threshold
    }

    /// Location of the bypass audit log.
    pub fn bypass_log_location(&self) -> &Path {
        &self.doc.bypass_rules.audit_trail.log_location
    }
}

impl Default for PolicyLoader {
    fn default() -> Self {
        Self::new(PolicyDocument::default())
    }
}

fn phase_matches(pattern: &str, phase: Phase) -> bool {
    pattern == "*" || pattern == phase.as_str()
}
