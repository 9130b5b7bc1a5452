//! Execution manifest.
//!
//! The manifest is the structured input to a workflow run: iteration
//! identity, project constraints, policy references, and the node graph.
//! JSON is the authoritative encoding; TOML round-trips without loss for
//! hand-written manifests.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::{NodeConfig, NodeType, RetryPolicy, WorkflowDag, WorkflowNode};
use crate::errors::{ConfigError, ConfigResult, ValidationError, ValidationResult, WorkflowError};
use crate::workflow::Workflow;

/// Reference to an organization policy applied to this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRef {
    pub id: String,
    pub severity: String,
}

/// One node as declared in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub gates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_effort: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_version: Option<u32>,
}

/// The execution manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionManifest {
    pub iteration_id: String,
    pub timestamp: DateTime<Utc>,
    pub project: String,
    #[serde(default)]
    pub constraints: BTreeMap<String, Value>,
    #[serde(default)]
    pub policies: Vec<PolicyRef>,
    pub nodes: Vec<ManifestNode>,
}

impl ExecutionManifest {
    /// Load a manifest file; format chosen by extension (`.json`, `.toml`).
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            other => Err(ConfigError::UnsupportedFormat(format!(
                "manifest file extension {:?}",
                other
            ))),
        }
    }

    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        serde_json::from_str(content).map_err(|e| ConfigError::MalformedManifest(e.to_string()))
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::MalformedManifest(e.to_string()))
    }

    pub fn to_json_string(&self) -> ConfigResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::MalformedManifest(e.to_string()))
    }

    /// Structural validation: non-empty identity, unique node ids, known
    /// dependencies, acyclic graph.
    pub fn validate(&self) -> ValidationResult<()> {
        if self.iteration_id.trim().is_empty() {
            return Err(ValidationError::Invalid(
                "iteration_id must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
        }
        for node in &self.nodes {
            for dep in &node.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(ValidationError::UnknownDependency {
                        node: node.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        match self.build_dag() {
            Ok(_) => Ok(()),
            Err(WorkflowError::CycleDetected(cycle)) => Err(ValidationError::Invalid(format!(
                "workflow graph contains a cycle: {}",
                cycle
            ))),
            Err(other) => Err(ValidationError::Invalid(other.to_string())),
        }
    }

    /// Build the workflow DAG declared by this manifest.
    pub fn build_dag(&self) -> Result<WorkflowDag, WorkflowError> {
        let mut dag = WorkflowDag::new();
        for node in &self.nodes {
            let mut workflow_node = WorkflowNode::new(&node.id, node.node_type);
            workflow_node.outputs = node.outputs.clone();
            workflow_node.config = NodeConfig {
                command: None,
                persona_id: node.persona.clone(),
                timeout_secs: node.timeout_secs,
                retry: RetryPolicy {
                    max_retries: node.max_retries.unwrap_or(0),
                    ..Default::default()
                },
                capability: node.capability.clone(),
                gates: node.gates.clone(),
                estimated_effort: node.estimated_effort,
                contract_version: node.contract_version,
            };
            dag.add_node(workflow_node)?;
        }
        for node in &self.nodes {
            for dep in &node.depends_on {
                dag.add_dependency(&node.id, dep)?;
            }
        }
        Ok(dag)
    }

    /// Convert into an executable workflow for the given requirement.
    pub fn to_workflow(&self, workflow_id: &str, requirement: &str) -> Result<Workflow, WorkflowError> {
        self.validate()?;
        let dag = self.build_dag()?;
        Ok(Workflow::new(workflow_id, dag, &self.iteration_id, requirement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ExecutionManifest {
        ExecutionManifest {
            iteration_id: "iter-42".to_string(),
            timestamp: Utc::now(),
            project: "order-service".to_string(),
            constraints: BTreeMap::from([
                (
                    "security_standard".to_string(),
                    Value::String("owasp-asvs".to_string()),
                ),
                ("runtime".to_string(), Value::String("python3.12".to_string())),
            ]),
            policies: vec![PolicyRef {
                id: "sec-001".to_string(),
                severity: "blocking".to_string(),
            }],
            nodes: vec![
                ManifestNode {
                    id: "IF.API".to_string(),
                    node_type: NodeType::Interface,
                    capability: Some("api-design".to_string()),
                    depends_on: vec![],
                    outputs: vec!["openapi.yaml".to_string()],
                    gates: vec![],
                    estimated_effort: Some(2.0),
                    persona: Some("solution_architect".to_string()),
                    timeout_secs: Some(300),
                    max_retries: None,
                    contract_version: Some(1),
                },
                ManifestNode {
                    id: "BE.Impl".to_string(),
                    node_type: NodeType::Action,
                    capability: Some("backend".to_string()),
                    depends_on: vec!["IF.API".to_string()],
                    outputs: vec![],
                    gates: vec!["test_coverage".to_string()],
                    estimated_effort: None,
                    persona: Some("backend_developer".to_string()),
                    timeout_secs: None,
                    max_retries: Some(2),
                    contract_version: None,
                },
            ],
        }
    }

    #[test]
    fn test_json_round_trip_is_lossless() {
        let manifest = sample();
        let json = manifest.to_json_string().unwrap();
        let reloaded = ExecutionManifest::from_json_str(&json).unwrap();
        assert_eq!(reloaded, manifest);
    }

    #[test]
    fn test_toml_round_trip_is_lossless() {
        let manifest = sample();
        let toml_text = toml::to_string(&manifest).unwrap();
        let reloaded = ExecutionManifest::from_toml_str(&toml_text).unwrap();
        assert_eq!(reloaded, manifest);
    }

    #[test]
    fn test_validate_empty_iteration_id() {
        let mut manifest = sample();
        manifest.iteration_id = "  ".to_string();
        assert!(matches!(
            manifest.validate(),
            Err(ValidationError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_duplicate_node() {
        let mut manifest = sample();
        let duplicate = manifest.nodes[0].clone();
        manifest.nodes.push(duplicate);
        assert!(matches!(
            manifest.validate(),
            Err(ValidationError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let mut manifest = sample();
        manifest.nodes[1].depends_on.push("ghost".to_string());
        assert!(matches!(
            manifest.validate(),
            Err(ValidationError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_validate_cycle_reported_in_message() {
        let mut manifest = sample();
        manifest.nodes[0].depends_on.push("BE.Impl".to_string());
        let err = manifest.validate().unwrap_err();
        match err {
            ValidationError::Invalid(message) => {
                assert!(message.contains("cycle"), "message was: {}", message)
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_to_workflow_carries_config() {
        let manifest = sample();
        let workflow = manifest.to_workflow("wf-1", "build the order service").unwrap();
        assert_eq!(workflow.total_nodes(), 2);
        assert_eq!(workflow.metadata.iteration_id, "iter-42");

        let node = workflow.dag.node("BE.Impl").unwrap();
        assert_eq!(node.config.persona_id.as_deref(), Some("backend_developer"));
        assert_eq!(node.config.retry.max_retries, 2);
        assert_eq!(node.config.gates, vec!["test_coverage"]);
        assert!(node.depends_on.contains("IF.API"));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = ExecutionManifest::from_json_str("{").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedManifest(_)));
    }
}
