//! Workflow DAG model.
//!
//! Nodes are typed units of execution keyed by string id; dependencies form
//! a directed acyclic graph. Scheduling happens in "waves": each wave is the
//! set of nodes whose dependencies are already satisfied. Interface nodes
//! publish locked contracts for downstream work, so they are pulled into
//! their own wave ahead of other nodes at the same topological level. Wave
//! membership is ordered by node id ascending for stable replay.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{WorkflowError, WorkflowResult};

/// Type of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// A unit of persona work.
    Action,
    /// A lifecycle phase boundary.
    Phase,
    /// A point where state is persisted for recovery.
    Checkpoint,
    /// Emits a notification, produces no artifacts.
    Notification,
    /// Publishes a locked contract consumed by downstream nodes.
    Interface,
}

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before re-running after the given completed attempt
    /// (0-based): `initial × 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Per-node execution configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    /// Node timeout in seconds; `None` uses the executor default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default)]
    pub gates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_effort: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_version: Option<u32>,
}

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub config: NodeConfig,
}

impl WorkflowNode {
    pub fn new(id: &str, node_type: NodeType) -> Self {
        Self {
            id: id.to_string(),
            node_type,
            depends_on: BTreeSet::new(),
            outputs: Vec::new(),
            config: NodeConfig::default(),
        }
    }

    pub fn with_dependency(mut self, dep: &str) -> Self {
        self.depends_on.insert(dep.to_string());
        self
    }

    pub fn with_persona(mut self, persona_id: &str) -> Self {
        self.config.persona_id = Some(persona_id.to_string());
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.config.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.config.capability = Some(capability.to_string());
        self
    }
}

/// The dependency graph of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDag {
    nodes: BTreeMap<String, WorkflowNode>,
}

impl WorkflowDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: WorkflowNode) -> WorkflowResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(WorkflowError::DuplicateNode(node.id));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Add a dependency edge `node -> depends on -> dep`.
    ///
    /// Both ids must exist; an edge that would close a cycle is rejected
    /// with the offending cycle in the error message and the graph left
    /// unchanged.
    pub fn add_dependency(&mut self, node: &str, dep: &str) -> WorkflowResult<()> {
        if !self.nodes.contains_key(node) {
            return Err(WorkflowError::NodeNotFound(node.to_string()));
        }
        if !self.nodes.contains_key(dep) {
            return Err(WorkflowError::NodeNotFound(dep.to_string()));
        }
        if let Some(n) = self.nodes.get_mut(node) {
            n.depends_on.insert(dep.to_string());
        }

        if let Some(cycle) = self.find_cycle() {
            if let Some(n) = self.nodes.get_mut(node) {
                n.depends_on.remove(dep);
            }
            return Err(WorkflowError::CycleDetected(cycle.join(" -> ")));
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that depend (directly) on `id`, sorted.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.depends_on.contains(id))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Check referential integrity and acyclicity.
    pub fn validate(&self) -> WorkflowResult<()> {
        for node in self.nodes.values() {
            for dep in &node.depends_on {
                if !self.nodes.contains_key(dep) {
                    return Err(WorkflowError::MissingDependency {
                        node: node.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        if let Some(cycle) = self.find_cycle() {
            return Err(WorkflowError::CycleDetected(cycle.join(" -> ")));
        }
        Ok(())
    }

    /// Find one cycle via DFS, returned as the closed node path.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        fn visit(
            dag: &WorkflowDag,
            id: &str,
            marks: &mut HashMap<String, Mark>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            match marks.get(id) {
                Some(Mark::Done) => return None,
                Some(Mark::InProgress) => {
                    let start = path.iter().position(|p| p == id).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(id.to_string());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(id.to_string(), Mark::InProgress);
            path.push(id.to_string());
            if let Some(node) = dag.nodes.get(id) {
                for dep in &node.depends_on {
                    if let Some(cycle) = visit(dag, dep, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(id.to_string(), Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        let mut path = Vec::new();
        for id in self.nodes.keys() {
            if let Some(cycle) = visit(self, id, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Kahn's algorithm producing execution waves.
    ///
    /// Each wave holds nodes whose dependencies are satisfied by earlier
    /// waves, ordered by id ascending. When the ready set contains interface
    /// nodes they form their own wave ahead of everything else at that
    /// level, so their contracts lock before siblings start; the displaced
    /// siblings merge into the following wave.
    pub fn topological_groups(&self) -> WorkflowResult<Vec<Vec<String>>> {
        self.validate()?;

        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .values()
            .map(|n| (n.id.as_str(), n.depends_on.len()))
            .collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for node in self.nodes.values() {
            for dep in &node.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(node.id.as_str());
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut waves: Vec<Vec<String>> = Vec::new();

        while !ready.is_empty() {
            ready.sort_unstable();
            let has_interface = ready.iter().any(|id| self.is_interface(id));
            let (wave, rest): (Vec<&str>, Vec<&str>) = if has_interface {
                ready.iter().copied().partition(|id| self.is_interface(id))
            } else {
                (std::mem::take(&mut ready), Vec::new())
            };
            ready = rest;

            for id in &wave {
                for dependent in dependents.get(id).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(*dependent);
                        }
                    }
                }
            }
            waves.push(wave.iter().map(|id| id.to_string()).collect());
        }

        Ok(waves)
    }

    fn is_interface(&self, id: &str) -> bool {
        self.nodes
            .get(id)
            .map(|n| n.node_type == NodeType::Interface)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag_with(ids: &[&str]) -> WorkflowDag {
        let mut dag = WorkflowDag::new();
        for id in ids {
            dag.add_node(WorkflowNode::new(id, NodeType::Action)).unwrap();
        }
        dag
    }

    #[test]
    fn test_add_node_rejects_duplicates() {
        let mut dag = dag_with(&["A"]);
        let err = dag
            .add_node(WorkflowNode::new("A", NodeType::Action))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateNode(_)));
    }

    #[test]
    fn test_add_dependency_requires_both_nodes() {
        let mut dag = dag_with(&["A"]);
        assert!(matches!(
            dag.add_dependency("A", "missing"),
            Err(WorkflowError::NodeNotFound(_))
        ));
        assert!(matches!(
            dag.add_dependency("missing", "A"),
            Err(WorkflowError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_cycle_rejected_with_path_and_graph_unchanged() {
        let mut dag = dag_with(&["A", "B", "C"]);
        dag.add_dependency("B", "A").unwrap();
        dag.add_dependency("C", "B").unwrap();

        let err = dag.add_dependency("A", "C").unwrap_err();
        match err {
            WorkflowError::CycleDetected(msg) => {
                assert!(msg.contains("A"), "cycle message was: {}", msg);
                assert!(msg.contains("C"));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
        // Rolled back: the graph still validates.
        dag.validate().unwrap();
        assert!(!dag.node("A").unwrap().depends_on.contains("C"));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut dag = dag_with(&["A"]);
        assert!(matches!(
            dag.add_dependency("A", "A"),
            Err(WorkflowError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_linear_chain_waves() {
        let mut dag = dag_with(&["A", "B", "C"]);
        dag.add_dependency("B", "A").unwrap();
        dag.add_dependency("C", "B").unwrap();
        let waves = dag.topological_groups().unwrap();
        assert_eq!(waves, vec![vec!["A"], vec!["B"], vec!["C"]]);
    }

    #[test]
    fn test_parallel_wave_sorted_by_id() {
        let mut dag = dag_with(&["root", "z", "a", "m"]);
        dag.add_dependency("z", "root").unwrap();
        dag.add_dependency("a", "root").unwrap();
        dag.add_dependency("m", "root").unwrap();
        let waves = dag.topological_groups().unwrap();
        assert_eq!(waves, vec![vec!["root"], vec!["a", "m", "z"]]);
    }

    #[test]
    fn test_interface_first_waves() {
        let mut dag = WorkflowDag::new();
        dag.add_node(WorkflowNode::new("IF.API", NodeType::Interface))
            .unwrap();
        dag.add_node(WorkflowNode::new("FE.UI", NodeType::Action).with_dependency("IF.API"))
            .unwrap();
        dag.add_node(WorkflowNode::new("BE.Impl", NodeType::Action).with_dependency("IF.API"))
            .unwrap();
        dag.add_node(
            WorkflowNode::new("QA.Tests", NodeType::Action)
                .with_dependency("FE.UI")
                .with_dependency("BE.Impl"),
        )
        .unwrap();

        let waves = dag.topological_groups().unwrap();
        assert_eq!(
            waves,
            vec![
                vec!["IF.API".to_string()],
                vec!["BE.Impl".to_string(), "FE.UI".to_string()],
                vec!["QA.Tests".to_string()],
            ]
        );
    }

    #[test]
    fn test_interface_splits_mixed_level() {
        let mut dag = WorkflowDag::new();
        dag.add_node(WorkflowNode::new("IF.Schema", NodeType::Interface))
            .unwrap();
        dag.add_node(WorkflowNode::new("Docs", NodeType::Action)).unwrap();
        dag.add_node(WorkflowNode::new("Impl", NodeType::Action).with_dependency("IF.Schema"))
            .unwrap();

        let waves = dag.topological_groups().unwrap();
        // IF.Schema and Docs share topological level 0, but the interface
        // wave comes first.
        assert_eq!(
            waves,
            vec![
                vec!["IF.Schema".to_string()],
                vec!["Docs".to_string(), "Impl".to_string()],
            ]
        );
    }

    #[test]
    fn test_interface_precedes_every_dependent() {
        let mut dag = WorkflowDag::new();
        dag.add_node(WorkflowNode::new("IF.A", NodeType::Interface)).unwrap();
        dag.add_node(WorkflowNode::new("IF.B", NodeType::Interface).with_dependency("IF.A"))
            .unwrap();
        dag.add_node(WorkflowNode::new("W1", NodeType::Action).with_dependency("IF.A"))
            .unwrap();
        dag.add_node(WorkflowNode::new("W2", NodeType::Action).with_dependency("IF.B"))
            .unwrap();

        let waves = dag.topological_groups().unwrap();
        let wave_of = |id: &str| {
            waves
                .iter()
                .position(|w| w.iter().any(|n| n == id))
                .unwrap()
        };
        for node in dag.nodes() {
            if node.node_type == NodeType::Interface {
                for dependent in dag.dependents(&node.id) {
                    assert!(wave_of(&node.id) < wave_of(&dependent));
                }
            }
        }
    }

    #[test]
    fn test_validate_missing_dependency() {
        let mut dag = WorkflowDag::new();
        dag.add_node(WorkflowNode::new("A", NodeType::Action).with_dependency("ghost"))
            .unwrap();
        assert!(matches!(
            dag.validate(),
            Err(WorkflowError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 3_000,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(3_000));
        assert_eq!(policy.backoff(10), Duration::from_millis(3_000));
    }

    #[test]
    fn test_dag_serde_round_trip() {
        let mut dag = dag_with(&["A", "B"]);
        dag.add_dependency("B", "A").unwrap();
        let json = serde_json::to_string(&dag).unwrap();
        let parsed: WorkflowDag = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.node_ids(), vec!["A", "B"]);
        assert!(parsed.node("B").unwrap().depends_on.contains("A"));
    }
}
