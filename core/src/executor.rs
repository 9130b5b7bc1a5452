//! Workflow executor.
//!
//! Executes a workflow wave by wave: within a wave nodes run concurrently up
//! to a configurable cap, across waves execution is strictly sequential.
//! Each node gets a timeout and a retry budget with exponential backoff;
//! upstream failures cascade to dependents as skips. Cancellation is
//! cooperative with a grace period, after which stragglers are forcibly
//! failed. Every state change is published on the event bus and mirrored to
//! a JSONL event log when configured.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::dag::WorkflowNode;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::events::{EventBus, EventEnvelope, WorkflowEvent};
use crate::workflow::{NodeState, NodeStatus, Workflow, WorkflowContext, WorkflowStatus};

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrency cap within a wave; `None` means `min(wave_size, 8)`.
    pub max_concurrency: Option<usize>,
    /// Timeout applied to nodes that do not declare their own.
    pub default_timeout_secs: u64,
    /// How long running nodes get to honor a cancellation signal before
    /// being forcibly failed.
    pub grace_period_secs: u64,
    /// Optional JSONL mirror for every emitted event.
    pub event_log: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            default_timeout_secs: 600,
            grace_period_secs: 30,
            event_log: None,
        }
    }
}

/// What a node produced.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub artifacts: Vec<String>,
    pub agent: Option<String>,
}

/// Executes a single node. Implementations must observe the context's
/// cancellation token during long waits.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    async fn run(&self, node: &WorkflowNode, ctx: &WorkflowContext) -> WorkflowResult<NodeOutput>;
}

/// Final state of a workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub node_states: BTreeMap<String, NodeState>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    fn count(&self, status: NodeStatus) -> usize {
        self.node_states
            .values()
            .filter(|s| s.status == status)
            .count()
    }

    pub fn completed(&self) -> usize {
        self.count(NodeStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(NodeStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(NodeStatus::Skipped)
    }

    pub fn cancelled(&self) -> usize {
        self.count(NodeStatus::Cancelled)
    }
}

/// Publishes to the bus and mirrors to the JSONL event log.
#[derive(Clone)]
struct Emitter {
    bus: EventBus,
    log: Option<Arc<EventLogWriter>>,
}

impl Emitter {
    fn emit(&self, event: WorkflowEvent) {
        let envelope = self.bus.emit(event);
        if let Some(log) = &self.log {
            log.write(&envelope);
        }
    }
}

struct EventLogWriter {
    writer: Mutex<BufWriter<File>>,
}

impl EventLogWriter {
    fn open(path: &PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write(&self, envelope: &EventEnvelope) {
        if let Ok(line) = serde_json::to_string(envelope) {
            let mut writer = self.writer.lock();
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.write_all(b"\n");
            let _ = writer.flush();
        }
    }
}

/// Wave-at-a-time DAG executor.
pub struct WorkflowExecutor {
    config: ExecutorConfig,
    bus: EventBus,
}

impl WorkflowExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            bus: EventBus::default(),
        }
    }

    /// The bus this executor publishes to; subscribe before `execute`.
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Run the workflow to a terminal state.
    ///
    /// Structural problems (cycles, unknown dependencies) surface as errors;
    /// node failures are recorded in the report instead.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        ctx: Arc<WorkflowContext>,
        runner: Arc<dyn NodeRunner>,
    ) -> WorkflowResult<ExecutionReport> {
        let waves = workflow.dag.topological_groups()?;
        let started = Instant::now();
        let total = workflow.total_nodes();
        let workflow_id = workflow.id.clone();

        let event_log = match &self.config.event_log {
            Some(path) => Some(Arc::new(EventLogWriter::open(path)?)),
            None => None,
        };
        let emitter = Emitter {
            bus: self.bus.clone(),
            log: event_log,
        };

        emitter.emit(WorkflowEvent::WorkflowStarted {
            workflow_id: workflow_id.clone(),
            total_nodes: total,
        });
        info!(workflow_id = %workflow_id, total_nodes = total, "workflow started");

        let mut states: BTreeMap<String, NodeState> = workflow
            .dag
            .nodes()
            .map(|n| (n.id.clone(), NodeState::default()))
            .collect();

        for wave in &waves {
            if ctx.is_cancelled() {
                break;
            }
            self.run_wave(workflow, wave, &mut states, &ctx, &runner, &emitter)
                .await;

            let completed = states
                .values()
                .filter(|s| s.status == NodeStatus::Completed)
                .count();
            emitter.emit(WorkflowEvent::Progress {
                workflow_id: workflow_id.clone(),
                completed,
                total,
            });
        }

        // Nodes never reached (cancellation or upstream failure short-circuit).
        for (id, state) in states.iter_mut() {
            if !state.status.is_terminal() && state.status != NodeStatus::Running {
                let target = NodeStatus::Skipped;
                if state.transition(id, target).is_ok() {
                    state.reason = Some(if ctx.is_cancelled() {
                        "workflow cancelled".to_string()
                    } else {
                        "upstream failure".to_string()
                    });
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let status = if ctx.is_cancelled() {
            emitter.emit(WorkflowEvent::WorkflowCancelled {
                workflow_id: workflow_id.clone(),
            });
            WorkflowStatus::Cancelled
        } else if states.values().any(|s| s.status == NodeStatus::Failed) {
            emitter.emit(WorkflowEvent::WorkflowFailed {
                workflow_id: workflow_id.clone(),
                reason: "one or more nodes failed".to_string(),
            });
            WorkflowStatus::Failed
        } else {
            emitter.emit(WorkflowEvent::WorkflowCompleted {
                workflow_id: workflow_id.clone(),
                duration_ms,
            });
            WorkflowStatus::Completed
        };
        info!(workflow_id = %workflow_id, ?status, duration_ms, "workflow finished");

        Ok(ExecutionReport {
            workflow_id,
            status,
            node_states: states,
            duration_ms,
        })
    }

    async fn run_wave(
        &self,
        workflow: &Workflow,
        wave: &[String],
        states: &mut BTreeMap<String, NodeState>,
        ctx: &Arc<WorkflowContext>,
        runner: &Arc<dyn NodeRunner>,
        emitter: &Emitter,
    ) {
        let workflow_id = workflow.id.clone();
        let cap = self
            .config
            .max_concurrency
            .unwrap_or_else(|| wave.len().min(8))
            .max(1);
        let semaphore = Arc::new(Semaphore::new(cap));
        let token = ctx.cancellation_token();

        let mut join_set: JoinSet<(String, NodeState)> = JoinSet::new();
        let mut spawned: HashSet<String> = HashSet::new();

        // Wave order is already id-ascending; spawn in that order.
        for node_id in wave {
            let node = match workflow.dag.node(node_id) {
                Some(node) => node.clone(),
                None => continue,
            };

            // Upstream failure cascade: skip instead of running.
            let blocked = node.depends_on.iter().find(|dep| {
                states
                    .get(dep.as_str())
                    .map(|s| s.status != NodeStatus::Completed)
                    .unwrap_or(true)
            });
            let state = states.get_mut(node_id).map(std::mem::take);
            let mut state = match state {
                Some(state) => state,
                None => continue,
            };

            if let Some(upstream) = blocked {
                let reason = WorkflowError::DependencyError {
                    node_id: node_id.clone(),
                    upstream: upstream.clone(),
                };
                warn!(node_id = %node_id, %reason, "skipping node");
                let _ = state.transition(node_id, NodeStatus::Skipped);
                state.reason = Some(reason.to_string());
                states.insert(node_id.clone(), state);
                continue;
            }

            if state.transition(node_id, NodeStatus::Ready).is_err() {
                states.insert(node_id.clone(), state);
                continue;
            }

            let timeout_secs = node
                .config
                .timeout_secs
                .unwrap_or(self.config.default_timeout_secs);
            let task = NodeTask {
                workflow_id: workflow_id.clone(),
                node,
                state,
                ctx: Arc::clone(ctx),
                runner: Arc::clone(runner),
                emitter: emitter.clone(),
                semaphore: Arc::clone(&semaphore),
                timeout_secs,
            };
            spawned.insert(node_id.clone());
            join_set.spawn(task.run());
        }

        // Collect results; once cancellation fires, stragglers get a grace
        // period and are then aborted.
        let grace = Duration::from_secs(self.config.grace_period_secs);
        while !join_set.is_empty() {
            let next = if token.is_cancelled() {
                match timeout(grace, join_set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!("grace period elapsed, aborting unresponsive nodes");
                        join_set.abort_all();
                        while let Some(result) = join_set.join_next().await {
                            if let Ok((id, state)) = result {
                                spawned.remove(&id);
                                states.insert(id, state);
                            }
                        }
                        break;
                    }
                }
            } else {
                join_set.join_next().await
            };

            match next {
                Some(Ok((id, state))) => {
                    spawned.remove(&id);
                    states.insert(id, state);
                }
                Some(Err(join_error)) => {
                    warn!(%join_error, "node task did not return a state");
                }
                None => break,
            }
        }

        // Tasks that were aborted never returned their state.
        for id in spawned {
            let mut state = NodeState::default();
            let _ = state.transition(&id, NodeStatus::Ready);
            let _ = state.transition(&id, NodeStatus::Running);
            let _ = state.transition(&id, NodeStatus::Failed);
            state.reason = Some("did not honor cancellation within grace period".to_string());
            emitter.emit(WorkflowEvent::NodeFailed {
                workflow_id: workflow_id.clone(),
                node_id: id.clone(),
                reason: "did not honor cancellation within grace period".to_string(),
                will_retry: false,
            });
            states.insert(id, state);
        }
    }
}

struct NodeTask {
    workflow_id: String,
    node: WorkflowNode,
    state: NodeState,
    ctx: Arc<WorkflowContext>,
    runner: Arc<dyn NodeRunner>,
    emitter: Emitter,
    semaphore: Arc<Semaphore>,
    timeout_secs: u64,
}

impl NodeTask {
    async fn run(mut self) -> (String, NodeState) {
        let node_id = self.node.id.clone();
        let token = self.ctx.cancellation_token();

        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
            _ = token.cancelled() => None,
        };
        let _permit = match permit {
            Some(permit) => permit,
            None => {
                let _ = self.state.transition(&node_id, NodeStatus::Cancelled);
                self.state.reason = Some("cancelled".to_string());
                return (node_id, self.state);
            }
        };

        let max_attempts = self.node.config.retry.max_retries + 1;
        loop {
            if token.is_cancelled() {
                let _ = self.state.transition(&node_id, NodeStatus::Cancelled);
                self.state.reason = Some("cancelled".to_string());
                break;
            }

            if self.state.transition(&node_id, NodeStatus::Running).is_err() {
                break;
            }
            self.emitter.emit(WorkflowEvent::NodeStarted {
                workflow_id: self.workflow_id.clone(),
                node_id: node_id.clone(),
                attempt: self.state.attempts,
            });
            let attempt_started = Instant::now();

            let outcome = tokio::select! {
                _ = token.cancelled() => Err(WorkflowError::Cancelled),
                result = timeout(
                    Duration::from_secs(self.timeout_secs),
                    self.runner.run(&self.node, &self.ctx),
                ) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(WorkflowError::NodeTimeout {
                        node_id: node_id.clone(),
                        seconds: self.timeout_secs,
                    }),
                },
            };

            match outcome {
                Ok(output) => {
                    self.ctx.record_outputs(&node_id, output.outputs.clone());
                    self.state.outputs = output.outputs;
                    self.state.artifacts = output.artifacts;
                    self.state.assigned_agent = output.agent;
                    let _ = self.state.transition(&node_id, NodeStatus::Completed);
                    self.emitter.emit(WorkflowEvent::NodeCompleted {
                        workflow_id: self.workflow_id.clone(),
                        node_id: node_id.clone(),
                        duration_ms: attempt_started.elapsed().as_millis() as u64,
                    });
                    break;
                }
                Err(WorkflowError::Cancelled) => {
                    let _ = self.state.transition(&node_id, NodeStatus::Cancelled);
                    self.state.reason = Some("cancelled".to_string());
                    break;
                }
                Err(error) => {
                    let attempts = self.state.attempts;
                    let will_retry = attempts < max_attempts && !token.is_cancelled();
                    let _ = self.state.transition(&node_id, NodeStatus::Failed);
                    self.state.reason = Some(error.to_string());
                    self.emitter.emit(WorkflowEvent::NodeFailed {
                        workflow_id: self.workflow_id.clone(),
                        node_id: node_id.clone(),
                        reason: error.to_string(),
                        will_retry,
                    });
                    if !will_retry {
                        break;
                    }
                    let _ = self.state.transition(&node_id, NodeStatus::Ready);
                    let backoff = self.node.config.retry.backoff(attempts - 1);
                    tokio::select! {
                        _ = token.cancelled() => {
                            let _ = self.state.transition(&node_id, NodeStatus::Cancelled);
                            self.state.reason = Some("cancelled".to_string());
                            break;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        (node_id, self.state)
    }
}
