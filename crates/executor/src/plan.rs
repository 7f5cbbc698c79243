//! Plan execution over a bounded worker budget.

use crate::{Error, Result};
use morph_builder::{BuildOutcome, ChunkBuilder, assemble_aggregate};
use morph_graph::{BuildGraph, NodeIndex, UnitKind};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of one unit inside the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Waiting on dependencies.
    Pending,
    /// All dependencies satisfied; queued.
    Ready,
    /// Handed to a build task.
    Building,
    /// Found in the cache; never built here.
    SkippedCached,
    /// Built and committed.
    Done,
    /// The build failed.
    Failed,
    /// Never ran: a dependency failed or the request was cancelled.
    Cancelled,
}

impl UnitState {
    const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::SkippedCached | Self::Done | Self::Failed | Self::Cancelled
        )
    }
}

/// Progress notifications emitted while executing.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A unit started building.
    Started {
        /// The unit's display label.
        label: String,
        /// Units finished so far.
        finished: usize,
        /// Total units in the plan.
        total: usize,
    },
    /// A unit reached a terminal state.
    Finished {
        /// The unit's display label.
        label: String,
        /// The terminal state.
        state: UnitState,
    },
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Parallelism budget: concurrent builds (0 = one per core).
    pub max_parallel: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_parallel: 0 }
    }
}

impl ExecutorConfig {
    fn effective_parallelism(&self) -> usize {
        if self.max_parallel == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZero::get)
        } else {
            self.max_parallel
        }
    }
}

/// Summary of a finished (or aborted) execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Units built here.
    pub built: usize,
    /// Units skipped as cache hits.
    pub cached: usize,
    /// Labels of failed units.
    pub failed: Vec<String>,
    /// Units cancelled without running.
    pub cancelled: usize,
}

impl ExecutionReport {
    /// Whether every unit completed successfully (built or cached).
    #[must_use]
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.cancelled == 0
    }
}

enum TaskResult {
    Outcome(BuildOutcome),
    TransientError(String),
    FatalError(String),
}

/// Executes one build graph to completion.
pub struct PlanExecutor {
    builder: Arc<ChunkBuilder>,
    config: ExecutorConfig,
    staging_root: std::path::PathBuf,
}

impl PlanExecutor {
    /// Create an executor that builds through `builder`.
    #[must_use]
    pub fn new(
        builder: Arc<ChunkBuilder>,
        config: ExecutorConfig,
        staging_root: std::path::PathBuf,
    ) -> Self {
        Self {
            builder,
            config,
            staging_root,
        }
    }

    /// Drive every unit of `graph` to a terminal state.
    ///
    /// Ready units are dispatched in deterministic order (kind priority,
    /// then cache key). A failure cancels its transitive dependents;
    /// independent subgraphs keep building. `cancel` drops ready units and
    /// aborts running builds.
    pub async fn execute(
        &self,
        graph: &BuildGraph,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Result<ExecutionReport> {
        let total = graph.len();
        let mut state: HashMap<NodeIndex, UnitState> = HashMap::with_capacity(total);
        let mut pending_deps: HashMap<NodeIndex, usize> = HashMap::with_capacity(total);
        let mut ready: BinaryHeap<Reverse<(u8, String, usize)>> = BinaryHeap::new();
        let mut index_of: HashMap<usize, NodeIndex> = HashMap::new();
        let mut retried: HashSet<NodeIndex> = HashSet::new();
        let mut builds_in_flight: HashSet<String> = HashSet::new();

        for node in graph.indices() {
            let deps = graph.dependencies(node).len();
            pending_deps.insert(node, deps);
            index_of.insert(node.index(), node);
            if deps == 0 {
                state.insert(node, UnitState::Ready);
                ready.push(ready_entry(graph, node));
            } else {
                state.insert(node, UnitState::Pending);
            }
        }

        let budget = self.config.effective_parallelism();
        let mut tasks: JoinSet<(usize, TaskResult)> = JoinSet::new();
        let mut finished = 0usize;
        info!(units = total, budget, "Executing build plan");

        loop {
            // Dispatch as many ready units as the budget allows.
            let mut deferred = Vec::new();
            while tasks.len() < budget && !cancel.is_cancelled() {
                let Some(Reverse((_, _, raw_index))) = ready.pop() else {
                    break;
                };
                let node = index_of[&raw_index];
                if state[&node] != UnitState::Ready {
                    continue;
                }
                let unit = graph.unit(node);
                // One build at a time per chunk: siblings of an in-flight
                // build become cache hits once it commits.
                if builds_in_flight.contains(&unit.build_id()) {
                    deferred.push(ready_entry(graph, node));
                    continue;
                }
                state.insert(node, UnitState::Building);
                builds_in_flight.insert(unit.build_id());
                if let Some(sender) = &progress {
                    let _ = sender.send(ProgressEvent::Started {
                        label: unit.label(),
                        finished,
                        total,
                    });
                }
                self.spawn_build(graph, node, &mut tasks);
            }
            for entry in deferred {
                ready.push(entry);
            }

            if tasks.is_empty() && ready.is_empty() {
                break;
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    warn!("Build cancelled; aborting running units");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    for (_, unit_state) in state.iter_mut() {
                        if !unit_state.is_terminal() {
                            *unit_state = UnitState::Cancelled;
                        }
                    }
                    break;
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (raw_index, result) = match joined {
                        Ok(pair) => pair,
                        Err(e) if e.is_cancelled() => continue,
                        Err(e) => {
                            return Err(Error::TaskLost {
                                reason: e.to_string(),
                            });
                        }
                    };
                    let node = index_of[&raw_index];
                    builds_in_flight.remove(&graph.unit(node).build_id());
                    finished += 1;
                    self.settle(
                        graph,
                        node,
                        result,
                        &mut state,
                        &mut pending_deps,
                        &mut ready,
                        &mut retried,
                        &mut finished,
                        &progress,
                    );
                }
            }
        }

        let mut report = ExecutionReport {
            built: 0,
            cached: 0,
            failed: Vec::new(),
            cancelled: 0,
        };
        for (node, unit_state) in &state {
            match unit_state {
                UnitState::Done => report.built += 1,
                UnitState::SkippedCached => report.cached += 1,
                UnitState::Failed => report.failed.push(graph.unit(*node).label()),
                UnitState::Cancelled => report.cancelled += 1,
                _ => report.cancelled += 1,
            }
        }
        report.failed.sort();
        info!(
            built = report.built,
            cached = report.cached,
            failed = report.failed.len(),
            cancelled = report.cancelled,
            "Plan execution finished"
        );
        Ok(report)
    }

    fn spawn_build(
        &self,
        graph: &BuildGraph,
        node: NodeIndex,
        tasks: &mut JoinSet<(usize, TaskResult)>,
    ) {
        let unit = graph.unit(node).clone();
        let raw_index = node.index();
        let builder = Arc::clone(&self.builder);
        let staging_root = self.staging_root.clone();
        let deps: Vec<_> = match unit.kind {
            // Chunks stage their transitive chunk dependencies.
            UnitKind::Chunk => transitive_dependencies(graph, node)
                .into_iter()
                .map(|i| graph.unit(i).clone())
                .collect(),
            // Aggregates take their direct members.
            UnitKind::Stratum | UnitKind::System => graph
                .dependencies(node)
                .into_iter()
                .map(|i| graph.unit(i).clone())
                .collect(),
        };

        tasks.spawn(async move {
            let result = match unit.kind {
                UnitKind::Chunk => builder.build(&unit, deps).await,
                UnitKind::Stratum | UnitKind::System => {
                    assemble_aggregate(builder.store(), &staging_root, &unit, deps).await
                }
            };
            let task_result = match result {
                Ok(BuildOutcome::Busy) => {
                    // Another process holds the claim; give it time to land.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    TaskResult::TransientError("cache key busy".to_string())
                }
                Ok(outcome) => TaskResult::Outcome(outcome),
                Err(
                    e @ (morph_builder::Error::StagingIo { .. }
                    | morph_builder::Error::Cache(_)),
                ) => TaskResult::TransientError(e.to_string()),
                Err(e) => TaskResult::FatalError(e.to_string()),
            };
            (raw_index, task_result)
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        graph: &BuildGraph,
        node: NodeIndex,
        result: TaskResult,
        state: &mut HashMap<NodeIndex, UnitState>,
        pending_deps: &mut HashMap<NodeIndex, usize>,
        ready: &mut BinaryHeap<Reverse<(u8, String, usize)>>,
        retried: &mut HashSet<NodeIndex>,
        finished: &mut usize,
        progress: &Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) {
        let label = graph.unit(node).label();
        match result {
            TaskResult::Outcome(outcome) => {
                let new_state = match outcome {
                    BuildOutcome::Built => UnitState::Done,
                    BuildOutcome::AlreadyCached => UnitState::SkippedCached,
                    BuildOutcome::Busy => unreachable!("mapped to transient"),
                };
                state.insert(node, new_state);
                if let Some(sender) = progress {
                    let _ = sender.send(ProgressEvent::Finished {
                        label,
                        state: new_state,
                    });
                }
                for dependent in graph.dependents(node) {
                    let remaining = pending_deps
                        .get_mut(&dependent)
                        .map(|n| {
                            *n = n.saturating_sub(1);
                            *n
                        })
                        .unwrap_or(0);
                    if remaining == 0 && state[&dependent] == UnitState::Pending {
                        state.insert(dependent, UnitState::Ready);
                        ready.push(ready_entry(graph, dependent));
                    }
                }
            }
            TaskResult::TransientError(reason) => {
                if retried.insert(node) {
                    debug!(unit = %label, reason, "Transient failure; retrying once");
                    *finished = finished.saturating_sub(1);
                    state.insert(node, UnitState::Ready);
                    ready.push(ready_entry(graph, node));
                } else {
                    warn!(unit = %label, reason, "Transient failure after retry; unit failed");
                    self.fail(graph, node, state, progress);
                }
            }
            TaskResult::FatalError(reason) => {
                warn!(unit = %label, reason, "Unit failed");
                self.fail(graph, node, state, progress);
            }
        }
    }

    /// Mark a unit failed and cancel its transitive dependents.
    fn fail(
        &self,
        graph: &BuildGraph,
        node: NodeIndex,
        state: &mut HashMap<NodeIndex, UnitState>,
        progress: &Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) {
        state.insert(node, UnitState::Failed);
        if let Some(sender) = progress {
            let _ = sender.send(ProgressEvent::Finished {
                label: graph.unit(node).label(),
                state: UnitState::Failed,
            });
        }
        let mut stack = graph.dependents(node);
        while let Some(dependent) = stack.pop() {
            if state[&dependent].is_terminal() {
                continue;
            }
            state.insert(dependent, UnitState::Cancelled);
            stack.extend(graph.dependents(dependent));
        }
    }
}

/// Deterministic ready-queue ordering: kind priority, then cache key.
fn ready_entry(graph: &BuildGraph, node: NodeIndex) -> Reverse<(u8, String, usize)> {
    let unit = graph.unit(node);
    Reverse((
        unit.kind.priority(),
        unit.cache_key.as_hex().to_string(),
        node.index(),
    ))
}

/// All transitive dependencies of a unit, deduplicated.
fn transitive_dependencies(graph: &BuildGraph, node: NodeIndex) -> Vec<NodeIndex> {
    let mut seen = HashSet::new();
    let mut stack = graph.dependencies(node);
    let mut result = Vec::new();
    while let Some(dep) = stack.pop() {
        if seen.insert(dep) {
            result.push(dep);
            stack.extend(graph.dependencies(dep));
        }
    }
    result
}
