use crate::coordinator::{RunCoordinator, RunLimits, RunProgress};
use crate::registry::PrimitiveRegistry;
use crate::resolver::DependencyGraph;
use crate::store::{MemoryRecordStore, RecordStore};
use primcore::{
    EventBus, ExecutionEvent, NodeId, NodeOutcome, RetryPolicy, RunId, RunSnapshot, ValidationError,
    Value, WorkflowError, WorkflowGraph, WorkflowRun,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Configuration for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline for a whole run
    pub workflow_timeout_ms: u64,
    /// Deadline for each node attempt
    pub node_timeout_ms: u64,
    /// Maximum number of node attempts in flight per run
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub event_buffer_size: usize,
    /// How long a finished run stays in memory before it is evicted.
    /// `None` keeps it until `Engine::forget_run`.
    pub finished_run_retention_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflow_timeout_ms: 30 * 60 * 1000,
            node_timeout_ms: 5 * 60 * 1000,
            max_concurrency: 5,
            retry: RetryPolicy::default(),
            event_buffer_size: 1000,
            finished_run_retention_ms: None,
        }
    }
}

struct RunSlot {
    progress: watch::Receiver<RunProgress>,
    cancel: CancellationToken,
}

/// Main entry point: validates graphs, starts runs and answers status queries
pub struct Engine {
    registry: Arc<PrimitiveRegistry>,
    store: Arc<dyn RecordStore>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
    runs: Arc<RwLock<HashMap<RunId, RunSlot>>>,
}

impl Engine {
    pub fn new(
        registry: Arc<PrimitiveRegistry>,
        store: Arc<dyn RecordStore>,
        config: EngineConfig,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            registry,
            store,
            event_bus,
            config,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Engine with an in-memory record store and default limits.
    pub fn with_registry(registry: PrimitiveRegistry) -> Self {
        Self::new(
            Arc::new(registry),
            Arc::new(MemoryRecordStore::new()),
            EngineConfig::default(),
        )
    }

    pub fn registry(&self) -> &Arc<PrimitiveRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate a graph and return its execution order.
    ///
    /// Shape and configuration problems are reported together; a cycle is
    /// only reported for a graph that is otherwise valid.
    pub fn validate(&self, graph: &WorkflowGraph) -> Result<Vec<NodeId>, WorkflowError> {
        self.prepare(graph)?.topological_check()
    }

    fn prepare(&self, graph: &WorkflowGraph) -> Result<DependencyGraph, WorkflowError> {
        let mut issues = graph.structure_issues();
        if let Err(err) = self.registry.validate_graph(graph) {
            issues.extend(err.issues);
        }
        ValidationError::check(issues)?;

        // A graph without an entry point is a ring; the cycle check names its nodes.
        let deps = DependencyGraph::build(graph)?;
        deps.topological_check()?;
        Ok(deps)
    }

    /// Validate `graph` and start running it under `run_id`.
    ///
    /// Validation and cycle errors are returned here and no run is created.
    pub async fn start_run(
        &self,
        graph: WorkflowGraph,
        run_id: RunId,
        trigger_data: Value,
    ) -> Result<RunHandle, WorkflowError> {
        let deps = self.prepare(&graph)?;

        let mut runs = self.runs.write().await;
        let persisted = match self.store.load_run(run_id).await {
            Ok(run) => run.is_some(),
            Err(err) => {
                tracing::warn!(
                    run_id = %run_id,
                    error = %err,
                    "Could not check record store for run id"
                );
                false
            }
        };
        if runs.contains_key(&run_id) || persisted {
            return Err(WorkflowError::DuplicateRun(run_id));
        }

        let limits = RunLimits::for_workflow(&self.config, &graph);
        let run = WorkflowRun::new(run_id, &graph);
        let (progress_tx, progress_rx) = watch::channel(RunProgress::new(run.snapshot()));
        let cancel = CancellationToken::new();

        let coordinator = RunCoordinator::new(
            run,
            Arc::new(graph),
            deps,
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.event_bus),
            progress_tx,
            cancel.clone(),
            limits,
            trigger_data,
        );

        runs.insert(
            run_id,
            RunSlot {
                progress: progress_rx.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(runs);

        let runs = Arc::clone(&self.runs);
        let retention = self.config.finished_run_retention_ms.map(Duration::from_millis);
        tokio::spawn(async move {
            coordinator.run().await;
            if let Some(retention) = retention {
                tokio::time::sleep(retention).await;
                if runs.write().await.remove(&run_id).is_some() {
                    tracing::debug!(run_id = %run_id, "Evicted finished run from memory");
                }
            }
        });

        Ok(RunHandle {
            run_id,
            progress: progress_rx,
            cancel,
        })
    }

    /// Start a run under a fresh id and wait for it to finish.
    pub async fn run(
        &self,
        graph: WorkflowGraph,
        trigger_data: Value,
    ) -> Result<RunSnapshot, WorkflowError> {
        let mut handle = self.start_run(graph, Uuid::new_v4(), trigger_data).await?;
        Ok(handle.wait().await)
    }

    /// Current status of a run.
    pub async fn get_run_status(&self, run_id: RunId) -> Result<RunSnapshot, WorkflowError> {
        if let Some(slot) = self.runs.read().await.get(&run_id) {
            return Ok(slot.progress.borrow().snapshot.clone());
        }

        match self.store.load_run(run_id).await {
            Ok(Some(run)) => Ok(run.snapshot()),
            Ok(None) => Err(WorkflowError::RunNotFound(run_id)),
            Err(err) => {
                tracing::error!(
                    run_id = %run_id,
                    error = %err,
                    "Failed to load run from record store"
                );
                Err(WorkflowError::RunNotFound(run_id))
            }
        }
    }

    /// Final execution context of a terminal run.
    pub async fn get_run_result(
        &self,
        run_id: RunId,
    ) -> Result<BTreeMap<NodeId, Value>, WorkflowError> {
        if let Some(slot) = self.runs.read().await.get(&run_id) {
            let progress = slot.progress.borrow();
            return match &progress.outputs {
                Some(outputs) if progress.snapshot.status.is_terminal() => {
                    Ok(outputs.as_ref().clone())
                }
                _ => Err(WorkflowError::RunNotTerminal(run_id)),
            };
        }

        // Evicted run: rebuild the context from the persisted attempt results.
        let snapshot = self.get_run_status(run_id).await?;
        if !snapshot.status.is_terminal() {
            return Err(WorkflowError::RunNotTerminal(run_id));
        }
        let results = self.store.node_results(run_id).await.unwrap_or_else(|err| {
            tracing::error!(run_id = %run_id, error = %err, "Failed to load node results");
            Vec::new()
        });
        Ok(results
            .into_iter()
            .filter_map(|result| match result.outcome {
                NodeOutcome::Succeeded { output, .. } => Some((result.node_id, output)),
                NodeOutcome::Failed { .. } => None,
            })
            .collect())
    }

    /// Ask a run to stop. No-op for a run that already finished.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), WorkflowError> {
        let runs = self.runs.read().await;
        let slot = runs.get(&run_id).ok_or(WorkflowError::RunNotFound(run_id))?;
        if !slot.progress.borrow().snapshot.status.is_terminal() {
            tracing::info!(run_id = %run_id, "Cancelling run");
            slot.cancel.cancel();
        }
        Ok(())
    }

    /// Drop a finished run from memory; later queries go to the record store.
    pub async fn forget_run(&self, run_id: RunId) -> bool {
        let mut runs = self.runs.write().await;
        let terminal = runs
            .get(&run_id)
            .is_some_and(|slot| slot.progress.borrow().snapshot.status.is_terminal());
        terminal && runs.remove(&run_id).is_some()
    }

    /// Ids of runs currently held in memory.
    pub async fn run_ids(&self) -> Vec<RunId> {
        self.runs.read().await.keys().copied().collect()
    }

    /// Subscribe to execution events of every run
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

/// Handle to a started run
pub struct RunHandle {
    run_id: RunId,
    progress: watch::Receiver<RunProgress>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.progress.borrow().snapshot.clone()
    }

    /// Request cancellation; same as `Engine::cancel_run`.
    pub fn cancel(&self) {
        if !self.progress.borrow().snapshot.status.is_terminal() {
            self.cancel.cancel();
        }
    }

    /// Wait until the run reaches a terminal status.
    pub async fn wait(&mut self) -> RunSnapshot {
        loop {
            {
                let progress = self.progress.borrow_and_update();
                if progress.snapshot.status.is_terminal() {
                    return progress.snapshot.clone();
                }
            }
            if self.progress.changed().await.is_err() {
                return self.progress.borrow().snapshot.clone();
            }
        }
    }

    /// Final context once the run is terminal.
    pub fn outputs(&self) -> Option<BTreeMap<NodeId, Value>> {
        self.progress
            .borrow()
            .outputs
            .as_ref()
            .map(|outputs| outputs.as_ref().clone())
    }
}
