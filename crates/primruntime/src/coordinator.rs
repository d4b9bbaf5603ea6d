use crate::registry::PrimitiveRegistry;
use crate::resolver::DependencyGraph;
use crate::runtime::EngineConfig;
use crate::store::RecordStore;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use primcore::{
    value, ErrorKind, EventBus, ExecutionContext, ExecutionError, ExecutionEvent, NodeContext,
    NodeErrorRecord, NodeId, NodeOutcome, NodeOutput, NodeResult, NodeRunState, NodeSpec,
    RetryPolicy, RunFailure, RunSnapshot, RunStatus, Value, WorkflowGraph, WorkflowRun,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Limits applied to one run, after merging engine defaults with workflow settings.
#[derive(Debug, Clone)]
pub(crate) struct RunLimits {
    pub workflow_timeout: Duration,
    pub node_timeout: Duration,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl RunLimits {
    pub fn for_workflow(config: &EngineConfig, graph: &WorkflowGraph) -> Self {
        let settings = &graph.settings;
        Self {
            workflow_timeout: Duration::from_millis(
                settings.timeout_ms.unwrap_or(config.workflow_timeout_ms),
            ),
            node_timeout: Duration::from_millis(
                settings.node_timeout_ms.unwrap_or(config.node_timeout_ms),
            ),
            max_concurrency: settings.max_concurrency.unwrap_or(config.max_concurrency).max(1),
            retry: settings.retry.clone().unwrap_or_else(|| config.retry.clone()),
        }
    }

    fn retry_for<'a>(&'a self, node: &'a NodeSpec) -> &'a RetryPolicy {
        node.retry.as_ref().unwrap_or(&self.retry)
    }

    fn timeout_for(&self, node: &NodeSpec) -> Duration {
        node.timeout_ms.map(Duration::from_millis).unwrap_or(self.node_timeout)
    }
}

/// Latest published state of a run, observed through a `watch` channel.
#[derive(Debug, Clone)]
pub(crate) struct RunProgress {
    pub snapshot: RunSnapshot,
    /// Final execution context, set once the run is terminal
    pub outputs: Option<Arc<BTreeMap<NodeId, Value>>>,
}

impl RunProgress {
    pub fn new(snapshot: RunSnapshot) -> Self {
        Self {
            snapshot,
            outputs: None,
        }
    }
}

/// What one spawned attempt reports back to the control loop.
struct AttemptReport {
    node_id: NodeId,
    attempt: u32,
    result: Result<NodeOutput, ExecutionError>,
    duration_ms: u64,
}

type InFlight = FuturesUnordered<BoxFuture<'static, AttemptReport>>;

enum Stop {
    Drained,
    Cancelled,
    TimedOut,
}

/// Drives a single workflow run from `running` to a terminal status.
///
/// The coordinator is the only writer of the run record and the execution
/// context. Node attempts run as spawned tasks; their reports come back to
/// the control loop, which applies them one at a time.
pub(crate) struct RunCoordinator {
    run: WorkflowRun,
    graph: Arc<WorkflowGraph>,
    deps: DependencyGraph,
    registry: Arc<PrimitiveRegistry>,
    store: Arc<dyn RecordStore>,
    events: Arc<EventBus>,
    progress: watch::Sender<RunProgress>,
    cancel: CancellationToken,
    limits: RunLimits,
    context: ExecutionContext,
    branches: HashMap<NodeId, String>,
    first_failure: Option<NodeErrorRecord>,
}

impl RunCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run: WorkflowRun,
        graph: Arc<WorkflowGraph>,
        deps: DependencyGraph,
        registry: Arc<PrimitiveRegistry>,
        store: Arc<dyn RecordStore>,
        events: Arc<EventBus>,
        progress: watch::Sender<RunProgress>,
        cancel: CancellationToken,
        limits: RunLimits,
        trigger_data: Value,
    ) -> Self {
        Self {
            run,
            graph,
            deps,
            registry,
            store,
            events,
            progress,
            cancel,
            limits,
            context: ExecutionContext::new(trigger_data),
            branches: HashMap::new(),
            first_failure: None,
        }
    }

    /// Run the control loop to completion and return the terminal snapshot.
    pub async fn run(mut self) -> RunSnapshot {
        let started = Instant::now();
        let deadline = started + self.limits.workflow_timeout;
        let cancel = self.cancel.clone();
        let node_cancel = cancel.child_token();
        let mut in_flight: InFlight = FuturesUnordered::new();

        tracing::info!(
            run_id = %self.run.id,
            workflow = %self.run.workflow_name,
            nodes = self.run.nodes.len(),
            "Starting workflow run"
        );
        self.events.emit(ExecutionEvent::RunStarted {
            run_id: self.run.id,
            workflow_id: self.run.workflow_id,
            timestamp: Utc::now(),
        });
        self.persist().await;

        let stop = loop {
            if cancel.is_cancelled() {
                break Stop::Cancelled;
            }
            if Instant::now() >= deadline {
                break Stop::TimedOut;
            }

            self.schedule(&mut in_flight, &node_cancel).await;

            if in_flight.is_empty() {
                break Stop::Drained;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Stop::Cancelled,
                _ = time::sleep_until(deadline) => break Stop::TimedOut,
                Some(report) = in_flight.next() => {
                    self.apply_report(report, &mut in_flight, &node_cancel).await;
                }
            }
        };

        // In-flight attempts keep running in the background; their results are dropped.
        node_cancel.cancel();
        drop(in_flight);

        self.finalize(stop, started).await
    }

    /// Apply skips and dispatch ready nodes up to the concurrency limit.
    async fn schedule(&mut self, in_flight: &mut InFlight, node_cancel: &CancellationToken) {
        let resolution = self.deps.resolve(&self.run.states(), &self.branches);

        for node_id in &resolution.skipped {
            tracing::debug!(run_id = %self.run.id, node_id = %node_id, "Skipping node");
            self.transition(node_id, NodeRunState::Skipped).await;
        }

        let free = self.limits.max_concurrency.saturating_sub(in_flight.len());
        for node_id in resolution.ready.into_iter().take(free) {
            self.transition(&node_id, NodeRunState::Ready).await;
            self.transition(&node_id, NodeRunState::Running).await;
            if let Some(attempt) = self.spawn_attempt(&node_id, Duration::ZERO, node_cancel) {
                in_flight.push(attempt);
            }
        }
    }

    fn spawn_attempt(
        &self,
        node_id: &str,
        delay: Duration,
        node_cancel: &CancellationToken,
    ) -> Option<BoxFuture<'static, AttemptReport>> {
        let node = self.graph.find_node(node_id)?;
        let attempt = self.run.attempts(node_id);
        let timeout = self.limits.timeout_for(node);
        let ctx = NodeContext {
            run_id: self.run.id,
            node_id: node.id.clone(),
            subtype: node.subtype.clone(),
            config: node.config.clone(),
            input: self.assemble_input(node_id),
            context: self.context.snapshot(),
            attempt,
            events: self.events.create_emitter(self.run.id, node.id.clone()),
            cancellation: node_cancel.child_token(),
        };
        let registry = Arc::clone(&self.registry);
        let primitive_type = node.primitive_type.clone();
        let declared_inputs = node.inputs.clone();
        let report_id = node.id.clone();

        let task = async move {
            let node_id = ctx.node_id.clone();
            if !delay.is_zero() {
                tokio::select! {
                    _ = ctx.cancellation.cancelled() => {}
                    _ = time::sleep(delay) => {}
                }
            }
            // The run stopped while this attempt was waiting to start.
            if ctx.cancellation.is_cancelled() {
                return AttemptReport {
                    node_id,
                    attempt,
                    result: Err(ExecutionError::cancelled()),
                    duration_ms: 0,
                };
            }

            let start = Instant::now();
            let result = match missing_inputs(&ctx.input, &declared_inputs) {
                Some(error) => Err(error),
                None => {
                    let dispatch = registry.dispatch(&primitive_type, ctx);
                    match time::timeout(timeout, dispatch).await {
                        Ok(result) => result,
                        Err(_) => Err(ExecutionError::timeout(timeout.as_millis() as u64)),
                    }
                }
            };
            AttemptReport {
                node_id,
                attempt,
                result,
                duration_ms: start.elapsed().as_millis() as u64,
            }
        };

        let joined = tokio::spawn(task).map(move |joined| {
            joined.unwrap_or_else(|err| AttemptReport {
                node_id: report_id,
                attempt,
                result: Err(ExecutionError::permanent(
                    ErrorKind::Internal,
                    format!("executor task failed: {}", err),
                )),
                duration_ms: 0,
            })
        });
        Some(joined.boxed())
    }

    /// Entry nodes get the trigger data, single-parent nodes their parent's
    /// output, join nodes an object keyed by parent id.
    fn assemble_input(&self, node_id: &str) -> Value {
        let upstream = self.deps.upstream(node_id);
        let output_of = |id: &str| self.context.get(id).cloned().unwrap_or(Value::Null);
        match upstream.as_slice() {
            [] => self.context.trigger_data().clone(),
            [single] => output_of(single),
            many => Value::Object(many.iter().map(|id| (id.clone(), output_of(id))).collect()),
        }
    }

    async fn apply_report(
        &mut self,
        report: AttemptReport,
        in_flight: &mut InFlight,
        node_cancel: &CancellationToken,
    ) {
        let AttemptReport {
            node_id,
            attempt,
            result,
            duration_ms,
        } = report;
        let Some(node) = self.graph.find_node(&node_id).cloned() else {
            return;
        };

        match result {
            Ok(output) => {
                tracing::info!(
                    run_id = %self.run.id,
                    node_id = %node_id,
                    attempt,
                    duration_ms,
                    "Node succeeded"
                );
                self.warn_missing_outputs(&node, &output.data);
                let outcome = NodeOutcome::Succeeded {
                    output: output.data.clone(),
                    branch: output.branch.clone(),
                };
                self.save_result(&node_id, attempt, duration_ms, outcome).await;

                if !self.context.insert(node_id.clone(), output.data) {
                    tracing::error!(
                        run_id = %self.run.id,
                        node_id = %node_id,
                        "Context already holds an output for node"
                    );
                }
                if let Some(branch) = output.branch {
                    self.branches.insert(node_id.clone(), branch);
                }
                self.transition(&node_id, NodeRunState::Succeeded).await;
            }
            Err(error) => {
                let record = NodeErrorRecord::new(node_id.clone(), attempt, &error);
                self.run.record_error(record.clone());
                let outcome = NodeOutcome::Failed {
                    error: error.clone(),
                };
                self.save_result(&node_id, attempt, duration_ms, outcome).await;

                let policy = self.limits.retry_for(&node);
                if error.retryable && policy.allows_retry_after(attempt) {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        run_id = %self.run.id,
                        node_id = %node_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Node attempt failed, retrying"
                    );
                    self.events.emit(ExecutionEvent::NodeRetryScheduled {
                        run_id: self.run.id,
                        node_id: node_id.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: error.to_string(),
                        timestamp: Utc::now(),
                    });
                    if self.run.record_retry(&node_id).is_some() {
                        self.persist().await;
                        if let Some(next) = self.spawn_attempt(&node_id, delay, node_cancel) {
                            in_flight.push(next);
                        }
                    }
                } else {
                    tracing::error!(
                        run_id = %self.run.id,
                        node_id = %node_id,
                        attempt,
                        error = %error,
                        "Node failed"
                    );
                    self.first_failure.get_or_insert(record);
                    self.transition(&node_id, NodeRunState::Failed).await;
                }
            }
        }
    }

    fn warn_missing_outputs(&self, node: &NodeSpec, data: &Value) {
        let missing: Vec<&str> = node
            .outputs
            .iter()
            .filter(|key| value::lookup(data, key).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                run_id = %self.run.id,
                node_id = %node.id,
                missing = ?missing,
                "Node output lacks declared keys"
            );
        }
    }

    /// Mark every node still running as failed with `error`.
    async fn abandon_in_flight(&mut self, error: ExecutionError) {
        for node_id in self.run.nodes_in(NodeRunState::Running) {
            let attempt = self.run.attempts(&node_id);
            self.run.record_error(NodeErrorRecord::new(node_id.clone(), attempt, &error));
            self.transition(&node_id, NodeRunState::Failed).await;
        }
    }

    async fn finalize(mut self, stop: Stop, started: Instant) -> RunSnapshot {
        let (status, message) = match stop {
            Stop::Cancelled => {
                self.abandon_in_flight(ExecutionError::cancelled()).await;
                (RunStatus::Cancelled, Some("run cancelled".to_string()))
            }
            Stop::TimedOut => {
                let limit = self.limits.workflow_timeout.as_millis() as u64;
                self.abandon_in_flight(ExecutionError::permanent(
                    ErrorKind::Timeout,
                    format!("workflow deadline of {}ms exceeded", limit),
                ))
                .await;
                (RunStatus::TimedOut, Some(format!("run timed out after {}ms", limit)))
            }
            Stop::Drained => {
                let failed = self.run.nodes_in(NodeRunState::Failed);
                let stuck: Vec<NodeId> = self
                    .run
                    .nodes
                    .iter()
                    .filter(|(_, record)| !record.state.is_terminal())
                    .map(|(id, _)| id.clone())
                    .collect();
                if !failed.is_empty() {
                    let message = format!("{} node(s) failed: {}", failed.len(), failed.join(", "));
                    (RunStatus::Failed, Some(message))
                } else if !stuck.is_empty() {
                    let message = format!("no runnable nodes left: {}", stuck.join(", "));
                    (RunStatus::Failed, Some(message))
                } else {
                    (RunStatus::Completed, None)
                }
            }
        };

        let failure = message.map(|message| RunFailure {
            message,
            node_error: self.first_failure.clone(),
            skipped: self.run.nodes_in(NodeRunState::Skipped),
        });
        self.run.finish(status, failure);
        if let Err(err) = self.store.save_run_state(&self.run).await {
            tracing::error!(
                run_id = %self.run.id,
                error = %err,
                "Failed to persist final run state"
            );
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.events.emit(ExecutionEvent::RunFinished {
            run_id: self.run.id,
            status,
            duration_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(
            run_id = %self.run.id,
            status = %status,
            duration_ms,
            "Workflow run finished"
        );

        let snapshot = self.run.snapshot();
        self.progress.send_replace(RunProgress {
            snapshot: snapshot.clone(),
            outputs: Some(Arc::new(self.context.snapshot().to_map())),
        });
        snapshot
    }

    async fn transition(&mut self, node_id: &str, to: NodeRunState) {
        match self.run.transition(node_id, to) {
            Ok(from) => {
                self.events.emit(ExecutionEvent::NodeStateChanged {
                    run_id: self.run.id,
                    node_id: node_id.to_string(),
                    from,
                    to,
                    attempt: self.run.attempts(node_id),
                    timestamp: Utc::now(),
                });
                self.persist().await;
            }
            Err(err) => {
                tracing::error!(run_id = %self.run.id, error = %err, "Rejected node transition");
            }
        }
    }

    /// Write the run record and publish it to status watchers.
    async fn persist(&self) {
        if let Err(err) = self.store.save_run_state(&self.run).await {
            tracing::error!(run_id = %self.run.id, error = %err, "Failed to persist run state");
        }
        self.progress.send_replace(RunProgress::new(self.run.snapshot()));
    }

    async fn save_result(
        &self,
        node_id: &str,
        attempt: u32,
        duration_ms: u64,
        outcome: NodeOutcome,
    ) {
        let result = NodeResult {
            node_id: node_id.to_string(),
            attempt,
            outcome,
            duration_ms,
            recorded_at: Utc::now(),
        };
        if let Err(err) = self.store.save_node_result(self.run.id, node_id, &result).await {
            tracing::error!(
                run_id = %self.run.id,
                node_id,
                error = %err,
                "Failed to persist node result"
            );
        }
    }
}

/// Declared input keys absent from the node's input data.
fn missing_inputs(input: &Value, declared: &[String]) -> Option<ExecutionError> {
    let missing: Vec<&str> = declared
        .iter()
        .filter(|key| value::lookup(input, key).is_none())
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(ExecutionError::invalid_data(format!(
            "missing declared input(s): {}",
            missing.join(", ")
        )))
    }
}
