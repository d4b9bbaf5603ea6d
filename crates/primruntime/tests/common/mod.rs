// Shared fixtures for the runtime integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use primcore::{
    ConfigExt, ConfigSchema, ErrorKind, ExecutionError, ExecutionEvent, NodeContext, NodeId,
    NodeOutput, NodeResult, NodeSpec, PrimitiveExecutor, PrimitiveKind, RetryPolicy, RunId,
    StoreError, WorkflowGraph, WorkflowRun,
};
use primruntime::{Engine, EngineConfig, MemoryRecordStore, PrimitiveRegistry, RecordStore};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Records what the scripted executor saw across a run.
#[derive(Default)]
pub struct Recorder {
    started: Mutex<Vec<NodeId>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Node ids in the order their attempts started.
    pub fn started(&self) -> Vec<NodeId> {
        self.started.lock().unwrap().clone()
    }

    /// Most attempts ever executing at the same moment.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self, node_id: &str) -> Active<'_> {
        self.started.lock().unwrap().push(node_id.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Active(self)
    }
}

struct Active<'a>(&'a Recorder);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Executor driven entirely by node config:
///
/// - `sleep_ms`: wait before answering
/// - `fail_times`: fail attempts `1..=fail_times`
/// - `retryable`: whether those failures may be retried (default true)
/// - `output`: fixed output; otherwise the node echoes its input
/// - `branch`: branch to report
pub struct ScriptedExecutor {
    recorder: Arc<Recorder>,
    kind: PrimitiveKind,
}

impl ScriptedExecutor {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            kind: PrimitiveKind::Action,
        }
    }

    /// Same behaviour, registered as a condition so labelled edges may leave it.
    pub fn condition(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            kind: PrimitiveKind::Condition,
        }
    }
}

const SCRIPTED_KEYS: ConfigSchema =
    ConfigSchema::new(&[], &["sleep_ms", "fail_times", "retryable", "output", "branch"]);

#[async_trait]
impl PrimitiveExecutor for ScriptedExecutor {
    fn kind(&self) -> PrimitiveKind {
        self.kind
    }

    fn subtypes(&self) -> Vec<&'static str> {
        vec!["scripted"]
    }

    fn schema(&self, subtype: &str) -> Option<ConfigSchema> {
        (subtype == "scripted").then_some(SCRIPTED_KEYS)
    }

    fn description(&self) -> &str {
        "Test executor following its configuration"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, ExecutionError> {
        let _active = self.recorder.enter(&ctx.node_id);

        if let Some(ms) = ctx.config.u64_value("sleep_ms") {
            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(ExecutionError::cancelled()),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            }
        }

        let fail_times = ctx.config.u64_value("fail_times").unwrap_or(0);
        if u64::from(ctx.attempt) <= fail_times {
            let retryable = ctx.config.bool_value("retryable").unwrap_or(true);
            return Err(ExecutionError::new(
                ErrorKind::Network,
                format!("scripted failure on attempt {}", ctx.attempt),
                retryable,
            ));
        }

        let data = ctx.config.get("output").cloned().unwrap_or_else(|| {
            json!({
                "node": ctx.node_id,
                "input": ctx.input,
                "attempt": ctx.attempt,
            })
        });
        let mut output = NodeOutput::new(data);
        if let Some(branch) = ctx.config.str_value("branch") {
            output = output.with_branch(branch);
        }
        Ok(output)
    }
}

/// Record store whose every call fails.
pub struct BrokenStore;

#[async_trait]
impl RecordStore for BrokenStore {
    async fn save_run_state(&self, _run: &WorkflowRun) -> Result<(), StoreError> {
        Err(StoreError::Backend("disk on fire".into()))
    }

    async fn save_node_result(
        &self,
        _run_id: RunId,
        _node_id: &str,
        _result: &NodeResult,
    ) -> Result<(), StoreError> {
        Err(StoreError::Backend("disk on fire".into()))
    }

    async fn load_run(&self, _run_id: RunId) -> Result<Option<WorkflowRun>, StoreError> {
        Err(StoreError::Backend("disk on fire".into()))
    }

    async fn node_results(&self, _run_id: RunId) -> Result<Vec<NodeResult>, StoreError> {
        Err(StoreError::Backend("disk on fire".into()))
    }
}

pub fn registry(recorder: &Arc<Recorder>) -> PrimitiveRegistry {
    let mut registry = PrimitiveRegistry::new();
    registry
        .register("step", Arc::new(ScriptedExecutor::new(Arc::clone(recorder))))
        .unwrap();
    registry
        .register("gate", Arc::new(ScriptedExecutor::condition(Arc::clone(recorder))))
        .unwrap();
    registry
}

/// Defaults with near-instant retries.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::default().with_delays(1, 1.0, 1),
        ..EngineConfig::default()
    }
}

pub fn engine(recorder: &Arc<Recorder>, config: EngineConfig) -> (Engine, Arc<MemoryRecordStore>) {
    init_tracing();
    let store = Arc::new(MemoryRecordStore::new());
    let engine = Engine::new(Arc::new(registry(recorder)), store.clone(), config);
    (engine, store)
}

pub fn step(id: &str) -> NodeSpec {
    NodeSpec::new(id, "step", "scripted")
}

pub fn gate(id: &str, branch: &str) -> NodeSpec {
    NodeSpec::new(id, "gate", "scripted").with_config("branch", branch)
}

/// Nodes wired one after another, in the given order.
pub fn chain(nodes: Vec<NodeSpec>) -> WorkflowGraph {
    let mut graph = WorkflowGraph::new("chain");
    let mut previous: Option<NodeId> = None;
    for node in nodes {
        let id = graph.add_node(node);
        if let Some(previous) = previous.replace(id.clone()) {
            graph.connect(previous, id);
        }
    }
    graph
}

/// Every event already sitting in the receiver.
pub fn drain(events: &mut broadcast::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
