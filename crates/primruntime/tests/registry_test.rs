mod common;

use common::{registry, step, Recorder, ScriptedExecutor};
use primcore::{
    ConfigSchema, ContextSnapshot, ErrorKind, EventBus, ExecutionContext, NodeContext,
    PrimitiveExecutor, PrimitiveKind, Value, WorkflowError, WorkflowGraph,
};
use primruntime::PrimitiveRegistry;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn context(subtype: &str, config: Value) -> NodeContext {
    let bus = EventBus::new(16);
    let run_id = Uuid::new_v4();
    let snapshot: ContextSnapshot = ExecutionContext::new(json!({})).snapshot();
    NodeContext {
        run_id,
        node_id: "n".to_string(),
        subtype: subtype.to_string(),
        config: config.as_object().cloned().unwrap_or_default(),
        input: json!({"hello": "world"}),
        context: snapshot,
        attempt: 1,
        events: bus.create_emitter(run_id, "n"),
        cancellation: CancellationToken::new(),
    }
}

/// Executor relying on the trait's default config validation.
struct Minimal;

#[async_trait::async_trait]
impl PrimitiveExecutor for Minimal {
    fn kind(&self) -> PrimitiveKind {
        PrimitiveKind::Data
    }

    fn subtypes(&self) -> Vec<&'static str> {
        vec!["only"]
    }

    fn schema(&self, subtype: &str) -> Option<ConfigSchema> {
        (subtype == "only").then_some(ConfigSchema::new(&["needed"], &[]))
    }

    async fn execute(
        &self,
        ctx: NodeContext,
    ) -> Result<primcore::NodeOutput, primcore::ExecutionError> {
        Ok(primcore::NodeOutput::new(ctx.input))
    }
}

#[test]
fn test_duplicate_registration_rejected() {
    let recorder = Recorder::new();
    let mut registry = registry(&recorder);

    let err = registry
        .register("step", Arc::new(Minimal))
        .expect_err("type name already taken");
    assert_eq!(err, WorkflowError::DuplicateRegistration("step".into()));

    // Overriding is explicit.
    assert!(registry.register_override("step", Arc::new(Minimal)).is_some());
    assert_eq!(registry.describe("step").map(|info| info.kind), Some(PrimitiveKind::Data));
}

#[test]
fn test_listing_and_description() {
    let recorder = Recorder::new();
    let mut registry = registry(&recorder);
    registry.register("minimal", Arc::new(Minimal)).unwrap();

    assert_eq!(registry.list_types(), vec!["gate", "minimal", "step"]);
    assert!(registry.contains("minimal"));
    assert!(!registry.contains("missing"));

    let info = registry.describe("step").unwrap();
    assert_eq!(info.kind, PrimitiveKind::Action);
    assert_eq!(info.subtypes, vec!["scripted"]);
    assert_eq!(info.description, "Test executor following its configuration");

    assert!(registry.unregister("minimal").is_some());
    assert_eq!(registry.list_types(), vec!["gate", "step"]);
}

#[test]
fn test_validate_node_config() {
    let mut registry = PrimitiveRegistry::new();
    registry.register("minimal", Arc::new(Minimal)).unwrap();

    let good = json!({"needed": 1, "label": "ok"});
    assert!(registry
        .validate_node_config("minimal", "only", good.as_object().unwrap())
        .is_ok());

    let bad = json!({"stray": 1});
    let Err(WorkflowError::Validation(err)) =
        registry.validate_node_config("minimal", "only", bad.as_object().unwrap())
    else {
        panic!("expected validation error");
    };
    let keys: Vec<_> = err.issues.iter().filter_map(|i| i.key.as_deref()).collect();
    assert_eq!(keys, vec!["needed", "stray"]);

    let Err(WorkflowError::Validation(err)) =
        registry.validate_node_config("minimal", "other", good.as_object().unwrap())
    else {
        panic!("expected validation error");
    };
    assert_eq!(err.issues[0].key.as_deref(), Some("subtype"));

    assert_eq!(
        registry.validate_node_config("nope", "only", good.as_object().unwrap()),
        Err(WorkflowError::UnknownPrimitive("nope".into()))
    );
}

#[test]
fn test_validate_graph_tags_issues_with_node() {
    let recorder = Recorder::new();
    let registry = registry(&recorder);

    let mut graph = WorkflowGraph::new("g");
    graph.add_node(step("fine"));
    graph.add_node(step("bad").with_config("sleep_ms", 1).with_config("colour", "red"));
    graph.add_node(primcore::NodeSpec::new("alien", "martian", "x"));

    let err = registry.validate_graph(&graph).unwrap_err();
    assert_eq!(err.issues.len(), 2);
    assert_eq!(err.issues[0].node_id.as_deref(), Some("bad"));
    assert_eq!(err.issues[0].key.as_deref(), Some("colour"));
    assert_eq!(err.issues[1].node_id.as_deref(), Some("alien"));
}

#[tokio::test]
async fn test_dispatch() {
    let recorder = Recorder::new();
    let registry = registry(&recorder);

    let output = registry
        .dispatch("step", context("scripted", json!({"output": {"done": true}})))
        .await
        .unwrap();
    assert_eq!(output.data, json!({"done": true}));
    assert_eq!(recorder.started(), vec!["n"]);

    let err = registry
        .dispatch("nope", context("scripted", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownPrimitive);
    assert!(!err.retryable);
}

#[tokio::test]
async fn test_registries_are_isolated() {
    let first = Recorder::new();
    let second = Recorder::new();
    let a = registry(&first);
    let _b = registry(&second);

    a.dispatch("step", context("scripted", json!({}))).await.unwrap();

    assert_eq!(first.started().len(), 1);
    assert!(second.started().is_empty());
}

#[tokio::test]
async fn test_scripted_executor_is_usable_directly() {
    let recorder = Recorder::new();
    let executor = ScriptedExecutor::new(Arc::clone(&recorder));

    let err = executor
        .execute(context("scripted", json!({"fail_times": 1, "retryable": false})))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Network);
    assert!(!err.retryable);
}
