use primcore::value::{lookup, parse_literal, truthy, type_name};
use primcore::{
    ConfigSchema, Edge, EventBus, ExecutionContext, ExecutionEvent, FlowError, NodeEvent,
    NodeRunState, NodeSpec, RetryPolicy, RunStatus, WorkflowGraph, WorkflowRun,
};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

fn two_step_graph() -> WorkflowGraph {
    let mut graph = WorkflowGraph::new("two steps");
    graph.add_node(NodeSpec::new("a", "trigger", "manual"));
    graph.add_node(NodeSpec::new("b", "action", "wait").with_config("duration", 1));
    graph.connect("a", "b");
    graph
}

#[test]
fn test_retry_delays_grow_and_cap() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
    assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
    assert_eq!(policy.delay_for(3), Duration::from_millis(4_000));
    assert_eq!(policy.delay_for(5), Duration::from_millis(10_000));
    assert_eq!(policy.delay_for(60), Duration::from_millis(10_000));

    assert!(policy.allows_retry_after(1));
    assert!(policy.allows_retry_after(2));
    assert!(!policy.allows_retry_after(3));

    let once = RetryPolicy::none();
    assert!(!once.allows_retry_after(1));

    // Zero is treated as a single attempt.
    assert!(!RetryPolicy::default().with_max_attempts(0).allows_retry_after(1));
}

#[test]
fn test_retry_policy_accepts_max_retries_alias() {
    let policy: RetryPolicy =
        serde_json::from_value(json!({"max_retries": 5, "initial_delay_ms": 10})).unwrap();
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.initial_delay_ms, 10);
    assert_eq!(policy.backoff_coefficient, 2.0);
    assert_eq!(policy.max_delay_ms, 10_000);
}

#[test]
fn test_node_state_transitions() {
    use NodeRunState::*;

    assert!(Pending.can_transition_to(Ready));
    assert!(Pending.can_transition_to(Skipped));
    assert!(Ready.can_transition_to(Running));
    assert!(Running.can_transition_to(Succeeded));
    assert!(Running.can_transition_to(Failed));
    assert!(Failed.can_transition_to(Running));

    assert!(!Pending.can_transition_to(Running));
    assert!(!Succeeded.can_transition_to(Running));
    assert!(!Skipped.can_transition_to(Ready));
    assert!(!Running.can_transition_to(Pending));
}

#[test]
fn test_run_record_tracks_attempts() {
    let graph = two_step_graph();
    let mut run = WorkflowRun::new(Uuid::new_v4(), &graph);
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.nodes_in(NodeRunState::Pending), vec!["a", "b"]);

    run.transition("a", NodeRunState::Ready).unwrap();
    run.transition("a", NodeRunState::Running).unwrap();
    assert_eq!(run.attempts("a"), 1);
    assert_eq!(run.record_retry("a"), Some(2));
    assert_eq!(run.state("a"), Some(NodeRunState::Running));
    run.transition("a", NodeRunState::Succeeded).unwrap();

    // Retries only count for a running node.
    assert_eq!(run.record_retry("a"), None);

    let err = run.transition("b", NodeRunState::Succeeded).unwrap_err();
    assert_eq!(err.from, NodeRunState::Pending);
    assert_eq!(run.state("b"), Some(NodeRunState::Pending));
    assert!(run.transition("ghost", NodeRunState::Ready).is_err());

    run.transition("b", NodeRunState::Skipped).unwrap();
    run.finish(RunStatus::Completed, None);
    assert!(run.is_terminal());

    let snapshot = run.snapshot();
    assert_eq!(snapshot.attempts("a"), 2);
    assert_eq!(snapshot.skipped, vec!["b"]);
    assert!(snapshot.finished_at.is_some());
}

#[test]
fn test_run_status_display() {
    assert_eq!(RunStatus::TimedOut.to_string(), "timed_out");
    assert!(!RunStatus::Running.is_terminal());
    assert!(RunStatus::Cancelled.is_terminal());
    assert_eq!(serde_json::to_value(NodeRunState::Succeeded).unwrap(), json!("succeeded"));
}

#[test]
fn test_schema_reports_missing_and_unknown_keys() {
    let schema = ConfigSchema::new(&["url"], &["method"]);
    let config = json!({"method": "GET", "label": "fetch", "zzz": 1, "aaa": 2});

    let issues = schema.check(config.as_object().unwrap());
    let keys: Vec<_> = issues.iter().filter_map(|i| i.key.as_deref()).collect();
    assert_eq!(keys, vec!["url", "aaa", "zzz"]);

    let ok = json!({"url": "https://example.com", "path": "items"});
    assert!(schema.check(ok.as_object().unwrap()).is_empty());
}

#[test]
fn test_lookup_paths() {
    let data = json!({"user": {"name": "ada", "tags": ["x", "y"]}, "count": 3});

    assert_eq!(lookup(&data, "user.name"), Some(&json!("ada")));
    assert_eq!(lookup(&data, "$.user.tags.1"), Some(&json!("y")));
    assert_eq!(lookup(&data, "$"), Some(&data));
    assert_eq!(lookup(&data, ""), Some(&data));
    assert_eq!(lookup(&data, "user.missing"), None);
    assert_eq!(lookup(&data, "count.deeper"), None);
    assert_eq!(lookup(&data, "user.tags.9"), None);
}

#[test]
fn test_literals_and_truthiness() {
    assert_eq!(parse_literal("42"), json!(42));
    assert_eq!(parse_literal("\"quoted\""), json!("quoted"));
    assert_eq!(parse_literal("'single'"), json!("single"));
    assert_eq!(parse_literal("bare words"), json!("bare words"));

    assert!(truthy(&json!(1)));
    assert!(!truthy(&json!(0)));
    assert!(!truthy(&json!("")));
    assert!(!truthy(&json!([])));
    assert!(truthy(&json!({"k": null})));
    assert!(!truthy(&json!(null)));

    assert_eq!(type_name(&json!(1.5)), "float");
    assert_eq!(type_name(&json!(1)), "int");
    assert_eq!(type_name(&json!({})), "dict");
}

#[test]
fn test_check_shape_collects_problems() {
    let mut graph = WorkflowGraph::new("bad");
    graph.add_node(NodeSpec::new("a", "trigger", "manual"));
    graph.add_node(NodeSpec::new("a", "action", "wait"));
    graph.add_node(NodeSpec::new("b", "", "wait"));
    graph.connect("a", "missing");

    let err = graph.check_shape().unwrap_err();
    assert_eq!(err.issues.len(), 3);
    assert!(err.issues.iter().any(|i| i.message == "duplicate node id"));
    assert!(err.issues.iter().any(|i| i.key.as_deref() == Some("type")));
    assert!(err.issues.iter().any(|i| i.message.contains("'missing'")));
}

#[test]
fn test_check_shape_requires_entry_point() {
    let mut graph = WorkflowGraph::new("circular");
    graph.add_node(NodeSpec::new("a", "action", "wait"));
    graph.add_node(NodeSpec::new("b", "action", "wait"));
    graph.connect("a", "b");
    graph.connect("b", "a");

    let err = graph.check_shape().unwrap_err();
    assert!(err.issues[0].message.contains("no entry point"));

    assert!(two_step_graph().check_shape().is_ok());
    assert!(WorkflowGraph::new("empty").check_shape().is_ok());
}

#[test]
fn test_edge_branch_gating() {
    let plain = Edge::new("c", "x");
    assert!(plain.is_taken(None));
    assert!(plain.is_taken(Some("false")));

    let gated = Edge::new("c", "x").on_branch("true");
    assert!(gated.is_taken(Some("true")));
    assert!(!gated.is_taken(Some("false")));
    assert!(!gated.is_taken(None));
}

#[test]
fn test_graph_json_format() {
    let graph: WorkflowGraph = serde_json::from_value(json!({
        "name": "from json",
        "nodes": [
            {"id": "t", "type": "trigger", "subtype": "manual"},
            {"id": "c", "type": "condition", "subtype": "if_else", "config": {"condition": "true"},
             "retry": {"max_retries": 2}, "timeout_ms": 500},
        ],
        "edges": [{"source": "t", "target": "c"}],
        "settings": {"max_concurrency": 2},
    }))
    .unwrap();

    assert_eq!(graph.nodes.len(), 2);
    let condition = graph.find_node("c").unwrap();
    assert_eq!(condition.primitive_type, "condition");
    assert_eq!(condition.retry.as_ref().map(|r| r.max_attempts), Some(2));
    assert_eq!(condition.timeout_ms, Some(500));
    assert_eq!(graph.settings.max_concurrency, Some(2));
    assert_eq!(graph.incoming("c").count(), 1);

    let round: serde_json::Value = serde_json::to_value(&graph).unwrap();
    assert_eq!(round["nodes"][0]["type"], json!("trigger"));
    assert!(round["edges"][0].get("branch").is_none());
}

#[test]
fn test_graph_from_file() {
    let path = std::env::temp_dir().join(format!("graph-{}.json", Uuid::new_v4()));
    std::fs::write(&path, serde_json::to_vec(&two_step_graph()).unwrap()).unwrap();
    let graph = WorkflowGraph::from_file(&path).unwrap();
    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(graph.edges.len(), 1);

    std::fs::write(&path, b"{not json").unwrap();
    assert!(matches!(WorkflowGraph::from_file(&path), Err(FlowError::Serialization(_))));
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(WorkflowGraph::from_file(&path), Err(FlowError::Io(_))));
}

#[test]
fn test_context_is_write_once() {
    let mut context = ExecutionContext::new(json!({"seed": 1}));
    assert!(context.insert("a", json!(1)));
    assert!(!context.insert("a", json!(2)));
    assert_eq!(context.get("a"), Some(&json!(1)));

    let snapshot = context.snapshot();
    context.insert("b", json!(3));
    // A snapshot does not see later writes.
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.trigger_data(), &json!({"seed": 1}));
    assert_eq!(context.snapshot().to_map().len(), 2);
}

#[tokio::test]
async fn test_emitter_tags_events_with_run_and_node() {
    let bus = EventBus::new(8);
    let mut events = bus.subscribe();
    let run_id = Uuid::new_v4();

    let emitter = bus.create_emitter(run_id, "n1");
    emitter.info("hello");
    emitter.progress(50.0, None);

    match events.recv().await.unwrap() {
        ExecutionEvent::NodeEvent {
            run_id: id,
            node_id,
            event: NodeEvent::Info { message },
            ..
        } => {
            assert_eq!(id, run_id);
            assert_eq!(node_id, "n1");
            assert_eq!(message, "hello");
        }
        other => panic!("unexpected event {:?}", other),
    }
    let second = events.recv().await.unwrap();
    assert_eq!(second.run_id(), run_id);
}
