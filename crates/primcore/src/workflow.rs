use crate::{Config, ValidationError, ValidationIssue, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = String;

/// Complete workflow graph as produced by the generation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default = "Uuid::new_v4")]
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    /// Read a graph from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let graph = serde_json::from_reader(File::open(path)?)?;
        Ok(graph)
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// `target` depends on `source`.
    pub fn connect(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        self.edges.push(Edge::new(source, target));
    }

    /// Edge taken only when `source` (a condition) reports `branch`.
    pub fn connect_branch(
        &mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        branch: impl Into<String>,
    ) {
        self.edges.push(Edge::new(source, target).on_branch(branch));
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    /// Basic shape checks: unique ids, edge endpoints exist, an entry point exists.
    ///
    /// All problems are reported together.
    pub fn check_shape(&self) -> Result<(), ValidationError> {
        let mut issues = self.structure_issues();
        if !self.has_entry_point() {
            issues.push(ValidationIssue::new(
                "graph has no entry point (every node has an incoming edge)",
            ));
        }
        ValidationError::check(issues)
    }

    /// Whether some node has no incoming edge. An empty graph counts as having one.
    ///
    /// A non-empty graph without an entry point always contains a cycle.
    pub fn has_entry_point(&self) -> bool {
        self.nodes.is_empty()
            || self
                .nodes
                .iter()
                .any(|n| !self.edges.iter().any(|e| e.target == n.id))
    }

    /// Node id, type and edge endpoint problems, without the entry point check.
    pub fn structure_issues(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();

        for node in &self.nodes {
            if node.id.trim().is_empty() {
                issues.push(ValidationIssue::new("node id must not be empty"));
            } else if !seen.insert(node.id.as_str()) {
                issues.push(ValidationIssue::new("duplicate node id").at_node(node.id.clone()));
            }
            if node.primitive_type.trim().is_empty() {
                issues.push(
                    ValidationIssue::for_key("type", "missing primitive type")
                        .at_node(node.id.clone()),
                );
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !seen.contains(endpoint.as_str()) {
                    issues.push(ValidationIssue::new(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, endpoint
                    )));
                }
            }
        }

        issues
    }
}

/// Node specification in a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub primitive_type: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Config,
    /// Keys the node expects to find in its input data
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    /// Keys the node promises in its output
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl NodeSpec {
    pub fn new(
        id: impl Into<NodeId>,
        primitive_type: impl Into<String>,
        subtype: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            primitive_type: primitive_type.into(),
            subtype: subtype.into(),
            name: None,
            config: Config::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            retry: None,
            timeout_ms: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Dependency between two nodes: `target` runs after `source` succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    /// Branch label of a condition-gated edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            branch: None,
        }
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Whether the edge is followed given the source's reported branch.
    pub fn is_taken(&self, source_branch: Option<&str>) -> bool {
        match (&self.branch, source_branch) {
            (None, _) => true,
            (Some(label), Some(taken)) => label == taken,
            (Some(_), None) => false,
        }
    }
}

/// Retry policy for transient node failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    #[serde(alias = "max_retries")]
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_coefficient: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(
        mut self,
        initial_delay_ms: u64,
        backoff_coefficient: f64,
        max_delay_ms: u64,
    ) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self.backoff_coefficient = backoff_coefficient;
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based):
    /// `initial * coefficient^(attempt-1)`, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_coefficient.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }

    /// Whether another attempt may follow failed attempt `attempt`.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            backoff_coefficient: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

/// Per-workflow overrides of the engine limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}
