use crate::{
    events::EventEmitter, schema::ConfigSchema, Config, ContextSnapshot, ExecutionError, NodeId,
    RunId, ValidationIssue, Value,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// The five primitive kinds a workflow node can be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    Trigger,
    Action,
    Connection,
    Condition,
    Data,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 5] = [
        PrimitiveKind::Trigger,
        PrimitiveKind::Action,
        PrimitiveKind::Connection,
        PrimitiveKind::Condition,
        PrimitiveKind::Data,
    ];

    /// Registry name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveKind::Trigger => "trigger",
            PrimitiveKind::Action => "action",
            PrimitiveKind::Connection => "connection",
            PrimitiveKind::Condition => "condition",
            PrimitiveKind::Data => "data",
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrimitiveKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PrimitiveKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown primitive kind '{}'", s))
    }
}

/// Core trait that every primitive executor implements
#[async_trait]
pub trait PrimitiveExecutor: Send + Sync {
    fn kind(&self) -> PrimitiveKind;

    /// Subtypes this executor understands, in display order.
    fn subtypes(&self) -> Vec<&'static str>;

    /// Accepted configuration keys for a subtype; `None` for an unknown subtype.
    fn schema(&self, subtype: &str) -> Option<ConfigSchema>;

    /// Execute one node against its input data and the run's context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, ExecutionError>;

    /// Check a node's configuration, reporting every offending key.
    ///
    /// The default checks the subtype's schema; executors extend it with
    /// value-level checks.
    fn validate_config(&self, subtype: &str, config: &Config) -> Vec<ValidationIssue> {
        match self.schema(subtype) {
            Some(schema) => schema.check(config),
            None => vec![ValidationIssue::for_key(
                "subtype",
                format!("unsupported {} subtype '{}'", self.kind(), subtype),
            )],
        }
    }

    fn description(&self) -> &str {
        ""
    }
}

/// Execution context handed to an executor for one attempt
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub subtype: String,

    /// Static configuration for this node
    pub config: Config,

    /// Data flowing in from upstream nodes (or the trigger payload for entry nodes)
    pub input: Value,

    /// Outputs of every node that finished before this one was dispatched
    pub context: ContextSnapshot,

    /// 1-based attempt number
    pub attempt: u32,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancelled when the run is cancelled or times out
    pub cancellation: CancellationToken,
}

impl NodeContext {
    /// Input narrowed by the optional `path` config key.
    pub fn operand(&self) -> Result<&Value, ExecutionError> {
        match self.config.get("path").and_then(Value::as_str) {
            Some(path) => crate::value::lookup(&self.input, path).ok_or_else(|| {
                ExecutionError::invalid_data(format!("input has no value at path '{}'", path))
            }),
            None => Ok(&self.input),
        }
    }

    /// Trigger payload the run was started with.
    pub fn trigger_data(&self) -> &Value {
        self.context.trigger_data()
    }
}

/// Output from one successful execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub data: Value,

    /// Branch reported by a condition; gates labelled outgoing edges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl NodeOutput {
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            branch: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// Description of a registered primitive type, for listings
#[derive(Debug, Clone, Serialize)]
pub struct PrimitiveInfo {
    pub primitive_type: String,
    pub kind: PrimitiveKind,
    pub description: String,
    pub subtypes: Vec<&'static str>,
}
