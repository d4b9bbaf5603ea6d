use crate::{NodeId, RunId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure classes an executor can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    Credentials,
    InvalidData,
    Configuration,
    UnknownPrimitive,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Credentials => "credentials",
            ErrorKind::InvalidData => "invalid_data",
            ErrorKind::Configuration => "configuration",
            ErrorKind::UnknownPrimitive => "unknown_primitive",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure returned by a primitive executor.
///
/// `retryable` decides whether the coordinator applies the retry policy or
/// fails the node on the spot.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// A failure worth retrying (network blips, timeouts).
    pub fn transient(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, true)
    }

    /// A failure that will not go away on its own.
    pub fn permanent(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, false)
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::permanent(ErrorKind::InvalidData, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::permanent(ErrorKind::Configuration, message)
    }

    pub fn unknown_primitive(primitive_type: &str) -> Self {
        Self::permanent(
            ErrorKind::UnknownPrimitive,
            format!("no executor registered for primitive type '{}'", primitive_type),
        )
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::transient(ErrorKind::Timeout, format!("timed out after {}ms", after_ms))
    }

    pub fn cancelled() -> Self {
        Self::permanent(ErrorKind::Cancelled, "execution cancelled")
    }
}

/// A single problem found while validating a graph or node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            key: None,
            message: message.into(),
        }
    }

    pub fn for_key(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            key: Some(key.into()),
            message: message.into(),
        }
    }

    pub fn at_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node_id) = &self.node_id {
            write!(f, "node '{}': ", node_id)?;
        }
        if let Some(key) = &self.key {
            write!(f, "'{}': ", key)?;
        }
        f.write_str(&self.message)
    }
}

/// Every issue found in one validation pass.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    /// `Ok(())` when nothing was found, otherwise all issues at once.
    pub fn check(issues: Vec<ValidationIssue>) -> Result<(), ValidationError> {
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Self::new(issues))
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation issue(s)", self.issues.len())?;
        for issue in &self.issues {
            write!(f, "; {}", issue)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    #[error("Cyclic dependency detected between nodes: {}", .nodes.join(", "))]
    Cycle { nodes: Vec<NodeId> },

    #[error("Unknown primitive type: {0}")]
    UnknownPrimitive(String),

    #[error("Primitive type already registered: {0}")]
    DuplicateRegistration(String),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {0} has not reached a terminal status")]
    RunNotTerminal(RunId),

    #[error("Run already exists: {0}")]
    DuplicateRun(RunId),
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage backend failure: {0}")]
    Backend(String),
}
