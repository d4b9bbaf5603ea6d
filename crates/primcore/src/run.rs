use crate::{ErrorKind, ExecutionError, NodeId, Value, WorkflowGraph, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub type RunId = Uuid;

/// Lifecycle of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeRunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeRunState::Succeeded | NodeRunState::Failed | NodeRunState::Skipped)
    }

    /// Transitions only move forward, except `failed -> running` on retry.
    pub fn can_transition_to(&self, next: NodeRunState) -> bool {
        use NodeRunState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Failed, Running)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRunState::Pending => "pending",
            NodeRunState::Ready => "ready",
            NodeRunState::Running => "running",
            NodeRunState::Succeeded => "succeeded",
            NodeRunState::Failed => "failed",
            NodeRunState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for NodeRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal transition of node '{node_id}' from {from} to {to}")]
pub struct InvalidTransition {
    pub node_id: NodeId,
    pub from: NodeRunState,
    pub to: NodeRunState,
}

/// One failed attempt, with enough detail to reconstruct the failure path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeErrorRecord {
    pub node_id: NodeId,
    pub attempt: u32,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub at: DateTime<Utc>,
}

impl NodeErrorRecord {
    pub fn new(node_id: impl Into<NodeId>, attempt: u32, error: &ExecutionError) -> Self {
        Self {
            node_id: node_id.into(),
            attempt,
            kind: error.kind,
            message: error.message.clone(),
            retryable: error.retryable,
            at: Utc::now(),
        }
    }
}

/// Per-node record kept on the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub primitive_type: String,
    pub state: NodeRunState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<NodeErrorRecord>,
}

/// Why a run did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub message: String,
    /// Error of the first node that failed, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_error: Option<NodeErrorRecord>,
    pub skipped: Vec<NodeId>,
}

/// Execution record of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    /// Every failed attempt, in the order they happened
    pub errors: Vec<NodeErrorRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl WorkflowRun {
    /// Fresh run: status running, every node pending.
    pub fn new(id: RunId, graph: &WorkflowGraph) -> Self {
        let nodes = graph
            .nodes
            .iter()
            .map(|node| {
                (
                    node.id.clone(),
                    NodeRecord {
                        primitive_type: node.primitive_type.clone(),
                        state: NodeRunState::Pending,
                        attempts: 0,
                        started_at: None,
                        finished_at: None,
                        last_error: None,
                    },
                )
            })
            .collect();

        Self {
            id,
            workflow_id: graph.id,
            workflow_name: graph.name.clone(),
            status: RunStatus::Running,
            nodes,
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            failure: None,
        }
    }

    pub fn state(&self, node_id: &str) -> Option<NodeRunState> {
        self.nodes.get(node_id).map(|record| record.state)
    }

    pub fn states(&self) -> BTreeMap<NodeId, NodeRunState> {
        self.nodes
            .iter()
            .map(|(id, record)| (id.clone(), record.state))
            .collect()
    }

    pub fn nodes_in(&self, state: NodeRunState) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, record)| record.state == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move a node to `to`, stamping start/finish times.
    pub fn transition(
        &mut self,
        node_id: &str,
        to: NodeRunState,
    ) -> Result<NodeRunState, InvalidTransition> {
        let record = self.nodes.get_mut(node_id).ok_or_else(|| InvalidTransition {
            node_id: node_id.to_string(),
            from: NodeRunState::Pending,
            to,
        })?;
        let from = record.state;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition {
                node_id: node_id.to_string(),
                from,
                to,
            });
        }

        record.state = to;
        let now = Utc::now();
        if to == NodeRunState::Running {
            record.attempts += 1;
            record.started_at.get_or_insert(now);
            record.finished_at = None;
        }
        if to.is_terminal() {
            record.finished_at = Some(now);
        }
        Ok(from)
    }

    pub fn attempts(&self, node_id: &str) -> u32 {
        self.nodes.get(node_id).map_or(0, |record| record.attempts)
    }

    /// Count another attempt for a node that stays running across a retry.
    /// Returns the new attempt number, or `None` if the node is not running.
    pub fn record_retry(&mut self, node_id: &str) -> Option<u32> {
        let record = self.nodes.get_mut(node_id)?;
        if record.state != NodeRunState::Running {
            return None;
        }
        record.attempts += 1;
        Some(record.attempts)
    }

    pub fn record_error(&mut self, error: NodeErrorRecord) {
        if let Some(record) = self.nodes.get_mut(&error.node_id) {
            record.last_error = Some(error.clone());
        }
        self.errors.push(error);
    }

    /// Close the run with a terminal status.
    pub fn finish(&mut self, status: RunStatus, failure: Option<RunFailure>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.failure = failure;
        self.finished_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.id,
            workflow_id: self.workflow_id,
            status: self.status,
            node_states: self.states(),
            attempts: self
                .nodes
                .iter()
                .map(|(id, record)| (id.clone(), record.attempts))
                .collect(),
            errors: self.errors.clone(),
            skipped: self.nodes_in(NodeRunState::Skipped),
            failure: self.failure.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Externally visible status of a run (`getRunStatus`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub node_states: BTreeMap<NodeId, NodeRunState>,
    pub attempts: BTreeMap<NodeId, u32>,
    pub errors: Vec<NodeErrorRecord>,
    pub skipped: Vec<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    pub fn state(&self, node_id: &str) -> Option<NodeRunState> {
        self.node_states.get(node_id).copied()
    }

    pub fn attempts(&self, node_id: &str) -> u32 {
        self.attempts.get(node_id).copied().unwrap_or(0)
    }
}

/// Result of a single node attempt, as written to the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub attempt: u32,
    pub outcome: NodeOutcome,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    Succeeded {
        output: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    Failed {
        error: ExecutionError,
    },
}

impl NodeResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, NodeOutcome::Succeeded { .. })
    }
}
