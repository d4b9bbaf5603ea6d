//! Core abstractions for the primitive workflow engine
//!
//! This crate provides the data model (graphs, run records, execution
//! context), the error taxonomy and the executor trait that all other
//! components depend on. It has no scheduling logic of its own.

mod context;
mod error;
pub mod events;
mod node;
mod run;
pub mod schema;
pub mod value;
mod workflow;

pub use context::{ContextSnapshot, ExecutionContext};
pub use error::{
    ErrorKind, ExecutionError, FlowError, StoreError, ValidationError, ValidationIssue,
    WorkflowError,
};
pub use events::*;
pub use node::{NodeContext, NodeOutput, PrimitiveExecutor, PrimitiveInfo, PrimitiveKind};
pub use run::{
    InvalidTransition, NodeErrorRecord, NodeOutcome, NodeRecord, NodeResult, NodeRunState,
    RunFailure, RunId, RunSnapshot, RunStatus, WorkflowRun,
};
pub use schema::ConfigSchema;
pub use value::{Config, ConfigExt, Value};
pub use workflow::{
    Edge, NodeId, NodeSpec, RetryPolicy, WorkflowGraph, WorkflowId, WorkflowSettings,
};

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, FlowError>;
