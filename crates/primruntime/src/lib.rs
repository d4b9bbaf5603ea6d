//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflow graphs: the primitive
//! registry, dependency resolution, the per-run coordinator and the record
//! store it reports to.

mod coordinator;
mod registry;
mod resolver;
mod runtime;
mod store;

pub use registry::PrimitiveRegistry;
pub use resolver::{DependencyGraph, Resolution};
pub use runtime::{Engine, EngineConfig, RunHandle};
pub use store::{MemoryRecordStore, RecordStore};
