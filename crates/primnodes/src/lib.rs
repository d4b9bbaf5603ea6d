//! Built-in primitive executors
//!
//! One executor per primitive kind. Each handles a fixed set of subtypes and
//! checks node configuration against a per-subtype key schema.

mod action;
mod condition;
mod connection;
mod data;
mod http;
mod operator;
mod trigger;

pub use action::ActionExecutor;
pub use condition::ConditionExecutor;
pub use connection::ConnectionExecutor;
pub use data::DataExecutor;
pub use trigger::TriggerExecutor;

use chrono::Utc;
use primcore::{Config, PrimitiveExecutor, PrimitiveKind, ValidationIssue, Value, WorkflowError};
use primruntime::PrimitiveRegistry;
use std::sync::Arc;

fn builtins() -> [(PrimitiveKind, Arc<dyn PrimitiveExecutor>); 5] {
    [
        (PrimitiveKind::Trigger, Arc::new(TriggerExecutor)),
        (PrimitiveKind::Action, Arc::new(ActionExecutor::new())),
        (PrimitiveKind::Connection, Arc::new(ConnectionExecutor::new())),
        (PrimitiveKind::Condition, Arc::new(ConditionExecutor)),
        (PrimitiveKind::Data, Arc::new(DataExecutor)),
    ]
}

/// Register all built-in executors under their kind names
pub fn register_all(registry: &mut PrimitiveRegistry) -> Result<(), WorkflowError> {
    for (kind, executor) in builtins() {
        registry.register(kind.as_str(), executor)?;
    }
    Ok(())
}

/// Fresh registry holding every built-in executor.
pub fn default_registry() -> PrimitiveRegistry {
    let mut registry = PrimitiveRegistry::new();
    for (kind, executor) in builtins() {
        registry.register_override(kind.as_str(), executor);
    }
    registry
}

pub(crate) fn unsupported_subtype(kind: PrimitiveKind, subtype: &str) -> ValidationIssue {
    ValidationIssue::for_key("subtype", format!("unsupported {} subtype '{}'", kind, subtype))
}

/// Report `key` when it is present but fails `accepts`.
pub(crate) fn check_value(
    config: &Config,
    key: &str,
    expected: &str,
    accepts: impl Fn(&Value) -> bool,
    issues: &mut Vec<ValidationIssue>,
) {
    if let Some(value) = config.get(key) {
        if !accepts(value) {
            issues.push(ValidationIssue::for_key(key, format!("expected {}", expected)));
        }
    }
}

pub(crate) fn timestamp() -> Value {
    Value::String(Utc::now().to_rfc3339())
}
