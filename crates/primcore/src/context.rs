use crate::{NodeId, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Accumulated node outputs of a single run.
///
/// Append-only: each node id is written at most once. Owned by the run's
/// coordinator; executors only ever see a [`ContextSnapshot`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    trigger_data: Arc<Value>,
    outputs: BTreeMap<NodeId, Arc<Value>>,
}

impl ExecutionContext {
    pub fn new(trigger_data: Value) -> Self {
        Self {
            trigger_data: Arc::new(trigger_data),
            outputs: BTreeMap::new(),
        }
    }

    /// Record a node's output. Returns `false` (and keeps the first value) if
    /// the node already has one.
    pub fn insert(&mut self, node_id: impl Into<NodeId>, output: Value) -> bool {
        match self.outputs.entry(node_id.into()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(Arc::new(output));
                true
            }
        }
    }

    pub fn get(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id).map(Arc::as_ref)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.outputs.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn trigger_data(&self) -> &Value {
        &self.trigger_data
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            trigger_data: Arc::clone(&self.trigger_data),
            outputs: Arc::new(self.outputs.clone()),
        }
    }
}

/// Read-only view of an [`ExecutionContext`] at dispatch time.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    trigger_data: Arc<Value>,
    outputs: Arc<BTreeMap<NodeId, Arc<Value>>>,
}

impl ContextSnapshot {
    pub fn get(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id).map(Arc::as_ref)
    }

    pub fn trigger_data(&self) -> &Value {
        &self.trigger_data
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Value)> {
        self.outputs.iter().map(|(id, value)| (id, value.as_ref()))
    }

    /// Owned copy of every output, keyed by node id.
    pub fn to_map(&self) -> BTreeMap<NodeId, Value> {
        self.iter().map(|(id, value)| (id.clone(), value.clone())).collect()
    }
}
