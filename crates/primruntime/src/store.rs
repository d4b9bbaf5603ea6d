use async_trait::async_trait;
use primcore::{NodeResult, RunId, StoreError, WorkflowRun};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Durable log of runs and per-node attempt results.
///
/// The coordinator writes every state transition with `save_run_state`
/// before it dispatches the next batch of nodes, and every attempt with
/// `save_node_result`. The storage format is up to the implementation.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save_run_state(&self, run: &WorkflowRun) -> Result<(), StoreError>;

    async fn save_node_result(
        &self,
        run_id: RunId,
        node_id: &str,
        result: &NodeResult,
    ) -> Result<(), StoreError>;

    async fn load_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>, StoreError>;

    /// Attempt results of a run in the order they were written.
    async fn node_results(&self, run_id: RunId) -> Result<Vec<NodeResult>, StoreError>;
}

#[derive(Default)]
struct MemoryRecords {
    runs: HashMap<RunId, WorkflowRun>,
    history: HashMap<RunId, Vec<WorkflowRun>>,
    results: HashMap<RunId, Vec<NodeResult>>,
}

/// Process-local record store; keeps every saved revision of each run.
///
/// Nothing is dropped on its own: long-lived processes call `purge` once a
/// run's records are no longer needed.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<MemoryRecords>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every revision saved for a run, oldest first.
    pub async fn revisions(&self, run_id: RunId) -> Vec<WorkflowRun> {
        self.records
            .read()
            .await
            .history
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop everything recorded for a run. Returns whether anything was held.
    pub async fn purge(&self, run_id: RunId) -> bool {
        let mut records = self.records.write().await;
        let held = records.runs.remove(&run_id).is_some();
        records.history.remove(&run_id);
        records.results.remove(&run_id);
        held
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save_run_state(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.runs.insert(run.id, run.clone());
        records.history.entry(run.id).or_default().push(run.clone());
        Ok(())
    }

    async fn save_node_result(
        &self,
        run_id: RunId,
        node_id: &str,
        result: &NodeResult,
    ) -> Result<(), StoreError> {
        if result.node_id != node_id {
            return Err(StoreError::Backend(format!(
                "result for node '{}' filed under '{}'",
                result.node_id, node_id
            )));
        }
        let mut records = self.records.write().await;
        records.results.entry(run_id).or_default().push(result.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self.records.read().await.runs.get(&run_id).cloned())
    }

    async fn node_results(&self, run_id: RunId) -> Result<Vec<NodeResult>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .results
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}
