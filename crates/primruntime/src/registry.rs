use primcore::{
    Config, ExecutionError, NodeContext, NodeOutput, PrimitiveExecutor, PrimitiveInfo,
    PrimitiveKind, ValidationError, ValidationIssue, WorkflowError, WorkflowGraph,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available primitive executors, keyed by primitive type name.
///
/// Built once before any run starts and then shared read-only behind an `Arc`;
/// each engine gets its own instance.
pub struct PrimitiveRegistry {
    executors: HashMap<String, Arc<dyn PrimitiveExecutor>>,
}

impl PrimitiveRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Bind a primitive type name to an executor.
    pub fn register(
        &mut self,
        primitive_type: impl Into<String>,
        executor: Arc<dyn PrimitiveExecutor>,
    ) -> Result<(), WorkflowError> {
        let primitive_type = primitive_type.into();
        if self.executors.contains_key(&primitive_type) {
            return Err(WorkflowError::DuplicateRegistration(primitive_type));
        }
        tracing::info!(
            primitive_type = %primitive_type,
            kind = %executor.kind(),
            "Registering primitive executor"
        );
        self.executors.insert(primitive_type, executor);
        Ok(())
    }

    /// Bind a type name, replacing any existing executor.
    pub fn register_override(
        &mut self,
        primitive_type: impl Into<String>,
        executor: Arc<dyn PrimitiveExecutor>,
    ) -> Option<Arc<dyn PrimitiveExecutor>> {
        let primitive_type = primitive_type.into();
        tracing::info!(primitive_type = %primitive_type, "Overriding primitive executor");
        self.executors.insert(primitive_type, executor)
    }

    pub fn unregister(&mut self, primitive_type: &str) -> Option<Arc<dyn PrimitiveExecutor>> {
        self.executors.remove(primitive_type)
    }

    pub fn get(&self, primitive_type: &str) -> Option<&Arc<dyn PrimitiveExecutor>> {
        self.executors.get(primitive_type)
    }

    pub fn contains(&self, primitive_type: &str) -> bool {
        self.executors.contains_key(primitive_type)
    }

    /// Registered type names, sorted.
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn describe(&self, primitive_type: &str) -> Option<PrimitiveInfo> {
        self.executors.get(primitive_type).map(|executor| PrimitiveInfo {
            primitive_type: primitive_type.to_string(),
            kind: executor.kind(),
            description: executor.description().to_string(),
            subtypes: executor.subtypes(),
        })
    }

    /// Check one node's configuration against its executor's schema.
    pub fn validate_node_config(
        &self,
        primitive_type: &str,
        subtype: &str,
        config: &Config,
    ) -> Result<(), WorkflowError> {
        let executor = self
            .executors
            .get(primitive_type)
            .ok_or_else(|| WorkflowError::UnknownPrimitive(primitive_type.to_string()))?;
        ValidationError::check(executor.validate_config(subtype, config))
            .map_err(WorkflowError::from)
    }

    /// Check every node of a graph, collecting all problems instead of stopping at the first.
    pub fn validate_graph(&self, graph: &WorkflowGraph) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        for node in &graph.nodes {
            match self.executors.get(&node.primitive_type) {
                Some(executor) => issues.extend(
                    executor
                        .validate_config(&node.subtype, &node.config)
                        .into_iter()
                        .map(|issue| issue.at_node(node.id.clone())),
                ),
                None => issues.push(
                    ValidationIssue::for_key(
                        "type",
                        format!("unknown primitive type '{}'", node.primitive_type),
                    )
                    .at_node(node.id.clone()),
                ),
            }
        }

        // Only condition nodes report a branch; a labelled edge from anything
        // else is never taken.
        for edge in &graph.edges {
            let Some(label) = &edge.branch else { continue };
            let Some(source) = graph.find_node(&edge.source) else {
                continue;
            };
            let Some(executor) = self.executors.get(&source.primitive_type) else {
                continue;
            };
            let kind = executor.kind();
            if kind != PrimitiveKind::Condition {
                issues.push(
                    ValidationIssue::for_key(
                        "branch",
                        format!(
                            "edge {} -> {} waits for branch '{}' but {} nodes never report one",
                            edge.source, edge.target, label, kind
                        ),
                    )
                    .at_node(source.id.clone()),
                );
            }
        }

        ValidationError::check(issues)
    }

    /// Look up the executor for `primitive_type` and run it.
    pub async fn dispatch(
        &self,
        primitive_type: &str,
        ctx: NodeContext,
    ) -> Result<NodeOutput, ExecutionError> {
        let executor = self
            .executors
            .get(primitive_type)
            .ok_or_else(|| ExecutionError::unknown_primitive(primitive_type))?;
        tracing::debug!(
            run_id = %ctx.run_id,
            node_id = %ctx.node_id,
            primitive_type,
            subtype = %ctx.subtype,
            attempt = ctx.attempt,
            "Dispatching node"
        );
        executor.execute(ctx).await
    }
}

impl Default for PrimitiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}
