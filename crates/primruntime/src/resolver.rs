use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::Direction;
use primcore::{Edge, NodeId, NodeRunState, WorkflowError, WorkflowGraph};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Pending nodes whose dependencies are all satisfied, ascending by id
    pub ready: Vec<NodeId>,
    /// Pending nodes that can never run, in topological order
    pub skipped: Vec<NodeId>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.skipped.is_empty()
    }
}

/// Dependency graph of a workflow: an edge `a -> b` means `b` waits for `a`.
pub struct DependencyGraph {
    graph: DiGraph<NodeId, Edge>,
    index: HashMap<NodeId, NodeIndex>,
    /// Kahn order with ascending-id tie break; partial when the graph has a cycle
    order: Vec<NodeIndex>,
}

impl DependencyGraph {
    pub fn build(workflow: &WorkflowGraph) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in &workflow.nodes {
            let idx = graph.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        for edge in &workflow.edges {
            let source = index
                .get(&edge.source)
                .ok_or_else(|| WorkflowError::NodeNotFound(edge.source.clone()))?;
            let target = index
                .get(&edge.target)
                .ok_or_else(|| WorkflowError::NodeNotFound(edge.target.clone()))?;
            graph.add_edge(*source, *target, edge.clone());
        }

        let order = kahn_order(&graph);
        Ok(Self { graph, index, order })
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Execution order if the graph is acyclic, otherwise every node sitting on a cycle.
    pub fn topological_check(&self) -> Result<Vec<NodeId>, WorkflowError> {
        if self.order.len() == self.graph.node_count() {
            return Ok(self.order.iter().map(|idx| self.graph[*idx].clone()).collect());
        }

        let mut nodes: Vec<NodeId> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .flatten()
            .map(|idx| self.graph[idx].clone())
            .collect();
        nodes.sort();
        Err(WorkflowError::Cycle { nodes })
    }

    pub fn is_acyclic(&self) -> bool {
        self.order.len() == self.graph.node_count()
    }

    /// Compute which pending nodes can run now and which can never run.
    ///
    /// A pending node is ready when every incoming edge comes from a succeeded
    /// source and is taken. A pending node with an incoming edge from a failed
    /// or skipped source, or a gated edge that was not taken, is skipped.
    /// Skips are applied in topological order so they propagate forward
    /// within the same pass.
    pub fn resolve(
        &self,
        states: &BTreeMap<NodeId, NodeRunState>,
        branches: &HashMap<NodeId, String>,
    ) -> Resolution {
        let mut resolution = Resolution::default();
        let mut skipped: HashSet<NodeIndex> = HashSet::new();

        let state_of = |idx: NodeIndex, skipped: &HashSet<NodeIndex>| {
            if skipped.contains(&idx) {
                NodeRunState::Skipped
            } else {
                states
                    .get(&self.graph[idx])
                    .copied()
                    .unwrap_or(NodeRunState::Pending)
            }
        };

        for &idx in &self.order {
            if state_of(idx, &skipped) != NodeRunState::Pending {
                continue;
            }

            let mut satisfied = true;
            let mut dead = false;
            for edge in self.graph.edges_directed(idx, Direction::Incoming) {
                let source = edge.source();
                match state_of(source, &skipped) {
                    NodeRunState::Succeeded => {
                        let branch = branches.get(&self.graph[source]).map(String::as_str);
                        if !edge.weight().is_taken(branch) {
                            dead = true;
                        }
                    }
                    NodeRunState::Failed | NodeRunState::Skipped => dead = true,
                    _ => satisfied = false,
                }
            }

            let id = &self.graph[idx];
            if dead {
                skipped.insert(idx);
                resolution.skipped.push(id.clone());
            } else if satisfied {
                resolution.ready.push(id.clone());
            }
        }

        resolution.ready.sort();
        resolution
    }

    /// Direct dependencies of a node, ascending by id.
    pub fn upstream(&self, node_id: &str) -> Vec<NodeId> {
        let Some(&idx) = self.index.get(node_id) else {
            return Vec::new();
        };
        let sources: BTreeSet<NodeId> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|source| self.graph[source].clone())
            .collect();
        sources.into_iter().collect()
    }

    /// Every node transitively depending on `node_id`, ascending by id.
    pub fn downstream(&self, node_id: &str) -> Vec<NodeId> {
        let Some(&start) = self.index.get(node_id) else {
            return Vec::new();
        };
        let mut reached = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != start {
                reached.insert(self.graph[idx].clone());
            }
        }
        reached.into_iter().collect()
    }

    /// Nodes without incoming edges, ascending by id.
    pub fn entry_points(&self) -> Vec<NodeId> {
        let mut entries: Vec<NodeId> = self
            .graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].clone())
            .collect();
        entries.sort();
        entries
    }
}

/// Kahn's algorithm, always releasing the smallest ready id first.
fn kahn_order(graph: &DiGraph<NodeId, Edge>) -> Vec<NodeIndex> {
    let mut indegree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.edges_directed(idx, Direction::Incoming).count()))
        .collect();

    let mut ready: BTreeSet<(&str, NodeIndex)> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(idx, _)| (graph[*idx].as_str(), *idx))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some((_, idx)) = ready.pop_first() {
        order.push(idx);
        for edge in graph.edges_directed(idx, Direction::Outgoing) {
            let target = edge.target();
            if let Some(degree) = indegree.get_mut(&target) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert((graph[target].as_str(), target));
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use primcore::NodeSpec;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> WorkflowGraph {
        let mut workflow = WorkflowGraph::new("test");
        for id in nodes {
            workflow.add_node(NodeSpec::new(*id, "data", "mapping"));
        }
        for (source, target) in edges {
            workflow.connect(*source, *target);
        }
        workflow
    }

    #[test]
    fn test_kahn_breaks_ties_by_id() {
        let workflow = graph(&["c", "a", "b", "d"], &[("c", "d"), ("a", "d")]);
        let deps = DependencyGraph::build(&workflow).unwrap();
        assert_eq!(deps.topological_check().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let workflow = graph(&["a", "b"], &[("a", "b"), ("b", "b")]);
        let deps = DependencyGraph::build(&workflow).unwrap();
        match deps.topological_check() {
            Err(WorkflowError::Cycle { nodes }) => assert_eq!(nodes, vec!["b"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }
}
