use std::sync::Arc;

use anyhow::Result as WorkResult;
use petgraph::graph::NodeIndex;
use tracing::debug;

use crate::core::errors::{FlowError, Result};
use crate::flow::graph::FlowGraph;
use crate::flow::node::{NodeSlot, TaskHandle, Work};
use crate::flow::Framework;

/// Runtime context handed to a subflow task body.
///
/// Tasks emplaced here land in a fresh sub-region of the same owning graph
/// and are joined back into the spawning task: the spawning task does not
/// count as finished until every task spawned through this context has
/// completed. Edges may only connect tasks of this sub-region.
///
/// Spawned tasks are ephemeral by default: when the owning run repeats, they
/// are discarded at the iteration boundary and the body re-executes fresh.
/// [`Subflow::retain`] opts the expansion into surviving the remaining
/// iterations of the same run request, in which case the body is not re-run.
pub struct Subflow {
    graph: Arc<FlowGraph>,
    parent: NodeIndex,
    spawned: Vec<NodeIndex>,
    retain: bool,
}

impl Subflow {
    pub(crate) fn new(graph: Arc<FlowGraph>, parent: NodeIndex) -> Self {
        Self {
            graph,
            parent,
            spawned: Vec::new(),
            retain: false,
        }
    }

    /// Spawn a child task wrapping a plain work item.
    pub fn emplace<F>(&mut self, work: F) -> TaskHandle
    where
        F: Fn() -> WorkResult<()> + Send + Sync + 'static,
    {
        self.spawn(Work::Static(Arc::new(work)))
    }

    /// Spawn a child task that is itself a subflow. Nested subflows manage
    /// their own closure before counting toward this one's.
    pub fn emplace_subflow<F>(&mut self, work: F) -> TaskHandle
    where
        F: Fn(&mut Subflow) -> WorkResult<()> + Send + Sync + 'static,
    {
        self.spawn(Work::Subflow(Arc::new(work)))
    }

    /// Spawn a child task carrying no work.
    pub fn placeholder(&mut self) -> TaskHandle {
        self.spawn(Work::Placeholder)
    }

    /// Spawn a child module task embedding `other`'s graph.
    pub fn composed_of(&mut self, other: &Framework) -> TaskHandle {
        self.spawn(Work::Module(other.graph_arc()))
    }

    /// Add a precedence edge between two tasks spawned through this context.
    pub fn precede(&self, from: &TaskHandle, to: &TaskHandle) -> Result<()> {
        for handle in [from, to] {
            if handle.graph.id() != self.graph.id() || !self.spawned.contains(&handle.index) {
                return Err(FlowError::invalid_edge(format!(
                    "subflow edges must connect tasks spawned by this subflow (graph '{}')",
                    self.graph.label()
                )));
            }
        }
        self.graph.add_edge(from.index, to.index)
    }

    /// Keep this expansion across the remaining iterations of the current
    /// run request instead of discarding and re-spawning it.
    pub fn retain(&mut self, keep: bool) {
        self.retain = keep;
    }

    /// Number of tasks spawned through this context so far.
    pub fn num_spawned(&self) -> usize {
        self.spawned.len()
    }

    fn spawn(&mut self, work: Work) -> TaskHandle {
        let kind = work.kind();
        let index = self.graph.add_node(NodeSlot::spawned(work, self.parent));
        self.spawned.push(index);
        debug!(
            "graph '{}': subflow node {} spawned {} child {}",
            self.graph.label(),
            self.parent.index(),
            kind,
            index.index()
        );
        TaskHandle {
            graph: self.graph.clone(),
            index,
        }
    }

    /// Consumed by the dispatcher after the body returns.
    pub(crate) fn into_parts(self) -> (Vec<NodeIndex>, bool) {
        (self.spawned, self.retain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_scoped_to_sub_region() {
        let graph = FlowGraph::new();
        let parent = graph.add_node(NodeSlot::new(Work::Placeholder));
        let outside = TaskHandle {
            graph: graph.clone(),
            index: graph.add_node(NodeSlot::new(Work::Placeholder)),
        };

        let mut sf = Subflow::new(graph.clone(), parent);
        let a = sf.emplace(|| Ok(()));
        let b = sf.emplace(|| Ok(()));

        sf.precede(&a, &b).unwrap();
        let err = sf.precede(&a, &outside).unwrap_err();
        assert!(matches!(err, FlowError::InvalidEdge { .. }));
    }

    #[test]
    fn test_spawned_children_are_ephemeral() {
        let graph = FlowGraph::new();
        let parent = graph.add_node(NodeSlot::new(Work::Placeholder));

        let mut sf = Subflow::new(graph.clone(), parent);
        let child = sf.emplace(|| Ok(()));

        let nodes = graph.read();
        assert!(nodes[child.index].ephemeral);
        assert_eq!(nodes[child.index].parent, Some(parent));
        assert_eq!(sf.num_spawned(), 1);
    }
}
