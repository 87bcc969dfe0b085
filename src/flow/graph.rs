use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::Direction;
use tracing::debug;

use crate::core::errors::{FlowError, Result};
use crate::flow::node::{NodeSlot, TaskHandle};

/// Process-unique graph identities, used to tag task handles so cross-graph
/// edges can be rejected at build time.
static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type NodeStore = StableDiGraph<NodeSlot, ()>;

/// The owned collection of nodes and precedence edges forming one DAG.
///
/// The store is a stable graph so that ephemeral nodes spawned by subflows
/// can be discarded between iterations without invalidating the indices of
/// surviving nodes. Node counters are atomics mutated under the read lock;
/// structural mutation takes the write lock. Cycles are a configuration
/// error producing permanent deadlock - they are not detected at run time
/// (`Framework::validate` offers an opt-in check).
pub(crate) struct FlowGraph {
    id: u64,
    name: RwLock<Option<String>>,
    nodes: RwLock<NodeStore>,
    /// A topology referencing this graph is queued or executing.
    active: AtomicBool,
}

impl FlowGraph {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            name: RwLock::new(None),
            nodes: RwLock::new(NodeStore::new()),
            active: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_name(&self, name: String) {
        *write_lock(&self.name) = Some(name);
    }

    pub(crate) fn name(&self) -> Option<String> {
        read_lock(&self.name).clone()
    }

    /// Display label: the framework name, or a positional fallback.
    pub(crate) fn label(&self) -> String {
        self.name().unwrap_or_else(|| format!("graph_{}", self.id))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Fail builder calls issued while a topology is active. Best-effort by
    /// contract; races the flag misses are the caller's obligation.
    pub(crate) fn check_mutable(&self) -> Result<()> {
        if self.is_active() {
            return Err(FlowError::concurrent_mutation(self.label()));
        }
        Ok(())
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, NodeStore> {
        read_lock(&self.nodes)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, NodeStore> {
        write_lock(&self.nodes)
    }

    pub(crate) fn add_node(&self, slot: NodeSlot) -> NodeIndex {
        self.write().add_node(slot)
    }

    pub(crate) fn node_count(&self) -> usize {
        self.read().node_count()
    }

    pub(crate) fn set_node_name(&self, index: NodeIndex, name: String) {
        let mut nodes = self.write();
        if let Some(slot) = nodes.node_weight_mut(index) {
            slot.name = Some(name);
        }
    }

    pub(crate) fn node_name(&self, index: NodeIndex) -> Option<String> {
        self.read().node_weight(index).and_then(|s| s.name.clone())
    }

    /// Add the edge `from -> to`, bumping the target's live dependency
    /// counter so edges created mid-run (subflow sub-regions) stay coherent.
    /// Both endpoints must already belong to this graph.
    pub(crate) fn add_edge(&self, from: NodeIndex, to: NodeIndex) -> Result<()> {
        if from == to {
            return Err(FlowError::invalid_edge(format!(
                "self-loop on node {} of graph '{}'",
                from.index(),
                self.label()
            )));
        }
        let mut nodes = self.write();
        nodes.add_edge(from, to, ());
        nodes[to].join.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Edge creation for the public builder surface: checks the graph-id tag
    /// on the target handle and the mutation flag before linking.
    pub(crate) fn link(&self, from: NodeIndex, to: &TaskHandle) -> Result<()> {
        if to.graph.id() != self.id {
            return Err(FlowError::invalid_edge(format!(
                "endpoints belong to different graphs ('{}' and '{}')",
                self.label(),
                to.graph.label()
            )));
        }
        self.check_mutable()?;
        self.add_edge(from, to.index)
    }

    /// Indices of declared (non-ephemeral) nodes with zero in-degree.
    ///
    /// An isolated node is both a source and a terminal leaf and still
    /// participates in the join count exactly once.
    pub(crate) fn source_indices(&self) -> Vec<NodeIndex> {
        let nodes = self.read();
        nodes
            .node_indices()
            .filter(|&i| {
                !nodes[i].ephemeral && nodes.edges_directed(i, Direction::Incoming).count() == 0
            })
            .collect()
    }

    /// Bring the graph into a runnable state for the next iteration: discard
    /// stale ephemeral nodes and reset every counter to its static in-degree.
    ///
    /// `fresh` discards the whole dynamic expansion (a new run request starts
    /// from the declared graph); otherwise only sub-regions whose spawning
    /// subflow did not opt into retention are discarded. Callers must ensure
    /// no worker holds an in-flight node of this graph, which the per-graph
    /// topology serialization guarantees.
    pub(crate) fn prepare_iteration(&self, fresh: bool) {
        let mut nodes = self.write();

        let stale: Vec<NodeIndex> = nodes
            .node_indices()
            .filter(|&i| nodes[i].ephemeral && (fresh || !lineage_retained(&nodes, i)))
            .collect();
        if !stale.is_empty() {
            debug!(
                "graph '{}': discarding {} ephemeral node(s)",
                self.label(),
                stale.len()
            );
            for &i in &stale {
                nodes.remove_node(i);
            }
        }

        let indices: Vec<NodeIndex> = nodes.node_indices().collect();
        for i in indices {
            let in_degree = nodes.edges_directed(i, Direction::Incoming).count();
            let slot = &mut nodes[i];
            slot.join.store(in_degree, Ordering::Release);
            slot.child_join.store(0, Ordering::Release);
            slot.children.retain(|c| {
                // `children` may reference nodes discarded above
                !stale.contains(c)
            });
            if slot.children.is_empty() {
                slot.expanded = false;
            }
        }
    }
}

/// A retained expansion survives only while every spawning subflow on its
/// parent chain opted in; a discarded ancestor takes its sub-region with it.
fn lineage_retained(nodes: &NodeStore, start: NodeIndex) -> bool {
    let mut cursor = start;
    loop {
        match nodes[cursor].parent {
            Some(parent) => {
                if !nodes[parent].retained {
                    return false;
                }
                if !nodes[parent].ephemeral {
                    return true;
                }
                cursor = parent;
            }
            None => return true,
        }
    }
}

/// Poison-tolerant lock helpers: a panic in a task body can never poison
/// these locks (they are not held across user code), so recover the guard
/// instead of propagating.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Shared helper for counters loaded in scheduling paths.
pub(crate) fn load_join(nodes: &NodeStore, index: NodeIndex) -> usize {
    nodes[index].join.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::node::Work;

    fn placeholder_slot() -> NodeSlot {
        NodeSlot::new(Work::Placeholder)
    }

    #[test]
    fn test_source_indices_ignore_ephemeral() {
        let graph = FlowGraph::new();
        let a = graph.add_node(placeholder_slot());
        let b = graph.add_node(placeholder_slot());
        graph.add_edge(a, b).unwrap();
        let spawned = graph.add_node(NodeSlot::spawned(Work::Placeholder, a));

        let sources = graph.source_indices();
        assert_eq!(sources, vec![a]);
        assert!(!sources.contains(&spawned));
    }

    #[test]
    fn test_self_loop_rejected() {
        let graph = FlowGraph::new();
        let a = graph.add_node(placeholder_slot());
        let err = graph.add_edge(a, a).unwrap_err();
        assert!(matches!(err, FlowError::InvalidEdge { .. }));
    }

    #[test]
    fn test_prepare_iteration_resets_counters_and_discards() {
        let graph = FlowGraph::new();
        let a = graph.add_node(placeholder_slot());
        let b = graph.add_node(placeholder_slot());
        graph.add_edge(a, b).unwrap();
        let child = graph.add_node(NodeSlot::spawned(Work::Placeholder, a));
        {
            let mut nodes = graph.write();
            nodes[a].children.push(child);
            nodes[a].expanded = true;
        }

        graph.prepare_iteration(true);

        let nodes = graph.read();
        assert_eq!(nodes.node_count(), 2);
        assert_eq!(load_join(&nodes, a), 0);
        assert_eq!(load_join(&nodes, b), 1);
        assert!(!nodes[a].expanded);
        assert!(nodes[a].children.is_empty());
    }

    #[test]
    fn test_retained_expansion_survives_reset() {
        let graph = FlowGraph::new();
        let sub = graph.add_node(placeholder_slot());
        let child = graph.add_node(NodeSlot::spawned(Work::Placeholder, sub));
        {
            let mut nodes = graph.write();
            nodes[sub].children.push(child);
            nodes[sub].retained = true;
            nodes[sub].expanded = true;
        }

        graph.prepare_iteration(false);

        let nodes = graph.read();
        assert_eq!(nodes.node_count(), 2);
        assert!(nodes[sub].expanded);
        assert_eq!(nodes[sub].children, vec![child]);
    }
}
