use std::sync::Arc;

use anyhow::Result as WorkResult;
use petgraph::algo::is_cyclic_directed;
use tracing::debug;

use crate::core::errors::{FlowError, Result};
use crate::exec::Subflow;
use crate::flow::graph::FlowGraph;
use crate::flow::node::{NodeSlot, TaskHandle, Work};

/// A named, standalone, reusable task graph, independent of any executor.
///
/// A framework is the user-facing building surface: emplace tasks, wire
/// precedence through [`TaskHandle::precede`], embed other frameworks with
/// [`Framework::composed_of`], then hand it to an
/// [`Executor`](crate::exec::Executor), possibly many times. The framework's
/// lifetime is entirely caller-managed; the engine never consumes it.
///
/// Builder calls fail with `ConcurrentGraphMutation` while any run against
/// this framework is active. That check is best-effort - mutating a running
/// framework from a racing thread remains undefined behavior by contract.
pub struct Framework {
    graph: Arc<FlowGraph>,
}

impl Framework {
    /// Create an empty, unnamed framework.
    pub fn new() -> Self {
        Self {
            graph: FlowGraph::new(),
        }
    }

    /// Create an empty framework with a diagnostic name.
    pub fn named<S: Into<String>>(name: S) -> Self {
        let fw = Self::new();
        fw.graph.set_name(name.into());
        fw
    }

    /// Assign a diagnostic name. No behavioral effect.
    pub fn set_name<S: Into<String>>(&self, name: S) {
        self.graph.set_name(name.into());
    }

    /// The framework's diagnostic name, if one was assigned.
    pub fn name(&self) -> Option<String> {
        self.graph.name()
    }

    /// Add a task wrapping a plain work item.
    pub fn emplace<F>(&self, work: F) -> Result<TaskHandle>
    where
        F: Fn() -> WorkResult<()> + Send + Sync + 'static,
    {
        self.add(Work::Static(Arc::new(work)))
    }

    /// Add a task whose body may spawn further tasks through a [`Subflow`]
    /// context while it runs.
    pub fn emplace_subflow<F>(&self, work: F) -> Result<TaskHandle>
    where
        F: Fn(&mut Subflow) -> WorkResult<()> + Send + Sync + 'static,
    {
        self.add(Work::Subflow(Arc::new(work)))
    }

    /// Add a task carrying no work: edges only.
    pub fn placeholder(&self) -> Result<TaskHandle> {
        self.add(Work::Placeholder)
    }

    /// Add a module task that runs `other`'s entire graph as a nested,
    /// mutually exclusive unit: concurrent module tasks referencing the same
    /// framework are serialized, never interleaved.
    pub fn composed_of(&self, other: &Framework) -> Result<TaskHandle> {
        if other.graph.id() == self.graph.id() {
            return Err(FlowError::invalid_edge(format!(
                "framework '{}' cannot embed itself",
                self.graph.label()
            )));
        }
        self.add(Work::Module(other.graph.clone()))
    }

    /// Total number of tasks currently in the graph, including any
    /// dynamically spawned tasks still present from the latest run.
    pub fn num_tasks(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.num_tasks() == 0
    }

    /// Handles to all declared tasks with zero in-degree.
    pub fn source_tasks(&self) -> Vec<TaskHandle> {
        self.graph
            .source_indices()
            .into_iter()
            .map(|index| TaskHandle {
                graph: self.graph.clone(),
                index,
            })
            .collect()
    }

    /// Opt-in cycle check. The engine itself never detects cycles: running a
    /// cyclic graph deadlocks permanently by contract.
    pub fn validate(&self) -> Result<()> {
        if is_cyclic_directed(&*self.graph.read()) {
            return Err(FlowError::invalid_edge(format!(
                "graph '{}' contains a cycle",
                self.graph.label()
            )));
        }
        Ok(())
    }

    pub(crate) fn graph_arc(&self) -> Arc<FlowGraph> {
        self.graph.clone()
    }

    fn add(&self, work: Work) -> Result<TaskHandle> {
        self.graph.check_mutable()?;
        let kind = work.kind();
        let index = self.graph.add_node(NodeSlot::new(work));
        debug!(
            "graph '{}': added {} node {}",
            self.graph.label(),
            kind,
            index.index()
        );
        Ok(TaskHandle {
            graph: self.graph.clone(),
            index,
        })
    }
}

impl Default for Framework {
    fn default() -> Self {
        Self::new()
    }
}
